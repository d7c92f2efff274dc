use crate::config::AccountEntry;
use crate::error::EngineError;
use crate::err_from;
use std::str::FromStr;
use web3::types::Address;

/// Backend selector for a chain account. Never changes once the account
/// exists, but classification is still computed fresh on every call because
/// the stored metadata can be edited between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Eoa,
    SmartAccount,
    Multisig,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Eoa => "eoa",
            AccountKind::SmartAccount => "smart_account",
            AccountKind::Multisig => "multisig",
        }
    }
}

impl FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eoa" => Ok(AccountKind::Eoa),
            "smart_account" => Ok(AccountKind::SmartAccount),
            "multisig" => Ok(AccountKind::Multisig),
            other => Err(format!("Unknown account kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmartAccountMeta {
    pub entry_point: Option<String>,
    pub account_factory: Option<String>,
    /// Address of the key that signs user operations for this account.
    pub owner_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MultisigMeta {
    pub owners: Vec<String>,
    pub threshold: u32,
}

/// Stored per chain-account metadata. The identity columns are repeated on
/// every persisted record so that records survive account-table rewrites.
#[derive(Debug, Clone)]
pub struct AccountMeta {
    pub master_id: String,
    pub derivation_index: i64,
    pub network_kind: String,
    pub chain_id: i64,
    pub address: String,
    pub smart_account: Option<SmartAccountMeta>,
    pub multisig: Option<MultisigMeta>,
}

impl AccountMeta {
    pub fn from_config(entry: &AccountEntry) -> Self {
        let smart_account = if entry.entry_point.is_some() || entry.account_factory.is_some() {
            Some(SmartAccountMeta {
                entry_point: entry.entry_point.clone(),
                account_factory: entry.account_factory.clone(),
                owner_address: entry.smart_account_owner.clone(),
            })
        } else {
            None
        };
        let multisig = entry.multisig_owners.as_ref().map(|owners| MultisigMeta {
            owners: owners.clone(),
            threshold: entry.multisig_threshold.unwrap_or(1),
        });
        AccountMeta {
            master_id: entry.master_id.clone(),
            derivation_index: entry.derivation_index,
            network_kind: entry.network_kind.clone(),
            chain_id: entry.chain_id,
            address: entry.address.to_lowercase(),
            smart_account,
            multisig,
        }
    }

    pub fn address_h160(&self) -> Result<Address, EngineError> {
        Address::from_str(&self.address).map_err(err_from!())
    }

    pub fn matches_address(&self, addr: &str) -> bool {
        self.address.eq_ignore_ascii_case(addr)
    }
}

/// Classify the account into its backend kind. Multisig metadata wins over
/// smart-account metadata when both are present (a Safe deployed through an
/// account factory is still driven through the Safe path).
pub fn classify_account(account: &AccountMeta) -> AccountKind {
    if account.multisig.is_some() {
        AccountKind::Multisig
    } else if account.smart_account.is_some() {
        AccountKind::SmartAccount
    } else {
        AccountKind::Eoa
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_account() -> AccountMeta {
        AccountMeta {
            master_id: "master-1".to_string(),
            derivation_index: 0,
            network_kind: "evm".to_string(),
            chain_id: 5,
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".to_string(),
            smart_account: None,
            multisig: None,
        }
    }

    #[test]
    fn test_classify_account() {
        let mut account = base_account();
        assert_eq!(classify_account(&account), AccountKind::Eoa);

        account.smart_account = Some(SmartAccountMeta {
            entry_point: None,
            account_factory: None,
            owner_address: None,
        });
        assert_eq!(classify_account(&account), AccountKind::SmartAccount);

        account.multisig = Some(MultisigMeta {
            owners: vec![],
            threshold: 1,
        });
        assert_eq!(classify_account(&account), AccountKind::Multisig);
    }

    #[test]
    fn test_account_kind_roundtrip() {
        for kind in [
            AccountKind::Eoa,
            AccountKind::SmartAccount,
            AccountKind::Multisig,
        ] {
            assert_eq!(AccountKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(AccountKind::from_str("other").is_err());
    }
}
