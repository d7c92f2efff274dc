use crate::account::{classify_account, AccountKind, AccountMeta};
use crate::error::EngineError;
use crate::eth::get_eth_addr_from_secret;
use crate::{err_custom_create, err_from};
use async_trait::async_trait;
use secp256k1::SecretKey;
use web3::transports::Http;
use web3::types::{TransactionParameters, H256};
use web3::Web3;

#[derive(Debug, Clone)]
pub struct SignedEoaTx {
    pub raw_transaction: Vec<u8>,
    pub transaction_hash: H256,
}

/// Signing collaborator. The engine never owns key custody; it only asks
/// for a signed payload and fails the operation if the account cannot
/// currently sign.
#[async_trait]
pub trait TxSigner: Send + Sync {
    async fn sign_transaction(
        &self,
        web3: &Web3<Http>,
        account: &AccountMeta,
        tx: TransactionParameters,
    ) -> Result<SignedEoaTx, EngineError>;

    /// EIP-191 signature over an arbitrary payload (user operation hashes,
    /// Safe approval digests). Returns the 65 byte r||s||v signature.
    async fn sign_message(
        &self,
        web3: &Web3<Http>,
        account: &AccountMeta,
        message: &[u8],
    ) -> Result<Vec<u8>, EngineError>;
}

/// In-process signer over a set of plain secret keys, resolved by derived
/// address. EOA accounts sign with their own key; smart accounts with the
/// configured owner key; multisig accounts with any owner key we hold.
pub struct KeyringSigner {
    secret_keys: Vec<SecretKey>,
}

impl KeyringSigner {
    pub fn new(secret_keys: Vec<SecretKey>) -> Self {
        Self { secret_keys }
    }

    fn find_key(&self, address: &str) -> Option<&SecretKey> {
        self.secret_keys
            .iter()
            .find(|sk| format!("{:#x}", get_eth_addr_from_secret(sk)).eq_ignore_ascii_case(address))
    }

    fn signing_key(&self, account: &AccountMeta) -> Result<&SecretKey, EngineError> {
        let key = match classify_account(account) {
            AccountKind::Eoa => self.find_key(&account.address),
            AccountKind::SmartAccount => account
                .smart_account
                .as_ref()
                .and_then(|meta| meta.owner_address.as_ref())
                .and_then(|owner| self.find_key(owner)),
            AccountKind::Multisig => account
                .multisig
                .as_ref()
                .and_then(|meta| meta.owners.iter().find_map(|owner| self.find_key(owner))),
        };
        key.ok_or_else(|| {
            err_custom_create!(
                "No signing key available for account {} on chain {}",
                account.address,
                account.chain_id
            )
        })
    }
}

#[async_trait]
impl TxSigner for KeyringSigner {
    async fn sign_transaction(
        &self,
        web3: &Web3<Http>,
        account: &AccountMeta,
        tx: TransactionParameters,
    ) -> Result<SignedEoaTx, EngineError> {
        let secret_key = self.signing_key(account)?;
        let expected = format!("{:#x}", get_eth_addr_from_secret(secret_key));
        if !account.matches_address(&expected) {
            return Err(err_custom_create!(
                "From addr not match with secret key {} != {}",
                account.address,
                expected
            ));
        }
        let signed = web3
            .accounts()
            .sign_transaction(tx, secret_key)
            .await
            .map_err(err_from!())?;
        Ok(SignedEoaTx {
            raw_transaction: signed.raw_transaction.0,
            transaction_hash: signed.transaction_hash,
        })
    }

    async fn sign_message(
        &self,
        web3: &Web3<Http>,
        account: &AccountMeta,
        message: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let secret_key = self.signing_key(account)?;
        let signed = web3.accounts().sign(message, secret_key);
        Ok(signed.signature.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_signing_key_resolution() {
        let sk = SecretKey::from_str(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let signer = KeyringSigner::new(vec![sk]);

        let eoa = AccountMeta {
            master_id: "m".to_string(),
            derivation_index: 0,
            network_kind: "evm".to_string(),
            chain_id: 5,
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".to_string(),
            smart_account: None,
            multisig: None,
        };
        assert!(signer.signing_key(&eoa).is_ok());

        let mut unknown = eoa.clone();
        unknown.address = "0x000000000000000000000000000000000000dead".to_string();
        assert!(signer.signing_key(&unknown).is_err());
    }
}
