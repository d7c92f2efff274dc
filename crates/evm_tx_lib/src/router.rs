use crate::account::{classify_account, AccountKind, AccountMeta};
use crate::contracts::{
    get_smart_account_execute, safe_tx_hash, SafeTxParams, ENTRY_POINT_CONTRACT_TEMPLATE,
};
use crate::db::model::TxPendingDao;
use crate::db::ops::insert_or_replace_pending_tx;
use crate::error::EngineError;
use crate::eth::get_transaction_count;
use crate::fees::get_fee_data;
use crate::model::{FeeData, PopulatedTx, TxRequestFields, TxSubmission};
use crate::populate::{populate_tx, PopulateBackend};
use crate::process::{wait_for_pending_tx, ConfirmationNotifier, WaitOutcome};
use crate::setup::EngineSetup;
use crate::signer::TxSigner;
use crate::sync::{sync_account_history, HttpTxIndexer};
use crate::transaction::{
    decode_data_to_bytes, fields_to_call_request, fields_to_transaction_parameters,
    send_raw_transaction,
};
use crate::{err_custom_create, err_from};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::sync::Arc;
use web3::contract::{Contract, Options};
use web3::types::{Address, CallRequest, H256, U256};
use web3::Transport;

const USER_OP_VERIFICATION_GAS_LIMIT: u64 = 150_000;
const USER_OP_PRE_VERIFICATION_GAS: u64 = 50_000;

/// Human-readable name resolution for the `to` field. The default engine
/// wiring cannot resolve names; hosts plug a real resolver in.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<Address>, EngineError>;
}

pub struct NoNameResolver;

#[async_trait]
impl NameResolver for NoNameResolver {
    async fn resolve(&self, _name: &str) -> Result<Option<Address>, EngineError> {
        Ok(None)
    }
}

/// Per-kind strategy behind the router. One object per account kind, all
/// three sharing the engine setup; the router picks one per call based on a
/// fresh classification.
#[async_trait]
trait AccountBackend: Send + Sync {
    async fn next_nonce(&self) -> Result<u64, EngineError>;
    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError>;
    async fn submit(&self, populated: &TxRequestFields) -> Result<TxSubmission, EngineError>;
}

/// Single entry point for every account facing operation. Classification
/// happens per call because account metadata can change under us; network
/// handles come from the setup's memoized registry.
pub struct TxRouter {
    pub setup: EngineSetup,
    signer: Arc<dyn TxSigner>,
    resolver: Arc<dyn NameResolver>,
}

impl TxRouter {
    pub fn new(
        setup: EngineSetup,
        signer: Arc<dyn TxSigner>,
        resolver: Arc<dyn NameResolver>,
    ) -> Self {
        Self {
            setup,
            signer,
            resolver,
        }
    }

    fn backend<'a>(&'a self, account: &'a AccountMeta) -> Box<dyn AccountBackend + 'a> {
        match classify_account(account) {
            AccountKind::Eoa => Box::new(EoaBackend {
                router: self,
                account,
            }),
            AccountKind::SmartAccount => Box::new(SmartAccountBackend {
                router: self,
                account,
            }),
            AccountKind::Multisig => Box::new(SafeBackend {
                router: self,
                account,
            }),
        }
    }

    pub async fn get_next_nonce(&self, account: &AccountMeta) -> Result<u64, EngineError> {
        self.backend(account).next_nonce().await
    }

    pub async fn estimate_gas(
        &self,
        account: &AccountMeta,
        fields: &TxRequestFields,
    ) -> Result<U256, EngineError> {
        let mut call = fields_to_call_request(fields)?;
        if call.from.is_none() {
            call.from = Some(account.address_h160()?);
        }
        self.backend(account).estimate_gas(call).await
    }

    pub async fn populate_tx(
        &self,
        account: &AccountMeta,
        fields: TxRequestFields,
    ) -> Result<PopulatedTx, EngineError> {
        let backend = RouterPopulateBackend {
            router: self,
            account,
        };
        populate_tx(account, fields, &backend).await
    }

    /// Populate, sign, broadcast and persist in one step. The pending record
    /// is keyed by (account, nonce), so a resubmission at an occupied nonce
    /// supersedes the previous record instead of duplicating it.
    pub async fn sign_and_send_tx(
        &self,
        conn: &mut SqliteConnection,
        account: &AccountMeta,
        fields: TxRequestFields,
        function_sig: Option<String>,
    ) -> Result<TxPendingDao, EngineError> {
        let populated = self.populate_tx(account, fields).await?;
        if let Some(err) = &populated.estimate_error {
            log::warn!(
                "Proceeding with fallback gas limit, estimation failed: {}",
                err
            );
        }
        let submission = self.backend(account).submit(&populated.fields).await?;
        log::info!(
            "Submitted {} for {} on chain {}",
            submission.submission_hash(),
            account.address,
            account.chain_id
        );
        self.add_pending_tx(conn, account, submission, populated.fields, function_sig)
            .await
    }

    /// Adopt an already submitted (or externally observed) transaction as a
    /// pending record.
    pub async fn add_pending_tx(
        &self,
        conn: &mut SqliteConnection,
        account: &AccountMeta,
        submission: TxSubmission,
        fields: TxRequestFields,
        function_sig: Option<String>,
    ) -> Result<TxPendingDao, EngineError> {
        let nonce = match &submission {
            TxSubmission::Multisig { safe_nonce, .. } => *safe_nonce,
            _ => fields
                .nonce
                .ok_or_else(|| err_custom_create!("Pending record requires a nonce"))?,
        };
        let pending = TxPendingDao {
            id: 0,
            master_id: account.master_id.clone(),
            derivation_index: account.derivation_index,
            network_kind: account.network_kind.clone(),
            chain_id: account.chain_id,
            address: account.address.clone(),
            nonce: nonce as i64,
            kind: classify_account(account).as_str().to_string(),
            info: serde_json::to_string(&submission).map_err(err_from!())?,
            tx_request: serde_json::to_string(&fields).map_err(err_from!())?,
            function_sig,
            start_block_number: None,
            created_date: chrono::Utc::now(),
        };
        insert_or_replace_pending_tx(conn, &pending)
            .await
            .map_err(err_from!())
    }

    pub async fn wait_for_tx(
        &self,
        conn: &mut SqliteConnection,
        pending: &mut TxPendingDao,
        notifier: &dyn ConfirmationNotifier,
    ) -> Result<WaitOutcome, EngineError> {
        wait_for_pending_tx(conn, pending, &self.setup, notifier).await
    }

    /// Pull confirmed history for the account from the configured indexer.
    pub async fn fetch_transactions(
        &self,
        conn: &mut SqliteConnection,
        account: &AccountMeta,
        notifier: &dyn ConfirmationNotifier,
    ) -> Result<u64, EngineError> {
        let chain_setup = self.setup.get_chain_setup(account.chain_id)?;
        let indexer_url = chain_setup.indexer_url.as_ref().ok_or_else(|| {
            err_custom_create!("No indexer configured for chain id: {}", account.chain_id)
        })?;
        let indexer = HttpTxIndexer::new(indexer_url);
        sync_account_history(conn, account, &indexer, &self.setup, notifier).await
    }

    /// Raw JSON-RPC passthrough on the account's primary provider.
    pub async fn send(
        &self,
        account: &AccountMeta,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, EngineError> {
        let web3 = self.setup.get_provider(account.chain_id).await?;
        web3.transport()
            .execute(method, params)
            .await
            .map_err(err_from!())
    }
}

struct RouterPopulateBackend<'a> {
    router: &'a TxRouter,
    account: &'a AccountMeta,
}

#[async_trait]
impl PopulateBackend for RouterPopulateBackend<'_> {
    async fn fee_data(&self) -> Result<FeeData, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        get_fee_data(&web3).await
    }

    async fn next_nonce(&self) -> Result<u64, EngineError> {
        self.router.get_next_nonce(self.account).await
    }

    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError> {
        self.router.backend(self.account).estimate_gas(call).await
    }

    async fn resolve_name(&self, name: &str) -> Result<Option<Address>, EngineError> {
        self.router.resolver.resolve(name).await
    }
}

struct EoaBackend<'a> {
    router: &'a TxRouter,
    account: &'a AccountMeta,
}

#[async_trait]
impl AccountBackend for EoaBackend<'_> {
    async fn next_nonce(&self) -> Result<u64, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        // Pending-inclusive so queued submissions stack instead of clashing.
        get_transaction_count(self.account.address_h160()?, &web3, true)
            .await
            .map_err(err_from!())
    }

    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        web3.eth().estimate_gas(call, None).await.map_err(err_from!())
    }

    async fn submit(&self, populated: &TxRequestFields) -> Result<TxSubmission, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        let tx_params = fields_to_transaction_parameters(populated)?;
        let signed = self
            .router
            .signer
            .sign_transaction(&web3, self.account, tx_params)
            .await?;
        let raw_hex = hex::encode(&signed.raw_transaction);
        let submitted_block = web3.eth().block_number().await.map_err(err_from!())?.as_u64();
        let tx_hash = send_raw_transaction(&web3, &raw_hex).await?;
        if tx_hash != signed.transaction_hash {
            log::warn!(
                "Node reported hash {:#x} differs from signed hash {:#x}",
                tx_hash,
                signed.transaction_hash
            );
        }
        Ok(TxSubmission::Eoa {
            tx_hash: format!("{:#x}", signed.transaction_hash),
            signed_raw_data: Some(raw_hex),
            submitted_block: Some(submitted_block),
        })
    }
}

struct SmartAccountBackend<'a> {
    router: &'a TxRouter,
    account: &'a AccountMeta,
}

impl SmartAccountBackend<'_> {
    fn entry_point(&self) -> Result<Address, EngineError> {
        if let Some(meta) = &self.account.smart_account {
            if let Some(entry_point) = &meta.entry_point {
                return Address::from_str(entry_point).map_err(err_from!());
            }
        }
        let chain_setup = self.router.setup.get_chain_setup(self.account.chain_id)?;
        chain_setup.entry_point_address.ok_or_else(|| {
            err_custom_create!(
                "No entry point configured for chain id: {}",
                self.account.chain_id
            )
        })
    }
}

#[async_trait]
impl AccountBackend for SmartAccountBackend<'_> {
    async fn next_nonce(&self) -> Result<u64, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        let contract = Contract::new(
            web3.eth(),
            self.entry_point()?,
            ENTRY_POINT_CONTRACT_TEMPLATE.abi().clone(),
        );
        let nonce: U256 = contract
            .query(
                "getNonce",
                (self.account.address_h160()?, U256::zero()),
                None,
                Options::default(),
                None,
            )
            .await
            .map_err(err_from!())?;
        Ok(nonce.as_u64())
    }

    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        web3.eth().estimate_gas(call, None).await.map_err(err_from!())
    }

    async fn submit(&self, populated: &TxRequestFields) -> Result<TxSubmission, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        let bundler = self.router.setup.get_bundler(self.account.chain_id).await?;
        let entry_point = self.entry_point()?;

        let to = populated
            .to
            .as_ref()
            .ok_or_else(|| err_custom_create!("User operation requires a target"))?;
        let to = Address::from_str(to).map_err(err_from!())?;
        let value = populated
            .value
            .as_ref()
            .map(|v| U256::from_dec_str(v))
            .transpose()
            .map_err(err_from!())?
            .unwrap_or_else(U256::zero);
        let inner_data = decode_data_to_bytes(populated)?.map(|b| b.0).unwrap_or_default();
        let call_data =
            get_smart_account_execute(to, value, inner_data).map_err(err_from!())?;

        let nonce = populated
            .nonce
            .ok_or_else(|| err_custom_create!("User operation requires a nonce"))?;
        let max_fee_per_gas = populated
            .max_fee_per_gas
            .as_ref()
            .map(|v| U256::from_dec_str(v))
            .transpose()
            .map_err(err_from!())?
            .ok_or_else(|| err_custom_create!("User operation requires maxFeePerGas"))?;
        let max_priority_fee_per_gas = populated
            .max_priority_fee_per_gas
            .as_ref()
            .map(|v| U256::from_dec_str(v))
            .transpose()
            .map_err(err_from!())?
            .ok_or_else(|| err_custom_create!("User operation requires maxPriorityFeePerGas"))?;

        let mut user_op = crate::contracts::UserOperation {
            sender: self.account.address_h160()?,
            nonce: U256::from(nonce),
            init_code: Vec::new(),
            call_data,
            call_gas_limit: U256::from(
                populated
                    .gas_limit
                    .ok_or_else(|| err_custom_create!("User operation requires a gas limit"))?,
            ),
            verification_gas_limit: U256::from(USER_OP_VERIFICATION_GAS_LIMIT),
            pre_verification_gas: U256::from(USER_OP_PRE_VERIFICATION_GAS),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster_and_data: Vec::new(),
            signature: Vec::new(),
        };
        let op_hash = user_op.op_hash(entry_point, self.account.chain_id as u64);
        user_op.signature = self
            .router
            .signer
            .sign_message(&web3, self.account, op_hash.as_bytes())
            .await?;

        let response = bundler
            .transport()
            .execute(
                "eth_sendUserOperation",
                vec![
                    user_op.to_rpc_json(),
                    json!(format!("{:#x}", entry_point)),
                ],
            )
            .await
            .map_err(err_from!())?;
        let user_op_hash = response
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{:#x}", op_hash));

        Ok(TxSubmission::SmartAccount {
            user_op_hash,
            entry_point: format!("{:#x}", entry_point),
            sender_nonce: nonce,
        })
    }
}

#[derive(Deserialize, Debug)]
struct SafeInfo {
    nonce: u64,
}

struct SafeBackend<'a> {
    router: &'a TxRouter,
    account: &'a AccountMeta,
}

impl SafeBackend<'_> {
    fn service_url(&self) -> Result<String, EngineError> {
        let chain_setup = self.router.setup.get_chain_setup(self.account.chain_id)?;
        chain_setup
            .safe_service_url
            .clone()
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                err_custom_create!(
                    "No safe service configured for chain id: {}",
                    self.account.chain_id
                )
            })
    }
}

#[async_trait]
impl AccountBackend for SafeBackend<'_> {
    /// The Safe's internal sequence number, owned by the transaction
    /// service, not an EVM account nonce.
    async fn next_nonce(&self) -> Result<u64, EngineError> {
        let url = format!(
            "{}/api/v1/safes/{}/",
            self.service_url()?,
            self.account.address
        );
        let response = reqwest::Client::new()
            .get(&url)
            .send()
            .await
            .map_err(err_from!())?;
        if !response.status().is_success() {
            return Err(err_custom_create!(
                "Safe service returned status {} for {}",
                response.status(),
                url
            ));
        }
        let info: SafeInfo = response.json().await.map_err(err_from!())?;
        Ok(info.nonce)
    }

    async fn estimate_gas(&self, call: CallRequest) -> Result<U256, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        web3.eth().estimate_gas(call, None).await.map_err(err_from!())
    }

    async fn submit(&self, populated: &TxRequestFields) -> Result<TxSubmission, EngineError> {
        let web3 = self.router.setup.get_provider(self.account.chain_id).await?;
        let safe = self.account.address_h160()?;
        let to = populated
            .to
            .as_ref()
            .ok_or_else(|| err_custom_create!("Safe transaction requires a target"))?;
        let to = Address::from_str(to).map_err(err_from!())?;
        let value = populated
            .value
            .as_ref()
            .map(|v| U256::from_dec_str(v))
            .transpose()
            .map_err(err_from!())?
            .unwrap_or_else(U256::zero);
        let data = decode_data_to_bytes(populated)?.map(|b| b.0).unwrap_or_default();
        let nonce = populated
            .nonce
            .ok_or_else(|| err_custom_create!("Safe transaction requires a nonce"))?;

        let params = SafeTxParams {
            to,
            value,
            data: data.clone(),
            operation: 0,
            safe_tx_gas: U256::zero(),
            base_gas: U256::zero(),
            gas_price: U256::zero(),
            gas_token: Address::zero(),
            refund_receiver: Address::zero(),
            nonce: U256::from(nonce),
        };
        let tx_hash: H256 = safe_tx_hash(safe, self.account.chain_id as u64, &params);

        let mut signature = self
            .router
            .signer
            .sign_message(&web3, self.account, tx_hash.as_bytes())
            .await?;
        // eth_sign style signatures are marked by shifting v by 4.
        if let Some(v) = signature.last_mut() {
            *v += 4;
        }

        let sender = self
            .account
            .multisig
            .as_ref()
            .and_then(|meta| meta.owners.first().cloned())
            .unwrap_or_else(|| self.account.address.clone());

        let url = format!(
            "{}/api/v1/safes/{}/multisig-transactions/",
            self.service_url()?,
            self.account.address
        );
        let body = json!({
            "to": format!("{:#x}", to),
            "value": value.to_string(),
            "data": if data.is_empty() { serde_json::Value::Null } else { json!(format!("0x{}", hex::encode(&data))) },
            "operation": 0,
            "safeTxGas": "0",
            "baseGas": "0",
            "gasPrice": "0",
            "gasToken": format!("{:#x}", Address::zero()),
            "refundReceiver": format!("{:#x}", Address::zero()),
            "nonce": nonce,
            "contractTransactionHash": format!("{:#x}", tx_hash),
            "sender": sender,
            "signature": format!("0x{}", hex::encode(&signature)),
        });
        let response = reqwest::Client::new()
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(err_from!())?;
        if !response.status().is_success() {
            return Err(err_custom_create!(
                "Safe service rejected proposal with status {}",
                response.status()
            ));
        }

        Ok(TxSubmission::Multisig {
            safe_tx_hash: format!("{:#x}", tx_hash),
            safe_nonce: nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{MultisigMeta, SmartAccountMeta};
    use crate::signer::KeyringSigner;

    fn test_router() -> TxRouter {
        let config: crate::config::Config = toml::from_str(
            r#"
[chain.goerli]
chain-id = 5
network-kind = "evm"
rpc-endpoints = ["http://127.0.0.1:8545"]
priority-fee = 1.5
max-fee-per-gas = 500.0
transaction-timeout = 300
confirmation-blocks = 1
block-time-seconds = 12
poll-interval-seconds = 5
"#,
        )
        .unwrap();
        let setup = EngineSetup::new(&config, 10, 10, 300).unwrap();
        TxRouter::new(
            setup,
            Arc::new(KeyringSigner::new(vec![])),
            Arc::new(NoNameResolver),
        )
    }

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

    #[tokio::test]
    async fn test_add_pending_tx_replaces_at_same_nonce() {
        let router = test_router();
        let mut conn = crate::db::create_sqlite_connection(None, true).await.unwrap();
        let account = base_account();
        let fields = TxRequestFields {
            nonce: Some(3),
            ..TxRequestFields::default()
        };
        let first = router
            .add_pending_tx(
                &mut conn,
                &account,
                TxSubmission::Eoa {
                    tx_hash: "0xaa".to_string(),
                    signed_raw_data: None,
                    submitted_block: None,
                },
                fields.clone(),
                None,
            )
            .await
            .unwrap();
        let second = router
            .add_pending_tx(
                &mut conn,
                &account,
                TxSubmission::Eoa {
                    tx_hash: "0xbb".to_string(),
                    signed_raw_data: None,
                    submitted_block: None,
                },
                fields,
                None,
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.info.contains("0xbb"));
    }

    #[tokio::test]
    async fn test_multisig_nonce_comes_from_submission() {
        let router = test_router();
        let mut conn = crate::db::create_sqlite_connection(None, true).await.unwrap();
        let mut account = base_account();
        account.multisig = Some(MultisigMeta {
            owners: vec!["0x000000000000000000000000000000000000beef".to_string()],
            threshold: 1,
        });
        let pending = router
            .add_pending_tx(
                &mut conn,
                &account,
                TxSubmission::Multisig {
                    safe_tx_hash: "0xcc".to_string(),
                    safe_nonce: 9,
                },
                TxRequestFields::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(pending.nonce, 9);
        assert_eq!(pending.kind, "multisig");
    }

    #[test]
    fn test_backend_selection_follows_classification() {
        let router = test_router();
        let mut account = base_account();
        // The router consults metadata fresh on each call; flipping the
        // account between kinds flips the backend without any cache.
        assert!(matches!(classify_account(&account), AccountKind::Eoa));
        account.smart_account = Some(SmartAccountMeta {
            entry_point: Some("0x0000000000000000000000000000000000000007".to_string()),
            account_factory: None,
            owner_address: None,
        });
        assert!(matches!(
            classify_account(&account),
            AccountKind::SmartAccount
        ));
        let _ = router.backend(&account);
    }
}
