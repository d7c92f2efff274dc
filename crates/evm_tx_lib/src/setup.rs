use crate::account::AccountMeta;
use crate::config::Config;
use crate::error::EngineError;
use crate::utils::gwei_to_u256;
use crate::{err_custom_create, err_from};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use web3::transports::Http;
use web3::types::{Address, U256};
use web3::Web3;

#[derive(Clone, Debug)]
pub struct ChainSetup {
    pub chain_id: i64,
    pub network_kind: String,
    pub rpc_endpoints: Vec<String>,
    pub currency_symbol: String,
    pub max_fee_per_gas: U256,
    pub priority_fee: U256,
    pub transaction_timeout: u64,
    pub confirmation_blocks: u64,
    pub block_time_seconds: u64,
    pub poll_interval_seconds: u64,
    pub bundler_rpc: Option<String>,
    pub entry_point_address: Option<Address>,
    pub safe_service_url: Option<String>,
    pub indexer_url: Option<String>,
    pub explorer_url: Option<String>,
}

type HandleMap = Arc<Mutex<BTreeMap<i64, Arc<OnceCell<Web3<Http>>>>>>;

/// Process wide engine context: per chain configuration plus the lazily
/// constructed network handles. Handle construction is shared between
/// concurrent first callers of the same chain id, so two tasks asking for
/// chain 137 at the same time await one in-flight build instead of racing.
#[derive(Clone, Debug)]
pub struct EngineSetup {
    pub chain_setup: BTreeMap<i64, ChainSetup>,
    pub accounts: Vec<AccountMeta>,
    pub service_sleep: u64,
    pub process_sleep: u64,
    pub wait_timeout: u64,
    providers: HandleMap,
    bundlers: HandleMap,
}

impl EngineSetup {
    pub fn new(
        config: &Config,
        service_sleep: u64,
        process_sleep: u64,
        wait_timeout: u64,
    ) -> Result<Self, EngineError> {
        let mut chain_setup = BTreeMap::new();
        for chain_config in &config.chain {
            let chain = &chain_config.1;
            if chain.rpc_endpoints.is_empty() {
                return Err(err_custom_create!(
                    "No rpc endpoints given for chain {}",
                    chain.chain_id
                ));
            }
            chain_setup.insert(
                chain.chain_id,
                ChainSetup {
                    chain_id: chain.chain_id,
                    network_kind: chain.network_kind.clone(),
                    rpc_endpoints: chain.rpc_endpoints.clone(),
                    currency_symbol: chain
                        .currency_symbol
                        .clone()
                        .unwrap_or_else(|| "ETH".to_string()),
                    max_fee_per_gas: gwei_to_u256(chain.max_fee_per_gas).map_err(err_from!())?,
                    priority_fee: gwei_to_u256(chain.priority_fee).map_err(err_from!())?,
                    transaction_timeout: chain.transaction_timeout,
                    confirmation_blocks: chain.confirmation_blocks,
                    block_time_seconds: chain.block_time_seconds,
                    poll_interval_seconds: chain.poll_interval_seconds,
                    bundler_rpc: chain.bundler_rpc.clone(),
                    entry_point_address: chain.entry_point_address,
                    safe_service_url: chain.safe_service_url.clone(),
                    indexer_url: chain.indexer_url.clone(),
                    explorer_url: chain.explorer_url.clone(),
                },
            );
        }
        let accounts = config
            .account
            .iter()
            .map(AccountMeta::from_config)
            .collect();
        Ok(EngineSetup {
            chain_setup,
            accounts,
            service_sleep,
            process_sleep,
            wait_timeout,
            providers: Arc::new(Mutex::new(BTreeMap::new())),
            bundlers: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn get_chain_setup(&self, chain_id: i64) -> Result<&ChainSetup, EngineError> {
        self.chain_setup
            .get(&chain_id)
            .ok_or_else(|| err_custom_create!("No chain setup for chain id: {}", chain_id))
    }

    /// Primary JSON-RPC handle for a chain. Built on first use and memoized;
    /// the endpoint is picked at random from the configured list.
    pub async fn get_provider(&self, chain_id: i64) -> Result<Web3<Http>, EngineError> {
        let chain_setup = self.get_chain_setup(chain_id)?.clone();
        let cell = {
            let mut providers = self.providers.lock().await;
            providers
                .entry(chain_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let web3 = cell
            .get_or_try_init(|| async move {
                let endpoint = {
                    let mut rng = rand::thread_rng();
                    chain_setup
                        .rpc_endpoints
                        .get(rng.gen_range(0..chain_setup.rpc_endpoints.len()))
                        .cloned()
                        .ok_or_else(|| {
                            err_custom_create!("No rpc endpoint for chain id: {}", chain_id)
                        })?
                };
                log::debug!("Creating provider for chain {}: {}", chain_id, endpoint);
                let transport = Http::new(&endpoint).map_err(err_from!())?;
                Ok::<_, EngineError>(Web3::new(transport))
            })
            .await?;
        Ok(web3.clone())
    }

    /// Secondary account-abstraction (bundler) handle. Missing bundler
    /// configuration or a failed build is fatal for smart-account operations
    /// only; EOA and multisig traffic on the same chain is unaffected.
    pub async fn get_bundler(&self, chain_id: i64) -> Result<Web3<Http>, EngineError> {
        let chain_setup = self.get_chain_setup(chain_id)?;
        let bundler_rpc = chain_setup.bundler_rpc.clone().ok_or_else(|| {
            err_custom_create!("No bundler rpc configured for chain id: {}", chain_id)
        })?;
        let cell = {
            let mut bundlers = self.bundlers.lock().await;
            bundlers
                .entry(chain_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let web3 = cell
            .get_or_try_init(|| async move {
                log::debug!("Creating bundler client for chain {}: {}", chain_id, bundler_rpc);
                let transport = Http::new(&bundler_rpc).map_err(err_from!())?;
                Ok::<_, EngineError>(Web3::new(transport))
            })
            .await?;
        Ok(web3.clone())
    }

    /// Drop memoized handles for a chain after its endpoint set or metadata
    /// changed. The next caller rebuilds them.
    pub async fn invalidate_provider(&self, chain_id: i64) {
        self.providers.lock().await.remove(&chain_id);
        self.bundlers.lock().await.remove(&chain_id);
        log::info!("Invalidated network handles for chain {}", chain_id);
    }

    pub fn explorer_tx_url(&self, chain_id: i64, tx_hash: &str) -> Option<String> {
        let chain_setup = self.chain_setup.get(&chain_id)?;
        chain_setup
            .explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{}", base.trim_end_matches('/'), tx_hash))
    }

    pub fn account_by_address(&self, chain_id: i64, address: &str) -> Option<&AccountMeta> {
        self.accounts
            .iter()
            .find(|a| a.chain_id == chain_id && a.matches_address(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        toml::from_str(
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
        .unwrap()
    }

    #[tokio::test]
    async fn test_provider_memoized_and_shared() {
        let setup = EngineSetup::new(&test_config(), 10, 10, 300).unwrap();
        let (first, second) = tokio::join!(setup.get_provider(5), setup.get_provider(5));
        assert!(first.is_ok());
        assert!(second.is_ok());
        {
            let providers = setup.providers.lock().await;
            assert_eq!(providers.len(), 1);
        }
        setup.invalidate_provider(5).await;
        let providers = setup.providers.lock().await;
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn test_bundler_requires_configuration() {
        let setup = EngineSetup::new(&test_config(), 10, 10, 300).unwrap();
        assert!(setup.get_bundler(5).await.is_err());
    }
}
