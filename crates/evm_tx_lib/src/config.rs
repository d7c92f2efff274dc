use serde::Deserialize;
use std::collections::btree_map::BTreeMap as Map;

use std::fs;
use std::path::Path;

use crate::error::EngineError;

use crate::{err_custom_create, err_from};
use web3::types::Address;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub chain: Map<String, Chain>,
    #[serde(default)]
    pub account: Vec<AccountEntry>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Chain {
    pub chain_id: i64,
    pub network_kind: String,
    pub rpc_endpoints: Vec<String>,
    pub currency_symbol: Option<String>,
    pub priority_fee: f64,
    pub max_fee_per_gas: f64,
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

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct AccountEntry {
    pub master_id: String,
    pub derivation_index: i64,
    pub network_kind: String,
    pub chain_id: i64,
    pub address: String,
    pub entry_point: Option<String>,
    pub account_factory: Option<String>,
    pub smart_account_owner: Option<String>,
    pub multisig_owners: Option<Vec<String>>,
    pub multisig_threshold: Option<u32>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        match toml::from_slice(&fs::read(path).map_err(err_from!())?) {
            Ok(config) => Ok(config),
            Err(e) => Err(err_custom_create!("Failed to parse toml {:?}", e)),
        }
    }
}
