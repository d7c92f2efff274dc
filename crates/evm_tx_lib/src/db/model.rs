use chrono::{DateTime, Utc};
use serde::Serialize;

/// One submitted but not yet finalized transaction. At most one active row
/// exists per (account, nonce); replacements overwrite in place.
#[derive(Serialize, sqlx::FromRow, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TxPendingDao {
    pub id: i64,
    pub master_id: String,
    pub derivation_index: i64,
    pub network_kind: String,
    pub chain_id: i64,
    pub address: String,
    pub nonce: i64,
    pub kind: String,
    #[serde(skip_serializing)]
    pub info: String,
    pub tx_request: String,
    pub function_sig: Option<String>,
    pub start_block_number: Option<i64>,
    pub created_date: DateTime<Utc>,
}

/// The settled counterpart, keyed by (account, tx_type, primary_index,
/// secondary_index). `fetched_cursor` marks the newest record the history
/// synchronizer has fully caught up to for the (account, tx_type) pair.
#[derive(Serialize, sqlx::FromRow, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxConfirmedDao {
    pub id: i64,
    pub master_id: String,
    pub derivation_index: i64,
    pub network_kind: String,
    pub chain_id: i64,
    pub address: String,
    pub tx_type: String,
    pub primary_index: i64,
    pub secondary_index: String,
    pub nonce: i64,
    pub tx_hash: String,
    pub kind: String,
    #[serde(skip_serializing)]
    pub info: String,
    pub from_addr: String,
    pub to_addr: Option<String>,
    pub val: String,
    pub call_data: Option<String>,
    pub function_sig: Option<String>,
    pub chain_status: i64,
    pub gas_used: Option<String>,
    pub fee_paid: Option<String>,
    pub blockchain_date: DateTime<Utc>,
    pub checked_date: DateTime<Utc>,
    pub fetched_cursor: bool,
}
