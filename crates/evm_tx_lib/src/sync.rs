use crate::account::{classify_account, AccountMeta};
use crate::db::model::TxConfirmedDao;
use crate::db::ops::{
    get_confirmed_tx_by_order_key, get_confirmed_txs_page, get_pending_tx_by_nonce,
    insert_confirmed_tx, set_fetched_cursor, update_confirmed_tx,
};
use crate::error::EngineError;
use crate::model::{OrderKey, TxSubmission};
use crate::process::{record_confirmed_tx, ConfirmationNotifier, TX_TYPE_OUTGOING};
use crate::setup::EngineSetup;
use crate::{err_custom_create, err_from};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{Connection, SqliteConnection};

/// Rows requested from the indexer per page.
pub const SYNC_PAGE_SIZE: u64 = 100;
/// Local rows inspected per step while walking backward for the cursor.
const CURSOR_SCAN_PAGE: i64 = 100;

/// One confirmed transaction as reported by the external indexer.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTx {
    pub tx_hash: String,
    pub block_number: i64,
    #[serde(default)]
    pub tx_index: Option<i64>,
    /// Set for smart-account operations; replaces tx_index in the order key.
    #[serde(default)]
    pub op_hash: Option<String>,
    pub from_addr: String,
    #[serde(default)]
    pub to_addr: Option<String>,
    pub val: String,
    #[serde(default)]
    pub call_data: Option<String>,
    #[serde(default)]
    pub function_sig: Option<String>,
    pub nonce: i64,
    pub chain_status: i64,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub fee_paid: Option<String>,
    pub blockchain_date: DateTime<Utc>,
}

impl IndexedTx {
    pub fn order_key(&self) -> OrderKey {
        match &self.op_hash {
            Some(op_hash) => OrderKey::for_operation(self.block_number, op_hash),
            None => OrderKey::for_block_pos(self.block_number, self.tx_index.unwrap_or(0)),
        }
    }
}

/// External paginated indexer. Pages come back ordered by order key
/// ascending, starting strictly after the given key.
#[async_trait]
pub trait TxIndexer: Send + Sync {
    async fn fetch_page(
        &self,
        account: &AccountMeta,
        tx_type: &str,
        after: &OrderKey,
        page_size: u64,
    ) -> Result<Vec<IndexedTx>, EngineError>;
}

#[derive(Deserialize, Debug)]
struct IndexerPage {
    results: Vec<IndexedTx>,
}

pub struct HttpTxIndexer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTxIndexer {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TxIndexer for HttpTxIndexer {
    async fn fetch_page(
        &self,
        account: &AccountMeta,
        tx_type: &str,
        after: &OrderKey,
        page_size: u64,
    ) -> Result<Vec<IndexedTx>, EngineError> {
        let url = format!(
            "{}/api/v1/accounts/{}/transactions",
            self.base_url, account.address
        );
        let response = self
            .client
            .get(&url)
            .query(&[
                ("chainId", account.chain_id.to_string()),
                ("type", tx_type.to_string()),
                ("afterBlock", after.primary.to_string()),
                ("afterIndex", after.secondary.clone()),
                ("limit", page_size.to_string()),
            ])
            .send()
            .await
            .map_err(err_from!())?;
        if !response.status().is_success() {
            return Err(err_custom_create!(
                "Indexer returned status {} for {}",
                response.status(),
                url
            ));
        }
        let page: IndexerPage = response.json().await.map_err(err_from!())?;
        Ok(page.results)
    }
}

/// Walk stored pages backward until the fetched_cursor flag is found.
/// Returns the cursor's order key and row id, or the zero key for a full
/// backfill when no local data carries the flag.
async fn find_sync_cursor(
    conn: &mut SqliteConnection,
    account: &AccountMeta,
    tx_type: &str,
) -> Result<(OrderKey, Option<i64>), EngineError> {
    let mut offset = 0i64;
    loop {
        let page = get_confirmed_txs_page(conn, account, tx_type, CURSOR_SCAN_PAGE, offset)
            .await
            .map_err(err_from!())?;
        if page.is_empty() {
            return Ok((OrderKey::zero(), None));
        }
        if let Some(hit) = page.iter().find(|tx| tx.fetched_cursor) {
            return Ok((
                OrderKey {
                    primary: hit.primary_index,
                    secondary: hit.secondary_index.clone(),
                },
                Some(hit.id),
            ));
        }
        offset += CURSOR_SCAN_PAGE;
    }
}

/// Did the indexer report something observably different from what we have.
fn material_change(existing: &TxConfirmedDao, fresh: &TxConfirmedDao) -> bool {
    existing.chain_status != fresh.chain_status
        || existing.call_data != fresh.call_data
        || existing.gas_used != fresh.gas_used
        || existing.fee_paid != fresh.fee_paid
        || existing.tx_hash != fresh.tx_hash
}

fn dao_from_indexed(account: &AccountMeta, indexed: &IndexedTx) -> Result<TxConfirmedDao, EngineError> {
    let key = indexed.order_key();
    let kind = classify_account(account);
    let submission = match &indexed.op_hash {
        Some(op_hash) => TxSubmission::SmartAccount {
            user_op_hash: op_hash.clone(),
            entry_point: String::new(),
            sender_nonce: indexed.nonce as u64,
        },
        None => TxSubmission::Eoa {
            tx_hash: indexed.tx_hash.clone(),
            signed_raw_data: None,
            submitted_block: None,
        },
    };
    Ok(TxConfirmedDao {
        id: 0,
        master_id: account.master_id.clone(),
        derivation_index: account.derivation_index,
        network_kind: account.network_kind.clone(),
        chain_id: account.chain_id,
        address: account.address.clone(),
        tx_type: TX_TYPE_OUTGOING.to_string(),
        primary_index: key.primary,
        secondary_index: key.secondary,
        nonce: indexed.nonce,
        tx_hash: indexed.tx_hash.clone(),
        kind: kind.as_str().to_string(),
        info: serde_json::to_string(&submission).map_err(err_from!())?,
        from_addr: indexed.from_addr.to_lowercase(),
        to_addr: indexed.to_addr.clone(),
        val: indexed.val.clone(),
        call_data: indexed.call_data.clone(),
        function_sig: indexed.function_sig.clone(),
        chain_status: indexed.chain_status,
        gas_used: indexed.gas_used.clone(),
        fee_paid: indexed.fee_paid.clone(),
        blockchain_date: indexed.blockchain_date,
        checked_date: Utc::now(),
        fetched_cursor: false,
    })
}

/// One synchronization pass: pull pages newer than the stored cursor, merge
/// them with local state and advance the cursor flag. Returns the number of
/// records written (inserted or updated). Pagination is caller driven;
/// invoking this again later resumes from the moved cursor.
pub async fn sync_account_history(
    conn: &mut SqliteConnection,
    account: &AccountMeta,
    indexer: &dyn TxIndexer,
    setup: &EngineSetup,
    notifier: &dyn ConfirmationNotifier,
) -> Result<u64, EngineError> {
    let tx_type = TX_TYPE_OUTGOING;
    let (mut cursor, mut cursor_record_id) = find_sync_cursor(conn, account, tx_type).await?;
    let mut written = 0u64;

    loop {
        let page = indexer
            .fetch_page(account, tx_type, &cursor, SYNC_PAGE_SIZE)
            .await?;
        let fresh: Vec<IndexedTx> = page
            .into_iter()
            .filter(|tx| tx.order_key() > cursor)
            .collect();
        if fresh.is_empty() {
            break;
        }

        let mut newest_in_batch: Option<TxConfirmedDao> = None;
        for indexed in &fresh {
            let key = indexed.order_key();

            // A row whose sender is this account and whose nonce matches a
            // live pending record is our own transaction seen by the
            // indexer first; route it through the state machine's
            // confirmation path so the pending record is retired in the
            // same transaction.
            if indexed.from_addr.eq_ignore_ascii_case(&account.address) {
                if let Some(pending) = get_pending_tx_by_nonce(conn, account, indexed.nonce)
                    .await
                    .map_err(err_from!())?
                {
                    let mut candidate = dao_from_indexed(account, indexed)?;
                    candidate.kind = pending.kind.clone();
                    candidate.info = pending.info.clone();
                    candidate.function_sig = pending.function_sig.clone();
                    let stored =
                        record_confirmed_tx(conn, &pending, candidate, setup, notifier).await?;
                    written += 1;
                    newest_in_batch = Some(stored);
                    cursor = key;
                    continue;
                }
            }

            let candidate = dao_from_indexed(account, indexed)?;
            match get_confirmed_tx_by_order_key(conn, account, tx_type, &key)
                .await
                .map_err(err_from!())?
            {
                None => {
                    let stored = insert_confirmed_tx(conn, &candidate)
                        .await
                        .map_err(err_from!())?;
                    written += 1;
                    newest_in_batch = Some(stored);
                }
                Some(existing) => {
                    if material_change(&existing, &candidate) {
                        let mut merged = candidate;
                        merged.id = existing.id;
                        merged.fetched_cursor = existing.fetched_cursor;
                        update_confirmed_tx(conn, &merged)
                            .await
                            .map_err(err_from!())?;
                        written += 1;
                        newest_in_batch = Some(merged);
                    } else {
                        newest_in_batch = Some(existing);
                    }
                }
            }
            cursor = key;
        }

        // Move the cursor flag old -> new in one store transaction.
        if let Some(newest) = newest_in_batch {
            if cursor_record_id != Some(newest.id) {
                let mut db_transaction = conn.begin().await.map_err(err_from!())?;
                if let Some(old_id) = cursor_record_id {
                    set_fetched_cursor(&mut db_transaction, old_id, false)
                        .await
                        .map_err(err_from!())?;
                }
                set_fetched_cursor(&mut db_transaction, newest.id, true)
                    .await
                    .map_err(err_from!())?;
                db_transaction.commit().await.map_err(err_from!())?;
                cursor_record_id = Some(newest.id);
            }
        }
    }

    log::info!(
        "History sync for {} on chain {} wrote {} records",
        account.address,
        account.chain_id,
        written
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_sqlite_connection;
    use crate::db::model::TxPendingDao;
    use crate::db::ops::{
        get_confirmed_tx_count, get_pending_tx_count, insert_or_replace_pending_tx,
    };
    use crate::process::LogNotifier;
    use std::sync::Mutex;

    const ACCOUNT_ADDR: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

    fn test_account() -> AccountMeta {
        AccountMeta {
            master_id: "master-1".to_string(),
            derivation_index: 0,
            network_kind: "evm".to_string(),
            chain_id: 5,
            address: ACCOUNT_ADDR.to_string(),
            smart_account: None,
            multisig: None,
        }
    }

    fn test_setup() -> EngineSetup {
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
        EngineSetup::new(&config, 10, 10, 300).unwrap()
    }

    fn indexed(block: i64, idx: i64, nonce: i64, from: &str) -> IndexedTx {
        IndexedTx {
            tx_hash: format!("0x{:064x}", block * 1000 + idx),
            block_number: block,
            tx_index: Some(idx),
            op_hash: None,
            from_addr: from.to_string(),
            to_addr: Some("0x000000000000000000000000000000000000dead".to_string()),
            val: "100".to_string(),
            call_data: None,
            function_sig: None,
            nonce,
            chain_status: 1,
            gas_used: Some("21000".to_string()),
            fee_paid: Some("42000".to_string()),
            blockchain_date: Utc::now(),
        }
    }

    struct StubIndexer {
        rows: Mutex<Vec<IndexedTx>>,
        calls: Mutex<usize>,
    }

    impl StubIndexer {
        fn new(rows: Vec<IndexedTx>) -> Self {
            Self {
                rows: Mutex::new(rows),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TxIndexer for StubIndexer {
        async fn fetch_page(
            &self,
            _account: &AccountMeta,
            _tx_type: &str,
            after: &OrderKey,
            page_size: u64,
        ) -> Result<Vec<IndexedTx>, EngineError> {
            *self.calls.lock().unwrap() += 1;
            let rows = self.rows.lock().unwrap();
            let mut newer: Vec<IndexedTx> = rows
                .iter()
                .filter(|tx| tx.order_key() > *after)
                .cloned()
                .collect();
            newer.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
            newer.truncate(page_size as usize);
            Ok(newer)
        }
    }

    #[tokio::test]
    async fn test_round_trip_cursor() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let account = test_account();
        let setup = test_setup();
        let indexer = StubIndexer::new(vec![
            indexed(100, 0, 1, "0x000000000000000000000000000000000000beef"),
            indexed(100, 2, 2, "0x000000000000000000000000000000000000beef"),
            indexed(101, 1, 3, "0x000000000000000000000000000000000000beef"),
        ]);

        let written = sync_account_history(&mut conn, &account, &indexer, &setup, &LogNotifier)
            .await
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(get_confirmed_tx_count(&mut conn).await.unwrap(), 3);
        // one page with rows, one empty page to terminate
        assert_eq!(*indexer.calls.lock().unwrap(), 2);

        let page = get_confirmed_txs_page(&mut conn, &account, TX_TYPE_OUTGOING, 100, 0)
            .await
            .unwrap();
        let flagged: Vec<_> = page.iter().filter(|tx| tx.fetched_cursor).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].primary_index, 101);

        // Second pass with no new data: nothing written, cursor unmoved.
        let written = sync_account_history(&mut conn, &account, &indexer, &setup, &LogNotifier)
            .await
            .unwrap();
        assert_eq!(written, 0);
        let page = get_confirmed_txs_page(&mut conn, &account, TX_TYPE_OUTGOING, 100, 0)
            .await
            .unwrap();
        let flagged: Vec<_> = page.iter().filter(|tx| tx.fetched_cursor).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].primary_index, 101);
    }

    #[tokio::test]
    async fn test_local_pending_routed_through_confirmation() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let account = test_account();
        let setup = test_setup();

        let pending = TxPendingDao {
            id: 0,
            master_id: account.master_id.clone(),
            derivation_index: account.derivation_index,
            network_kind: account.network_kind.clone(),
            chain_id: account.chain_id,
            address: account.address.clone(),
            nonce: 5,
            kind: "eoa".to_string(),
            info: r#"{"kind":"eoa","txHash":"0xaa","signedRawData":null,"submittedBlock":null}"#
                .to_string(),
            tx_request: "{}".to_string(),
            function_sig: Some("transfer(address,uint256)".to_string()),
            start_block_number: None,
            created_date: Utc::now(),
        };
        insert_or_replace_pending_tx(&mut conn, &pending).await.unwrap();

        let indexer = StubIndexer::new(vec![indexed(200, 4, 5, ACCOUNT_ADDR)]);
        let written = sync_account_history(&mut conn, &account, &indexer, &setup, &LogNotifier)
            .await
            .unwrap();
        assert_eq!(written, 1);
        // The pending record was retired by the confirmation path, not
        // left behind next to a duplicate confirmed row.
        assert_eq!(get_pending_tx_count(&mut conn).await.unwrap(), 0);
        assert_eq!(get_confirmed_tx_count(&mut conn).await.unwrap(), 1);

        let page = get_confirmed_txs_page(&mut conn, &account, TX_TYPE_OUTGOING, 100, 0)
            .await
            .unwrap();
        assert_eq!(page[0].function_sig.as_deref(), Some("transfer(address,uint256)"));
        assert!(page[0].fetched_cursor);
    }

    #[tokio::test]
    async fn test_update_only_on_material_change() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let account = test_account();
        let setup = test_setup();
        let row = indexed(300, 0, 9, "0x000000000000000000000000000000000000beef");
        let indexer = StubIndexer::new(vec![row.clone()]);

        let written = sync_account_history(&mut conn, &account, &indexer, &setup, &LogNotifier)
            .await
            .unwrap();
        assert_eq!(written, 1);

        // Same row re-observed with a different outcome: updated in place.
        let mut failed = row;
        failed.chain_status = 0;
        let indexer = StubIndexer::new(vec![failed]);
        // Reset the cursor so the row is re-offered.
        let page = get_confirmed_txs_page(&mut conn, &account, TX_TYPE_OUTGOING, 100, 0)
            .await
            .unwrap();
        set_fetched_cursor(&mut conn, page[0].id, false).await.unwrap();

        let written = sync_account_history(&mut conn, &account, &indexer, &setup, &LogNotifier)
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(get_confirmed_tx_count(&mut conn).await.unwrap(), 1);
        let page = get_confirmed_txs_page(&mut conn, &account, TX_TYPE_OUTGOING, 100, 0)
            .await
            .unwrap();
        assert_eq!(page[0].chain_status, 0);
    }
}
