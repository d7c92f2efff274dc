use crate::account::AccountMeta;
use crate::contracts::ENTRY_POINT_CONTRACT_TEMPLATE;
use crate::db::model::{TxConfirmedDao, TxPendingDao};
use crate::db::ops::{
    delete_pending_tx, get_confirmed_tx_by_order_key, insert_confirmed_tx, update_confirmed_tx,
    update_pending_tx,
};
use crate::error::{EngineError, TransactionFailedError};
use crate::eth::get_transaction_count;
use crate::model::{OrderKey, TxRequestFields, TxSubmission};
use crate::setup::{ChainSetup, EngineSetup};
use crate::transaction::{find_receipt, find_transaction};
use crate::{err_create, err_custom_create, err_from};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use sqlx::{Connection, SqliteConnection};
use std::str::FromStr;
use std::time::{Duration, Instant};
use web3::api::Eth;
use web3::contract::{Contract, Options};
use web3::transports::Http;
use web3::types::{Address, BlockId, BlockNumber, Transaction, TransactionReceipt, H256, U256};
use web3::{Transport, Web3};

/// Logical record type under which locally originated transactions are
/// filed; the history synchronizer uses the same value so both writers hit
/// one keyspace.
pub const TX_TYPE_OUTGOING: &str = "outgoing";

/// Outcome of one bounded wait cycle. A timeout is data: the record stays
/// pending with a refreshed watermark and the caller decides when to retry.
#[derive(Debug)]
pub enum WaitOutcome {
    Confirmed(TxConfirmedDao),
    Pending(String),
    Abandoned(String),
}

/// Invoked with the settled record strictly after the store transaction
/// that wrote it has committed.
pub trait ConfirmationNotifier: Send + Sync {
    fn notify(&self, tx: &TxConfirmedDao, explorer_url: Option<String>);
}

pub struct LogNotifier;

impl ConfirmationNotifier for LogNotifier {
    fn notify(&self, tx: &TxConfirmedDao, explorer_url: Option<String>) {
        let fee = tx
            .fee_paid
            .as_ref()
            .and_then(|fee| U256::from_dec_str(fee).ok())
            .and_then(|fee| crate::utils::u256_to_rust_dec(fee, None).ok())
            .map(|fee| format!(", fee paid {}", fee))
            .unwrap_or_default();
        log::info!(
            "Transaction confirmed: {} block {} status {}{}{}",
            tx.tx_hash,
            tx.primary_index,
            tx.chain_status,
            fee,
            explorer_url
                .map(|url| format!(" ({})", url))
                .unwrap_or_default()
        );
    }
}

enum PollResult {
    Included(TxConfirmedDao),
    StillPending(String),
    Abandoned(String),
}

/// Blocks the watermark must cover so a restart never misses the submitted
/// transaction: twice the polling interval plus 500ms, rounded up to whole
/// blocks.
fn watermark_margin_blocks(poll_interval_seconds: u64, block_time_seconds: u64) -> u64 {
    let margin_ms = 2 * poll_interval_seconds * 1000 + 500;
    let block_ms = (block_time_seconds * 1000).max(1);
    (margin_ms + block_ms - 1) / block_ms
}

/// "Cancelled" is a caller facing label, not a chain concept: the canonical
/// nonce-burn pattern is a zero value self-send with no call data, detected
/// post hoc on the settled record.
pub fn is_cancellation(tx: &TxConfirmedDao) -> bool {
    let self_send = tx
        .to_addr
        .as_ref()
        .map(|to| to.eq_ignore_ascii_case(&tx.from_addr))
        .unwrap_or(false);
    let empty_data = match &tx.call_data {
        None => true,
        Some(data) => crate::utils::trim_hex_prefix(data).is_empty(),
    };
    let zero_value = U256::from_dec_str(&tx.val)
        .map(|v| v.is_zero())
        .unwrap_or(false);
    self_send && empty_data && zero_value
}

/// Identity-only account view of a stored record, enough for keyed lookups.
pub fn account_from_pending(pending: &TxPendingDao) -> AccountMeta {
    AccountMeta {
        master_id: pending.master_id.clone(),
        derivation_index: pending.derivation_index,
        network_kind: pending.network_kind.clone(),
        chain_id: pending.chain_id,
        address: pending.address.clone(),
        smart_account: None,
        multisig: None,
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn confirmed_candidate(
    pending: &TxPendingDao,
    order_key: &OrderKey,
    tx_hash: &str,
    to_addr: Option<String>,
    val: String,
    call_data: Option<String>,
    chain_status: i64,
    gas_used: Option<String>,
    fee_paid: Option<String>,
    blockchain_date: DateTime<Utc>,
) -> TxConfirmedDao {
    TxConfirmedDao {
        id: 0,
        master_id: pending.master_id.clone(),
        derivation_index: pending.derivation_index,
        network_kind: pending.network_kind.clone(),
        chain_id: pending.chain_id,
        address: pending.address.clone(),
        tx_type: TX_TYPE_OUTGOING.to_string(),
        primary_index: order_key.primary,
        secondary_index: order_key.secondary.clone(),
        nonce: pending.nonce,
        tx_hash: tx_hash.to_string(),
        kind: pending.kind.clone(),
        info: pending.info.clone(),
        from_addr: pending.address.clone(),
        to_addr,
        val,
        call_data,
        function_sig: pending.function_sig.clone(),
        chain_status,
        gas_used,
        fee_paid,
        blockchain_date,
        checked_date: Utc::now(),
        fetched_cursor: false,
    }
}

async fn block_timestamp(
    web3: &Web3<Http>,
    block_number: u64,
) -> Result<DateTime<Utc>, EngineError> {
    let block = web3
        .eth()
        .block(BlockId::Number(BlockNumber::Number(block_number.into())))
        .await
        .map_err(err_from!())?
        .ok_or_else(|| err_custom_create!("Block {} not found", block_number))?;
    Utc.timestamp_opt(block.timestamp.as_u64() as i64, 0)
        .single()
        .ok_or_else(|| err_custom_create!("Invalid block timestamp on block {}", block_number))
}

/// Merge-or-create at the order key, then atomically swap the pending
/// record for the confirmed one. The notifier only fires after the commit,
/// so a crash in between leaves a re-runnable state, never a half-written
/// one.
pub async fn record_confirmed_tx(
    conn: &mut SqliteConnection,
    pending: &TxPendingDao,
    confirmed: TxConfirmedDao,
    setup: &EngineSetup,
    notifier: &dyn ConfirmationNotifier,
) -> Result<TxConfirmedDao, EngineError> {
    let account = account_from_pending(pending);
    let order_key = OrderKey {
        primary: confirmed.primary_index,
        secondary: confirmed.secondary_index.clone(),
    };
    let existing = get_confirmed_tx_by_order_key(conn, &account, &confirmed.tx_type, &order_key)
        .await
        .map_err(err_from!())?;

    let mut db_transaction = conn.begin().await.map_err(err_from!())?;
    let stored = match existing {
        Some(old) => {
            let mut merged = confirmed;
            merged.id = old.id;
            merged.fetched_cursor = old.fetched_cursor;
            update_confirmed_tx(&mut db_transaction, &merged)
                .await
                .map_err(err_from!())?;
            merged
        }
        None => insert_confirmed_tx(&mut db_transaction, &confirmed)
            .await
            .map_err(err_from!())?,
    };
    delete_pending_tx(&mut db_transaction, pending.id)
        .await
        .map_err(err_from!())?;
    db_transaction.commit().await.map_err(err_from!())?;

    notifier.notify(
        &stored,
        setup.explorer_tx_url(stored.chain_id, &stored.tx_hash),
    );
    if is_cancellation(&stored) {
        log::info!(
            "Settled transaction {} classified as cancellation",
            stored.tx_hash
        );
    }
    Ok(stored)
}

/// Wait until the pending record resolves or the polling timeout elapses.
/// At most one wait may be active per record; a speed-up or cancel must go
/// through submitting a superseding record at the same nonce, never through
/// a second concurrent wait.
pub async fn wait_for_pending_tx(
    conn: &mut SqliteConnection,
    pending: &mut TxPendingDao,
    setup: &EngineSetup,
    notifier: &dyn ConfirmationNotifier,
) -> Result<WaitOutcome, EngineError> {
    let chain_setup = setup
        .get_chain_setup(pending.chain_id)
        .map_err(|_e| {
            err_create!(TransactionFailedError::new(&format!(
                "Failed to get chain setup for chain id: {}",
                pending.chain_id
            )))
        })?
        .clone();
    let web3 = setup.get_provider(pending.chain_id).await.map_err(|_e| {
        err_create!(TransactionFailedError::new(&format!(
            "Failed to get provider for chain id: {}",
            pending.chain_id
        )))
    })?;
    let submission: TxSubmission = serde_json::from_str(&pending.info).map_err(err_from!())?;

    let margin = watermark_margin_blocks(
        chain_setup.poll_interval_seconds,
        chain_setup.block_time_seconds,
    );
    let current_block = web3.eth().block_number().await.map_err(err_from!())?.as_u64();

    // Checkpoint the resume point before the first blocking wait so a
    // restart can pick up the search from a safe height instead of genesis.
    if pending.start_block_number.is_none() {
        pending.start_block_number = Some(current_block.saturating_sub(margin) as i64);
        update_pending_tx(conn, pending).await.map_err(err_from!())?;
    }

    let deadline = Instant::now() + Duration::from_secs(chain_setup.transaction_timeout);
    let poll_result = match &submission {
        TxSubmission::Eoa { tx_hash, .. } => {
            wait_eoa(&web3, &chain_setup, pending, tx_hash, deadline).await?
        }
        TxSubmission::SmartAccount {
            user_op_hash,
            entry_point,
            sender_nonce,
        } => {
            wait_user_operation(
                &web3,
                setup,
                &chain_setup,
                pending,
                user_op_hash,
                entry_point,
                *sender_nonce,
                deadline,
            )
            .await?
        }
        TxSubmission::Multisig { safe_tx_hash, .. } => {
            wait_safe_tx(&web3, &chain_setup, pending, safe_tx_hash, deadline).await?
        }
    };

    match poll_result {
        PollResult::Included(confirmed) => {
            let stored = record_confirmed_tx(conn, pending, confirmed, setup, notifier).await?;
            Ok(WaitOutcome::Confirmed(stored))
        }
        PollResult::StillPending(reason) => {
            let current_block = web3.eth().block_number().await.map_err(err_from!())?.as_u64();
            pending.start_block_number = Some(current_block.saturating_sub(margin) as i64);
            update_pending_tx(conn, pending).await.map_err(err_from!())?;
            log::info!(
                "Transaction at nonce {} still pending: {}",
                pending.nonce,
                reason
            );
            Ok(WaitOutcome::Pending(reason))
        }
        PollResult::Abandoned(reason) => {
            log::warn!(
                "Transaction at nonce {} abandoned: {}",
                pending.nonce,
                reason
            );
            delete_pending_tx(conn, pending.id).await.map_err(err_from!())?;
            Ok(WaitOutcome::Abandoned(reason))
        }
    }
}

fn stored_request(pending: &TxPendingDao) -> Result<TxRequestFields, EngineError> {
    serde_json::from_str(&pending.tx_request).map_err(err_from!())
}

/// Find the transaction occupying (account, nonce) by scanning block bodies
/// from the watermark forward. Used when the account nonce advanced but the
/// submitted hash has no receipt, the replacement / speed-up case.
async fn find_tx_by_nonce(
    web3: &Web3<Http>,
    from_addr: Address,
    nonce: u64,
    start_block: u64,
    end_block: u64,
) -> Result<Option<Transaction>, EngineError> {
    for block_number in start_block..=end_block {
        let block = web3
            .eth()
            .block_with_txs(BlockId::Number(BlockNumber::Number(block_number.into())))
            .await
            .map_err(err_from!())?;
        if let Some(block) = block {
            for tx in block.transactions {
                if tx.from == Some(from_addr) && tx.nonce == U256::from(nonce) {
                    return Ok(Some(tx));
                }
            }
        }
    }
    Ok(None)
}

async fn eoa_inclusion(
    web3: &Web3<Http>,
    pending: &TxPendingDao,
    receipt: &TransactionReceipt,
    submitted_hash: H256,
    last_seen_block: Option<u64>,
) -> Result<TxConfirmedDao, EngineError> {
    let block_number = receipt
        .block_number
        .ok_or_else(|| err_custom_create!("Receipt without block number"))?
        .as_u64();

    // A different hash means a gas-bump replacement was mined; a different
    // inclusion height than previously observed means a reorg moved us.
    let diverged = receipt.transaction_hash != submitted_hash
        || last_seen_block.map(|b| b != block_number).unwrap_or(false);
    let (to_addr, val, call_data) = if diverged {
        // Replacement or reorg: the mined payload is not necessarily the
        // one we signed, so read the canonical transaction back by the
        // receipt-reported hash before recording anything.
        let canonical = find_transaction(web3, receipt.transaction_hash)
            .await?
            .ok_or_else(|| {
                err_custom_create!(
                    "Receipt for {:#x} has no canonical transaction",
                    receipt.transaction_hash
                )
            })?;
        (
            canonical.to.map(|to| format!("{:#x}", to)),
            canonical.value.to_string(),
            if canonical.input.0.is_empty() {
                None
            } else {
                Some(format!("0x{}", hex::encode(&canonical.input.0)))
            },
        )
    } else {
        let request = stored_request(pending)?;
        (
            request.to.clone(),
            request.value.clone().unwrap_or_else(|| "0".to_string()),
            request.data.clone(),
        )
    };

    let order_key = OrderKey::for_block_pos(block_number as i64, receipt.transaction_index.as_u64() as i64);
    let fee_paid = match (receipt.gas_used, receipt.effective_gas_price) {
        (Some(gas_used), Some(price)) => Some((gas_used * price).to_string()),
        _ => None,
    };
    Ok(confirmed_candidate(
        pending,
        &order_key,
        &format!("{:#x}", receipt.transaction_hash),
        to_addr,
        val,
        call_data,
        receipt.status.map(|s| s.as_u64() as i64).unwrap_or(0),
        receipt.gas_used.map(|g| g.to_string()),
        fee_paid,
        block_timestamp(web3, block_number).await?,
    ))
}

async fn wait_eoa(
    web3: &Web3<Http>,
    chain_setup: &ChainSetup,
    pending: &TxPendingDao,
    tx_hash: &str,
    deadline: Instant,
) -> Result<PollResult, EngineError> {
    let from_addr = Address::from_str(&pending.address).map_err(err_from!())?;
    let submitted_hash = H256::from_str(tx_hash).map_err(err_from!())?;
    let mut current_hash = submitted_hash;
    let mut last_seen_block: Option<u64> = None;
    let wait_duration = Duration::from_secs(chain_setup.poll_interval_seconds);

    loop {
        if let Some(receipt) = find_receipt(web3, current_hash).await? {
            if let Some(block_number) = receipt.block_number {
                let latest_block = web3.eth().block_number().await.map_err(err_from!())?.as_u64();
                if block_number.as_u64() + chain_setup.confirmation_blocks <= latest_block {
                    let confirmed =
                        eoa_inclusion(web3, pending, &receipt, submitted_hash, last_seen_block)
                            .await?;
                    return Ok(PollResult::Included(confirmed));
                }
                log::info!(
                    "Waiting for confirmations of {:#x}: block {}, need {} more",
                    current_hash,
                    block_number,
                    block_number.as_u64() + chain_setup.confirmation_blocks - latest_block
                );
                last_seen_block = Some(block_number.as_u64());
            }
        } else {
            let latest_nonce = get_transaction_count(from_addr, web3, false)
                .await
                .map_err(err_from!())?;
            if latest_nonce > pending.nonce as u64 {
                // Someone owns our nonce but it is not the hash we sent:
                // search from the watermark for the occupant.
                let latest_block =
                    web3.eth().block_number().await.map_err(err_from!())?.as_u64();
                let start_block = pending
                    .start_block_number
                    .map(|b| b as u64)
                    .unwrap_or(latest_block);
                match find_tx_by_nonce(
                    web3,
                    from_addr,
                    pending.nonce as u64,
                    start_block,
                    latest_block,
                )
                .await?
                {
                    Some(replacement) => {
                        if replacement.hash != current_hash {
                            log::warn!(
                                "Transaction {:#x} superseded by {:#x} at nonce {}",
                                current_hash,
                                replacement.hash,
                                pending.nonce
                            );
                            current_hash = replacement.hash;
                            continue;
                        }
                    }
                    None => {
                        return Ok(PollResult::StillPending(
                            "Nonce advanced but occupant not found in scanned range".to_string(),
                        ));
                    }
                }
            }
        }
        if Instant::now() >= deadline {
            return Ok(PollResult::StillPending("Polling timeout".to_string()));
        }
        tokio::time::sleep(wait_duration).await;
    }
}

async fn entry_point_nonce(
    eth: Eth<Http>,
    entry_point: Address,
    sender: Address,
) -> Result<u64, EngineError> {
    let contract = Contract::new(eth, entry_point, ENTRY_POINT_CONTRACT_TEMPLATE.abi().clone());
    let nonce: U256 = contract
        .query(
            "getNonce",
            (sender, U256::zero()),
            None,
            Options::default(),
            None,
        )
        .await
        .map_err(err_from!())?;
    Ok(nonce.as_u64())
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UserOperationReceipt {
    success: bool,
    #[serde(default)]
    actual_gas_used: Option<U256>,
    #[serde(default)]
    actual_gas_cost: Option<U256>,
    receipt: UnderlyingReceipt,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UnderlyingReceipt {
    transaction_hash: H256,
    block_number: U256,
}

fn is_missing_op_error(err: &web3::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("not found") || msg.contains("missing") || msg.contains("invalid")
}

#[allow(clippy::too_many_arguments)]
async fn wait_user_operation(
    web3: &Web3<Http>,
    setup: &EngineSetup,
    chain_setup: &ChainSetup,
    pending: &TxPendingDao,
    user_op_hash: &str,
    entry_point: &str,
    sender_nonce: u64,
    deadline: Instant,
) -> Result<PollResult, EngineError> {
    let bundler = setup.get_bundler(pending.chain_id).await?;
    let sender = Address::from_str(&pending.address).map_err(err_from!())?;
    let entry_point_addr = Address::from_str(entry_point).map_err(err_from!())?;
    let wait_duration = Duration::from_secs(chain_setup.poll_interval_seconds);

    loop {
        let response = bundler
            .transport()
            .execute(
                "eth_getUserOperationReceipt",
                vec![web3::helpers::serialize(&user_op_hash)],
            )
            .await;

        match response {
            Ok(value) if !value.is_null() => {
                let op_receipt: UserOperationReceipt =
                    serde_json::from_value(value).map_err(err_from!())?;
                let block_number = op_receipt.receipt.block_number.as_u64();
                // The bundler's word is not authoritative for the payload;
                // read the bundle transaction back from the chain.
                let canonical =
                    find_transaction(web3, op_receipt.receipt.transaction_hash).await?;
                if canonical.is_none() {
                    log::warn!(
                        "Bundle transaction {:#x} not yet visible on chain",
                        op_receipt.receipt.transaction_hash
                    );
                } else {
                    let request = stored_request(pending)?;
                    let order_key = OrderKey::for_operation(block_number as i64, user_op_hash);
                    let confirmed = confirmed_candidate(
                        pending,
                        &order_key,
                        &format!("{:#x}", op_receipt.receipt.transaction_hash),
                        request.to.clone(),
                        request.value.clone().unwrap_or_else(|| "0".to_string()),
                        request.data.clone(),
                        if op_receipt.success { 1 } else { 0 },
                        op_receipt.actual_gas_used.map(|g| g.to_string()),
                        op_receipt.actual_gas_cost.map(|c| c.to_string()),
                        block_timestamp(web3, block_number).await?,
                    );
                    return Ok(PollResult::Included(confirmed));
                }
            }
            Ok(_null) => {
                // Operation unknown to the bundler. Disambiguate through the
                // entry point counter: if it moved past our nonce the
                // operation most likely landed through a race and a later
                // poll will see it.
                let counter = entry_point_nonce(web3.eth(), entry_point_addr, sender).await?;
                if counter > sender_nonce {
                    return Ok(PollResult::StillPending(
                        "Entry point counter advanced past submitted nonce".to_string(),
                    ));
                }
                if Instant::now() >= deadline {
                    return Ok(PollResult::Abandoned(
                        "User operation unknown to bundler and counter not advanced".to_string(),
                    ));
                }
            }
            Err(err) if is_missing_op_error(&err) => {
                let counter = entry_point_nonce(web3.eth(), entry_point_addr, sender).await?;
                if counter > sender_nonce {
                    return Ok(PollResult::StillPending(
                        "Entry point counter advanced past submitted nonce".to_string(),
                    ));
                }
                if Instant::now() >= deadline {
                    return Ok(PollResult::Abandoned(format!(
                        "User operation rejected by bundler: {}",
                        err
                    )));
                }
            }
            Err(err) => return Err(err_create!(err)),
        }
        if Instant::now() >= deadline {
            return Ok(PollResult::StillPending("Polling timeout".to_string()));
        }
        tokio::time::sleep(wait_duration).await;
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SafeServiceTx {
    is_executed: bool,
    #[serde(default)]
    is_successful: Option<bool>,
    #[serde(default)]
    transaction_hash: Option<String>,
}

async fn wait_safe_tx(
    web3: &Web3<Http>,
    chain_setup: &ChainSetup,
    pending: &TxPendingDao,
    safe_tx_hash: &str,
    deadline: Instant,
) -> Result<PollResult, EngineError> {
    let service_url = chain_setup.safe_service_url.as_ref().ok_or_else(|| {
        err_custom_create!(
            "No safe service configured for chain id: {}",
            chain_setup.chain_id
        )
    })?;
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/v1/multisig-transactions/{}/",
        service_url.trim_end_matches('/'),
        safe_tx_hash
    );
    let wait_duration = Duration::from_secs(chain_setup.poll_interval_seconds);

    loop {
        let response = client.get(&url).send().await.map_err(err_from!())?;
        if response.status().is_success() {
            let safe_tx: SafeServiceTx = response.json().await.map_err(err_from!())?;
            if safe_tx.is_executed {
                let eth_tx_hash = safe_tx.transaction_hash.as_ref().ok_or_else(|| {
                    err_custom_create!("Executed safe transaction without an ethereum hash")
                })?;
                let eth_tx_hash = H256::from_str(eth_tx_hash).map_err(err_from!())?;
                if let Some(receipt) = find_receipt(web3, eth_tx_hash).await? {
                    if let Some(block_number) = receipt.block_number {
                        let request = stored_request(pending)?;
                        let order_key = OrderKey::for_block_pos(
                            block_number.as_u64() as i64,
                            receipt.transaction_index.as_u64() as i64,
                        );
                        let confirmed = confirmed_candidate(
                            pending,
                            &order_key,
                            &format!("{:#x}", eth_tx_hash),
                            request.to.clone(),
                            request.value.clone().unwrap_or_else(|| "0".to_string()),
                            request.data.clone(),
                            if safe_tx.is_successful.unwrap_or(false) { 1 } else { 0 },
                            receipt.gas_used.map(|g| g.to_string()),
                            receipt
                                .gas_used
                                .zip(receipt.effective_gas_price)
                                .map(|(gas, price)| (gas * price).to_string()),
                            block_timestamp(web3, block_number.as_u64()).await?,
                        );
                        return Ok(PollResult::Included(confirmed));
                    }
                }
                log::info!(
                    "Safe transaction {} executed, waiting for on-chain receipt",
                    safe_tx_hash
                );
            }
        } else if response.status() == reqwest::StatusCode::NOT_FOUND {
            log::debug!("Safe transaction {} not yet known to service", safe_tx_hash);
        } else {
            return Err(err_custom_create!(
                "Safe service returned status {} for {}",
                response.status(),
                url
            ));
        }
        if Instant::now() >= deadline {
            // A multisig can legitimately wait on signatures for a long
            // time; the record stays pending.
            return Ok(PollResult::StillPending(
                "Safe transaction not executed yet".to_string(),
            ));
        }
        tokio::time::sleep(wait_duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_sqlite_connection;
    use crate::db::ops::{get_confirmed_tx_count, get_pending_tx_count, insert_or_replace_pending_tx};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_pending(nonce: i64) -> TxPendingDao {
        TxPendingDao {
            id: 0,
            master_id: "master-1".to_string(),
            derivation_index: 0,
            network_kind: "evm".to_string(),
            chain_id: 5,
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".to_string(),
            nonce,
            kind: "eoa".to_string(),
            info: r#"{"kind":"eoa","txHash":"0xaa","signedRawData":null,"submittedBlock":null}"#
                .to_string(),
            tx_request: "{}".to_string(),
            function_sig: None,
            start_block_number: None,
            created_date: Utc::now(),
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
explorer-url = "https://goerli.etherscan.io"
"#,
        )
        .unwrap();
        EngineSetup::new(&config, 10, 10, 300).unwrap()
    }

    struct CountingNotifier {
        calls: AtomicUsize,
    }

    impl ConfirmationNotifier for CountingNotifier {
        fn notify(&self, _tx: &TxConfirmedDao, _explorer_url: Option<String>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_watermark_margin_blocks() {
        // 2 * 5s + 0.5s = 10.5s over 12s blocks -> 1 block
        assert_eq!(watermark_margin_blocks(5, 12), 1);
        // 2 * 30s + 0.5s = 60.5s over 12s blocks -> 6 blocks, rounded up
        assert_eq!(watermark_margin_blocks(30, 12), 6);
        // sub-second block time still yields a nonzero margin
        assert!(watermark_margin_blocks(5, 1) >= 10);
    }

    #[test]
    fn test_cancellation_detection() {
        let pending = test_pending(1);
        let candidate = |to: Option<&str>, data: Option<&str>, val: &str| {
            confirmed_candidate(
                &pending,
                &OrderKey::for_block_pos(10, 0),
                "0xaa",
                to.map(|t| t.to_string()),
                val.to_string(),
                data.map(|d| d.to_string()),
                1,
                None,
                None,
                Utc::now(),
            )
        };
        let self_addr = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

        assert!(is_cancellation(&candidate(Some(self_addr), None, "0")));
        assert!(is_cancellation(&candidate(Some(self_addr), Some("0x"), "0")));
        // to != from
        assert!(!is_cancellation(&candidate(
            Some("0x000000000000000000000000000000000000dead"),
            None,
            "0"
        )));
        // non-empty data
        assert!(!is_cancellation(&candidate(
            Some(self_addr),
            Some("0xdeadbeef"),
            "0"
        )));
        // non-zero value
        assert!(!is_cancellation(&candidate(Some(self_addr), None, "1")));
        // missing to
        assert!(!is_cancellation(&candidate(None, None, "0")));
    }

    #[tokio::test]
    async fn test_record_confirmed_is_idempotent() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let setup = test_setup();
        let notifier = CountingNotifier {
            calls: AtomicUsize::new(0),
        };

        let pending = insert_or_replace_pending_tx(&mut conn, &test_pending(3))
            .await
            .unwrap();
        let order_key = OrderKey::for_block_pos(100, 2);
        let candidate = confirmed_candidate(
            &pending,
            &order_key,
            "0xbb",
            Some("0x000000000000000000000000000000000000dead".to_string()),
            "10".to_string(),
            None,
            1,
            Some("21000".to_string()),
            Some("42000000000000".to_string()),
            Utc::now(),
        );

        let first = record_confirmed_tx(&mut conn, &pending, candidate.clone(), &setup, &notifier)
            .await
            .unwrap();
        assert_eq!(get_pending_tx_count(&mut conn).await.unwrap(), 0);
        assert_eq!(get_confirmed_tx_count(&mut conn).await.unwrap(), 1);

        // A second run over the same inclusion result merges in place.
        let second = record_confirmed_tx(&mut conn, &pending, candidate, &setup, &notifier)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(get_confirmed_tx_count(&mut conn).await.unwrap(), 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_record_confirmed_preserves_cursor_flag() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let setup = test_setup();
        let pending = insert_or_replace_pending_tx(&mut conn, &test_pending(4))
            .await
            .unwrap();
        let order_key = OrderKey::for_block_pos(50, 0);
        let candidate = confirmed_candidate(
            &pending,
            &order_key,
            "0xcc",
            None,
            "0".to_string(),
            None,
            1,
            None,
            None,
            Utc::now(),
        );
        let stored = record_confirmed_tx(&mut conn, &pending, candidate.clone(), &setup, &LogNotifier)
            .await
            .unwrap();
        crate::db::ops::set_fetched_cursor(&mut conn, stored.id, true)
            .await
            .unwrap();

        // Re-observation with differing outcome keeps the cursor flag.
        let mut updated = candidate;
        updated.chain_status = 0;
        let merged = record_confirmed_tx(&mut conn, &pending, updated, &setup, &LogNotifier)
            .await
            .unwrap();
        assert!(merged.fetched_cursor);
        assert_eq!(merged.chain_status, 0);
    }
}
