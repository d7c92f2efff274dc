use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::ops::get_all_pending_txs;
use crate::error::EngineError;
use crate::process::{ConfirmationNotifier, WaitOutcome};
use crate::router::TxRouter;
use crate::runtime::SharedState;
use crate::err_from;

use sqlx::SqliteConnection;

/// One pass over every stored pending record. Each record gets a single
/// bounded wait; timeouts leave the record pending for the next pass, so
/// this function always terminates. Records are visited sequentially, which
/// keeps the one-wait-per-record rule without any extra locking.
pub async fn process_pending_once(
    conn: &mut SqliteConnection,
    router: &TxRouter,
    notifier: &dyn ConfirmationNotifier,
) -> Result<(usize, usize), EngineError> {
    let pending_txs = get_all_pending_txs(conn).await.map_err(err_from!())?;
    let mut confirmed = 0;
    let mut still_pending = 0;
    for mut pending in pending_txs {
        log::debug!(
            "Processing pending tx {} (chain {}, nonce {})",
            pending.id,
            pending.chain_id,
            pending.nonce
        );
        match router.wait_for_tx(conn, &mut pending, notifier).await {
            Ok(WaitOutcome::Confirmed(_)) => confirmed += 1,
            Ok(WaitOutcome::Pending(_)) => still_pending += 1,
            Ok(WaitOutcome::Abandoned(reason)) => {
                log::warn!("Pending tx {} abandoned: {}", pending.id, reason);
            }
            Err(err) => {
                // One failing record must not starve the rest of the queue.
                log::error!("Error while processing pending tx {}: {}", pending.id, err);
                still_pending += 1;
            }
        }
    }
    Ok((confirmed, still_pending))
}

/// One history pass over every configured account that has an indexer.
pub async fn sync_history_once(
    conn: &mut SqliteConnection,
    router: &TxRouter,
    notifier: &dyn ConfirmationNotifier,
) -> Result<u64, EngineError> {
    let accounts = router.setup.accounts.clone();
    let mut written = 0;
    for account in accounts {
        let has_indexer = router
            .setup
            .get_chain_setup(account.chain_id)
            .map(|chain| chain.indexer_url.is_some())
            .unwrap_or(false);
        if !has_indexer {
            continue;
        }
        match router.fetch_transactions(conn, &account, notifier).await {
            Ok(count) => written += count,
            Err(err) => {
                log::error!(
                    "History sync failed for {} on chain {}: {}",
                    account.address,
                    account.chain_id,
                    err
                );
            }
        }
    }
    Ok(written)
}

/// The engine's driver loop. Scheduling lives here, outside the core
/// operations, which stay single-pass and caller driven.
pub async fn service_loop(
    shared_state: Arc<Mutex<SharedState>>,
    conn: &mut SqliteConnection,
    router: &TxRouter,
    notifier: &dyn ConfirmationNotifier,
) {
    let service_sleep = router.setup.service_sleep;
    loop {
        let pass_id = uuid::Uuid::new_v4();
        {
            let mut state = shared_state.lock().await;
            state.idling = false;
        }
        match process_pending_once(conn, router, notifier).await {
            Ok((confirmed, still_pending)) => {
                if confirmed > 0 || still_pending > 0 {
                    log::info!(
                        "Service pass {}: {} confirmed, {} still pending",
                        pass_id,
                        confirmed,
                        still_pending
                    );
                }
                let mut state = shared_state.lock().await;
                state.confirmed += confirmed;
            }
            Err(err) => {
                log::error!("Service pass failed: {}", err);
            }
        }
        match sync_history_once(conn, router, notifier).await {
            Ok(written) => {
                let mut state = shared_state.lock().await;
                state.synced += written as usize;
            }
            Err(err) => {
                log::error!("History pass failed: {}", err);
            }
        }
        {
            let mut state = shared_state.lock().await;
            state.idling = true;
        }
        tokio::time::sleep(std::time::Duration::from_secs(service_sleep)).await;
    }
}
