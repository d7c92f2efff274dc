use crate::account::AccountMeta;
use crate::db::model::TxPendingDao;
use sqlx::SqliteConnection;

/// Upsert keyed by (account, nonce). Submitting a replacement (speed-up or
/// cancel) at an occupied nonce overwrites the existing row in place, which
/// keeps the one-active-record-per-nonce invariant in the schema itself.
pub async fn insert_or_replace_pending_tx(
    conn: &mut SqliteConnection,
    tx: &TxPendingDao,
) -> Result<TxPendingDao, sqlx::Error> {
    let res = sqlx::query_as::<_, TxPendingDao>(
        r"INSERT INTO tx_pending
(master_id, derivation_index, network_kind, chain_id, address, nonce, kind, info, tx_request, function_sig, start_block_number, created_date)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (master_id, derivation_index, network_kind, chain_id, address, nonce)
DO UPDATE SET
kind = excluded.kind,
info = excluded.info,
tx_request = excluded.tx_request,
function_sig = excluded.function_sig,
start_block_number = excluded.start_block_number,
created_date = excluded.created_date
RETURNING *;
",
    )
    .bind(&tx.master_id)
    .bind(tx.derivation_index)
    .bind(&tx.network_kind)
    .bind(tx.chain_id)
    .bind(&tx.address)
    .bind(tx.nonce)
    .bind(&tx.kind)
    .bind(&tx.info)
    .bind(&tx.tx_request)
    .bind(&tx.function_sig)
    .bind(tx.start_block_number)
    .bind(tx.created_date)
    .fetch_one(conn)
    .await?;
    Ok(res)
}

pub async fn update_pending_tx(
    conn: &mut SqliteConnection,
    tx: &TxPendingDao,
) -> Result<TxPendingDao, sqlx::Error> {
    let _res = sqlx::query(
        r"UPDATE tx_pending SET
master_id = $2,
derivation_index = $3,
network_kind = $4,
chain_id = $5,
address = $6,
nonce = $7,
kind = $8,
info = $9,
tx_request = $10,
function_sig = $11,
start_block_number = $12,
created_date = $13
WHERE id = $1
",
    )
    .bind(tx.id)
    .bind(&tx.master_id)
    .bind(tx.derivation_index)
    .bind(&tx.network_kind)
    .bind(tx.chain_id)
    .bind(&tx.address)
    .bind(tx.nonce)
    .bind(&tx.kind)
    .bind(&tx.info)
    .bind(&tx.tx_request)
    .bind(&tx.function_sig)
    .bind(tx.start_block_number)
    .bind(tx.created_date)
    .execute(conn)
    .await?;
    Ok(tx.clone())
}

pub async fn get_all_pending_txs(
    conn: &mut SqliteConnection,
) -> Result<Vec<TxPendingDao>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TxPendingDao>(
        r"SELECT * FROM tx_pending ORDER BY chain_id, address, nonce",
    )
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn get_pending_txs_for_account(
    conn: &mut SqliteConnection,
    account: &AccountMeta,
) -> Result<Vec<TxPendingDao>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TxPendingDao>(
        r"SELECT * FROM tx_pending
WHERE
master_id = $1 AND
derivation_index = $2 AND
network_kind = $3 AND
chain_id = $4 AND
address = $5
ORDER BY nonce
",
    )
    .bind(&account.master_id)
    .bind(account.derivation_index)
    .bind(&account.network_kind)
    .bind(account.chain_id)
    .bind(&account.address)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn get_pending_tx_by_nonce(
    conn: &mut SqliteConnection,
    account: &AccountMeta,
    nonce: i64,
) -> Result<Option<TxPendingDao>, sqlx::Error> {
    let row = sqlx::query_as::<_, TxPendingDao>(
        r"SELECT * FROM tx_pending
WHERE
master_id = $1 AND
derivation_index = $2 AND
network_kind = $3 AND
chain_id = $4 AND
address = $5 AND
nonce = $6
",
    )
    .bind(&account.master_id)
    .bind(account.derivation_index)
    .bind(&account.network_kind)
    .bind(account.chain_id)
    .bind(&account.address)
    .bind(nonce)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

pub async fn delete_pending_tx(
    conn: &mut SqliteConnection,
    tx_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(r"DELETE FROM tx_pending WHERE id = $1")
        .bind(tx_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_pending_tx_count(conn: &mut SqliteConnection) -> Result<usize, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>(r"SELECT COUNT(*) FROM tx_pending")
        .fetch_one(conn)
        .await?;
    Ok(count as usize)
}
