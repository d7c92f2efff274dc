use crate::account::AccountMeta;
use crate::db::model::TxConfirmedDao;
use crate::model::OrderKey;
use sqlx::SqliteConnection;

pub async fn insert_confirmed_tx(
    conn: &mut SqliteConnection,
    tx: &TxConfirmedDao,
) -> Result<TxConfirmedDao, sqlx::Error> {
    let res = sqlx::query_as::<_, TxConfirmedDao>(
        r"INSERT INTO tx_confirmed
(master_id, derivation_index, network_kind, chain_id, address, tx_type, primary_index, secondary_index, nonce, tx_hash, kind, info, from_addr, to_addr, val, call_data, function_sig, chain_status, gas_used, fee_paid, blockchain_date, checked_date, fetched_cursor)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23) RETURNING *;
",
    )
    .bind(&tx.master_id)
    .bind(tx.derivation_index)
    .bind(&tx.network_kind)
    .bind(tx.chain_id)
    .bind(&tx.address)
    .bind(&tx.tx_type)
    .bind(tx.primary_index)
    .bind(&tx.secondary_index)
    .bind(tx.nonce)
    .bind(&tx.tx_hash)
    .bind(&tx.kind)
    .bind(&tx.info)
    .bind(&tx.from_addr)
    .bind(&tx.to_addr)
    .bind(&tx.val)
    .bind(&tx.call_data)
    .bind(&tx.function_sig)
    .bind(tx.chain_status)
    .bind(&tx.gas_used)
    .bind(&tx.fee_paid)
    .bind(tx.blockchain_date)
    .bind(tx.checked_date)
    .bind(tx.fetched_cursor)
    .fetch_one(conn)
    .await?;
    Ok(res)
}

pub async fn update_confirmed_tx(
    conn: &mut SqliteConnection,
    tx: &TxConfirmedDao,
) -> Result<TxConfirmedDao, sqlx::Error> {
    let _res = sqlx::query(
        r"UPDATE tx_confirmed SET
master_id = $2,
derivation_index = $3,
network_kind = $4,
chain_id = $5,
address = $6,
tx_type = $7,
primary_index = $8,
secondary_index = $9,
nonce = $10,
tx_hash = $11,
kind = $12,
info = $13,
from_addr = $14,
to_addr = $15,
val = $16,
call_data = $17,
function_sig = $18,
chain_status = $19,
gas_used = $20,
fee_paid = $21,
blockchain_date = $22,
checked_date = $23,
fetched_cursor = $24
WHERE id = $1
",
    )
    .bind(tx.id)
    .bind(&tx.master_id)
    .bind(tx.derivation_index)
    .bind(&tx.network_kind)
    .bind(tx.chain_id)
    .bind(&tx.address)
    .bind(&tx.tx_type)
    .bind(tx.primary_index)
    .bind(&tx.secondary_index)
    .bind(tx.nonce)
    .bind(&tx.tx_hash)
    .bind(&tx.kind)
    .bind(&tx.info)
    .bind(&tx.from_addr)
    .bind(&tx.to_addr)
    .bind(&tx.val)
    .bind(&tx.call_data)
    .bind(&tx.function_sig)
    .bind(tx.chain_status)
    .bind(&tx.gas_used)
    .bind(&tx.fee_paid)
    .bind(tx.blockchain_date)
    .bind(tx.checked_date)
    .bind(tx.fetched_cursor)
    .execute(conn)
    .await?;
    Ok(tx.clone())
}

pub async fn get_confirmed_tx_by_order_key(
    conn: &mut SqliteConnection,
    account: &AccountMeta,
    tx_type: &str,
    order_key: &OrderKey,
) -> Result<Option<TxConfirmedDao>, sqlx::Error> {
    let row = sqlx::query_as::<_, TxConfirmedDao>(
        r"SELECT * FROM tx_confirmed
WHERE
master_id = $1 AND
derivation_index = $2 AND
network_kind = $3 AND
chain_id = $4 AND
address = $5 AND
tx_type = $6 AND
primary_index = $7 AND
secondary_index = $8
",
    )
    .bind(&account.master_id)
    .bind(account.derivation_index)
    .bind(&account.network_kind)
    .bind(account.chain_id)
    .bind(&account.address)
    .bind(tx_type)
    .bind(order_key.primary)
    .bind(&order_key.secondary)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Page of confirmed records for the (account, type) pair, newest first.
/// Used by the history synchronizer to walk backward looking for the cursor
/// flag and by the status API for listings.
pub async fn get_confirmed_txs_page(
    conn: &mut SqliteConnection,
    account: &AccountMeta,
    tx_type: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<TxConfirmedDao>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TxConfirmedDao>(
        r"SELECT * FROM tx_confirmed
WHERE
master_id = $1 AND
derivation_index = $2 AND
network_kind = $3 AND
chain_id = $4 AND
address = $5 AND
tx_type = $6
ORDER BY primary_index DESC, secondary_index DESC
LIMIT $7 OFFSET $8
",
    )
    .bind(&account.master_id)
    .bind(account.derivation_index)
    .bind(&account.network_kind)
    .bind(account.chain_id)
    .bind(&account.address)
    .bind(tx_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn get_all_confirmed_txs(
    conn: &mut SqliteConnection,
    limit: Option<i64>,
) -> Result<Vec<TxConfirmedDao>, sqlx::Error> {
    let limit = limit.unwrap_or(i64::MAX);
    let rows = sqlx::query_as::<_, TxConfirmedDao>(
        r"SELECT * FROM tx_confirmed ORDER BY primary_index DESC, secondary_index DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn get_confirmed_tx(
    conn: &mut SqliteConnection,
    tx_id: i64,
) -> Result<TxConfirmedDao, sqlx::Error> {
    let row = sqlx::query_as::<_, TxConfirmedDao>(r"SELECT * FROM tx_confirmed WHERE id = $1")
        .bind(tx_id)
        .fetch_one(conn)
        .await?;
    Ok(row)
}

pub async fn set_fetched_cursor(
    conn: &mut SqliteConnection,
    tx_id: i64,
    fetched_cursor: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(r"UPDATE tx_confirmed SET fetched_cursor = $2 WHERE id = $1")
        .bind(tx_id)
        .bind(fetched_cursor)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn get_confirmed_tx_count(conn: &mut SqliteConnection) -> Result<usize, sqlx::Error> {
    let count = sqlx::query_scalar::<_, i64>(r"SELECT COUNT(*) FROM tx_confirmed")
        .fetch_one(conn)
        .await?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_sqlite_connection;

    fn test_account() -> AccountMeta {
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

    fn test_confirmed(account: &AccountMeta, key: &OrderKey) -> TxConfirmedDao {
        TxConfirmedDao {
            id: 0,
            master_id: account.master_id.clone(),
            derivation_index: account.derivation_index,
            network_kind: account.network_kind.clone(),
            chain_id: account.chain_id,
            address: account.address.clone(),
            tx_type: "outgoing".to_string(),
            primary_index: key.primary,
            secondary_index: key.secondary.clone(),
            nonce: 1,
            tx_hash: "0xaa".to_string(),
            kind: "eoa".to_string(),
            info: "{}".to_string(),
            from_addr: account.address.clone(),
            to_addr: Some("0x000000000000000000000000000000000000dead".to_string()),
            val: "0".to_string(),
            call_data: None,
            function_sig: None,
            chain_status: 1,
            gas_used: None,
            fee_paid: None,
            blockchain_date: chrono::Utc::now(),
            checked_date: chrono::Utc::now(),
            fetched_cursor: false,
        }
    }

    #[tokio::test]
    async fn test_order_key_lookup_and_paging() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let account = test_account();

        for (block, idx) in [(100i64, 0i64), (100, 3), (101, 1)] {
            insert_confirmed_tx(&mut conn, &test_confirmed(&account, &OrderKey::for_block_pos(block, idx)))
                .await
                .unwrap();
        }

        let found = get_confirmed_tx_by_order_key(
            &mut conn,
            &account,
            "outgoing",
            &OrderKey::for_block_pos(100, 3),
        )
        .await
        .unwrap();
        assert!(found.is_some());

        let page = get_confirmed_txs_page(&mut conn, &account, "outgoing", 100, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].primary_index, 101);
        assert_eq!(page[2].secondary_index, format!("{:0>8}", 0));
    }

    #[tokio::test]
    async fn test_cursor_flag_move() {
        let mut conn = create_sqlite_connection(None, true).await.unwrap();
        let account = test_account();
        let old = insert_confirmed_tx(
            &mut conn,
            &test_confirmed(&account, &OrderKey::for_block_pos(100, 0)),
        )
        .await
        .unwrap();
        let new = insert_confirmed_tx(
            &mut conn,
            &test_confirmed(&account, &OrderKey::for_block_pos(101, 0)),
        )
        .await
        .unwrap();

        set_fetched_cursor(&mut conn, old.id, true).await.unwrap();
        set_fetched_cursor(&mut conn, old.id, false).await.unwrap();
        set_fetched_cursor(&mut conn, new.id, true).await.unwrap();

        let page = get_confirmed_txs_page(&mut conn, &account, "outgoing", 100, 0)
            .await
            .unwrap();
        let flagged: Vec<_> = page.iter().filter(|tx| tx.fetched_cursor).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, new.id);
    }
}
