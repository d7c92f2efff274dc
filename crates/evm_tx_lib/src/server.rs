use crate::db::ops::*;
use crate::eth::get_balances;
use crate::fees::estimate_gas_fee;
use crate::process::is_cancellation;
use crate::router::TxRouter;
use crate::runtime::SharedState;
use actix_cors::Cors;
use actix_web::web::Data;
use actix_web::{web, App, HttpRequest, HttpServer, Responder};
use serde_json::json;
use sqlx::SqliteConnection;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use web3::types::Address;

pub struct ServerData {
    pub shared_state: Arc<Mutex<SharedState>>,
    pub db_connection: Arc<Mutex<SqliteConnection>>,
    pub router: Arc<TxRouter>,
}

macro_rules! return_on_error {
    ( $e:expr ) => {
        match $e {
            Ok(x) => x,
            Err(err) => {
                return web::Json(json!({
                    "error": err.to_string()
                }))
            },
        }
    }
}

pub async fn pending_txs(data: Data<Box<ServerData>>, _req: HttpRequest) -> impl Responder {
    let txs = {
        let mut db_conn = data.db_connection.lock().await;
        return_on_error!(get_all_pending_txs(&mut db_conn).await)
    };
    web::Json(json!({
        "pending": txs,
    }))
}

pub async fn confirmed_txs(data: Data<Box<ServerData>>, _req: HttpRequest) -> impl Responder {
    let txs = {
        let mut db_conn = data.db_connection.lock().await;
        return_on_error!(get_all_confirmed_txs(&mut db_conn, Some(100)).await)
    };
    let txs = txs
        .iter()
        .map(|tx| {
            json!({
                "tx": tx,
                "cancelled": is_cancellation(tx),
            })
        })
        .collect::<Vec<_>>();
    web::Json(json!({
        "confirmed": txs,
    }))
}

pub async fn tx_details(data: Data<Box<ServerData>>, req: HttpRequest) -> impl Responder {
    let tx_id = req
        .match_info()
        .get("tx_id")
        .map(|tx_id| i64::from_str(tx_id).ok())
        .unwrap_or(None);

    let tx_id = match tx_id {
        Some(tx_id) => tx_id,
        None => return web::Json(json!({"error": "failed to parse tx_id"})),
    };

    let tx = {
        let mut db_conn = data.db_connection.lock().await;
        return_on_error!(get_confirmed_tx(&mut db_conn, tx_id).await)
    };

    web::Json(json!({
        "tx": tx,
        "cancelled": is_cancellation(&tx),
    }))
}

pub async fn fee_estimate(data: Data<Box<ServerData>>, req: HttpRequest) -> impl Responder {
    let chain_id = req
        .match_info()
        .get("chain_id")
        .map(|chain_id| i64::from_str(chain_id).ok())
        .unwrap_or(None);

    let chain_id = match chain_id {
        Some(chain_id) => chain_id,
        None => return web::Json(json!({"error": "failed to parse chain_id"})),
    };

    let web3 = return_on_error!(data.router.setup.get_provider(chain_id).await);
    let estimate = return_on_error!(estimate_gas_fee(&web3).await);
    web::Json(json!({
        "chainId": chain_id,
        "estimate": estimate,
    }))
}

pub async fn balances(data: Data<Box<ServerData>>, req: HttpRequest) -> impl Responder {
    let chain_id = req
        .match_info()
        .get("chain_id")
        .map(|chain_id| i64::from_str(chain_id).ok())
        .unwrap_or(None);

    let chain_id = match chain_id {
        Some(chain_id) => chain_id,
        None => return web::Json(json!({"error": "failed to parse chain_id"})),
    };

    let addresses_param = req
        .query_string()
        .strip_prefix("addresses=")
        .unwrap_or("");
    let mut addresses = Vec::new();
    for part in addresses_param.split(',').filter(|s| !s.is_empty()) {
        match Address::from_str(part) {
            Ok(address) => addresses.push(address),
            Err(_) => return web::Json(json!({"error": format!("bad address: {}", part)})),
        }
    }

    let web3 = return_on_error!(data.router.setup.get_provider(chain_id).await);
    let balances = return_on_error!(get_balances(&web3, &addresses).await);
    let entries = addresses
        .iter()
        .zip(balances.iter())
        .map(|(address, balance)| {
            json!({
                "address": format!("{:#x}", address),
                "balance": balance.to_string(),
            })
        })
        .collect::<Vec<_>>();
    web::Json(json!({
        "balances": entries,
    }))
}

pub async fn stats(data: Data<Box<ServerData>>, _req: HttpRequest) -> impl Responder {
    let (pending_count, confirmed_count) = {
        let mut db_conn = data.db_connection.lock().await;
        (
            return_on_error!(get_pending_tx_count(&mut db_conn).await),
            return_on_error!(get_confirmed_tx_count(&mut db_conn).await),
        )
    };
    let state = data.shared_state.lock().await;
    web::Json(json!({
        "pendingCount": pending_count,
        "confirmedCount": confirmed_count,
        "confirmedThisRun": state.confirmed,
        "syncedThisRun": state.synced,
        "idling": state.idling,
    }))
}

pub async fn run_server(server_data: Box<ServerData>, bind_addr: &str) -> std::io::Result<()> {
    let data = Data::new(server_data);
    let server = HttpServer::new(move || {
        let cors = Cors::permissive();
        App::new()
            .wrap(cors)
            .app_data(data.clone())
            .route("/txs/pending", web::get().to(pending_txs))
            .route("/txs/confirmed", web::get().to(confirmed_txs))
            .route("/tx/{tx_id}", web::get().to(tx_details))
            .route("/fees/{chain_id}", web::get().to(fee_estimate))
            .route("/balances/{chain_id}", web::get().to(balances))
            .route("/stats", web::get().to(stats))
    })
    .bind(bind_addr)?
    .run();
    server.await
}
