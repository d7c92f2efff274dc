mod options;

use secp256k1::SecretKey;
use std::str::FromStr;
use std::sync::Arc;
use std::{env, time::Duration};

use evm_tx_lib::account::AccountMeta;
use evm_tx_lib::config;
use evm_tx_lib::db::create_sqlite_connection;
use evm_tx_lib::err_custom_create;
use evm_tx_lib::error::EngineError;
use evm_tx_lib::eth::get_eth_addr_from_secret;
use evm_tx_lib::fees::estimate_gas_fee;
use evm_tx_lib::process::{LogNotifier, WaitOutcome};
use evm_tx_lib::router::{NoNameResolver, TxRouter};
use evm_tx_lib::runtime::{start_tx_engine, ValidatedOptions};
use evm_tx_lib::server::{run_server, ServerData};
use evm_tx_lib::setup::EngineSetup;
use evm_tx_lib::signer::KeyringSigner;
use evm_tx_lib::transaction::create_transfer_request;

use crate::options::{validated_cli, ValidatedCommand};

fn load_secret_keys() -> Result<Vec<SecretKey>, EngineError> {
    let raw = env::var("ETH_PRIVATE_KEYS")
        .or_else(|_| env::var("ETH_PRIVATE_KEY"))
        .map_err(|_| err_custom_create!("ETH_PRIVATE_KEYS env variable not set"))?;
    let mut keys = Vec::new();
    for part in raw.split(&[',', ';']) {
        let key = SecretKey::from_str(part.trim())
            .map_err(|_| err_custom_create!("Cannot parse private key"))?;
        keys.push(key);
    }
    Ok(keys)
}

fn build_router(config: &config::Config, keys: Vec<SecretKey>) -> Result<TxRouter, EngineError> {
    let setup = EngineSetup::new(config, 10, 10, 300)?;
    Ok(TxRouter::new(
        setup,
        Arc::new(KeyringSigner::new(keys)),
        Arc::new(NoNameResolver),
    ))
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    if let Err(err) = dotenv::dotenv() {
        return Err(err_custom_create!("No .env file found: {}", err));
    }
    env_logger::init();
    let command = validated_cli()?;
    let config = config::Config::load("config-engine.toml")?;

    match command {
        ValidatedCommand::Run {
            http,
            http_addr,
            service_sleep,
            process_sleep,
            wait_timeout,
        } => {
            let secret_keys = load_secret_keys()?;
            let cli = ValidatedOptions {
                keep_running: true,
                service_sleep,
                process_sleep,
                wait_timeout,
            };
            let runtime = start_tx_engine(Some(cli), &secret_keys, config).await?;
            if http {
                let server_data = Box::new(ServerData {
                    shared_state: runtime.shared_state.clone(),
                    db_connection: runtime.conn.clone(),
                    router: runtime.router.clone(),
                });
                let server = tokio::spawn(async move {
                    if let Err(err) = run_server(server_data, &http_addr).await {
                        log::error!("Status server failed: {}", err);
                    }
                });
                let _ = server;
            }
            runtime
                .runtime_handle
                .await
                .map_err(|e| err_custom_create!("Service loop failed: {:?}", e))?;
        }
        ValidatedCommand::Transfer {
            receiver,
            amount,
            chain_id,
        } => {
            let secret_keys = load_secret_keys()?;
            let from = get_eth_addr_from_secret(&secret_keys[0]);
            let router = build_router(&config, secret_keys)?;
            let account = router
                .setup
                .account_by_address(chain_id, &format!("{:#x}", from))
                .cloned()
                .unwrap_or(AccountMeta {
                    master_id: "cli".to_string(),
                    derivation_index: 0,
                    network_kind: "evm".to_string(),
                    chain_id,
                    address: format!("{:#x}", from),
                    smart_account: None,
                    multisig: None,
                });

            let db_file = env::var("DB_SQLITE_FILENAME")
                .map_err(|_| err_custom_create!("DB_SQLITE_FILENAME env variable not set"))?;
            let mut conn = create_sqlite_connection(Some(&db_file), true).await?;

            let fields = create_transfer_request(from, receiver, amount, chain_id);
            let mut pending = router
                .sign_and_send_tx(&mut conn, &account, fields, None)
                .await?;
            log::info!(
                "Transfer submitted at nonce {}, waiting for confirmation",
                pending.nonce
            );
            loop {
                match router
                    .wait_for_tx(&mut conn, &mut pending, &LogNotifier)
                    .await?
                {
                    WaitOutcome::Confirmed(tx) => {
                        println!("Confirmed in block {} ({})", tx.primary_index, tx.tx_hash);
                        break;
                    }
                    WaitOutcome::Pending(reason) => {
                        log::info!("Still pending: {}, retrying", reason);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    WaitOutcome::Abandoned(reason) => {
                        return Err(err_custom_create!("Transfer abandoned: {}", reason));
                    }
                }
            }
        }
        ValidatedCommand::Fees { chain_id } => {
            let router = build_router(&config, vec![])?;
            let web3 = router.setup.get_provider(chain_id).await?;
            let estimate = estimate_gas_fee(&web3).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&estimate)
                    .map_err(|e| err_custom_create!("Cannot serialize estimate: {}", e))?
            );
        }
        ValidatedCommand::Sync { address, chain_id } => {
            let router = build_router(&config, vec![])?;
            let account = router
                .setup
                .account_by_address(chain_id, &address)
                .cloned()
                .ok_or_else(|| {
                    err_custom_create!("Account {} not found in configuration", address)
                })?;
            let db_file = env::var("DB_SQLITE_FILENAME")
                .map_err(|_| err_custom_create!("DB_SQLITE_FILENAME env variable not set"))?;
            let mut conn = create_sqlite_connection(Some(&db_file), true).await?;
            let written = router
                .fetch_transactions(&mut conn, &account, &LogNotifier)
                .await?;
            println!("Synchronized {} records", written);
        }
    }
    Ok(())
}
