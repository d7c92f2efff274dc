use crate::db::create_sqlite_connection;

use crate::error::EngineError;

use crate::process::LogNotifier;
use crate::router::{NoNameResolver, TxRouter};
use crate::service::service_loop;
use crate::setup::EngineSetup;
use crate::signer::KeyringSigner;

use crate::config;
use crate::err_custom_create;
use secp256k1::SecretKey;
use sqlx::SqliteConnection;
use std::env;

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct SharedState {
    pub confirmed: usize,
    pub synced: usize,
    pub idling: bool,
}

pub struct ValidatedOptions {
    pub keep_running: bool,
    pub service_sleep: u64,
    pub process_sleep: u64,
    pub wait_timeout: u64,
}

impl Default for ValidatedOptions {
    fn default() -> Self {
        ValidatedOptions {
            keep_running: true,
            service_sleep: 10,
            process_sleep: 10,
            wait_timeout: 300,
        }
    }
}

pub struct EngineRuntime {
    pub runtime_handle: JoinHandle<()>,
    pub router: Arc<TxRouter>,
    pub shared_state: Arc<Mutex<SharedState>>,
    pub conn: Arc<Mutex<SqliteConnection>>,
}

pub async fn start_tx_engine(
    cli: Option<ValidatedOptions>,
    secret_keys: &[SecretKey],
    config: config::Config,
) -> Result<EngineRuntime, EngineError> {
    let cli = cli.unwrap_or_default();
    let setup = EngineSetup::new(
        &config,
        cli.service_sleep,
        cli.process_sleep,
        cli.wait_timeout,
    )?;
    log::debug!("Starting tx engine: {:#?}", setup);

    let db_conn = env::var("DB_SQLITE_FILENAME")
        .map_err(|_| err_custom_create!("DB_SQLITE_FILENAME env variable not set"))?;
    log::info!("connecting to sqlite file db: {}", db_conn);
    let mut conn = create_sqlite_connection(Some(&db_conn), true).await?;
    let conn2 = create_sqlite_connection(Some(&db_conn), false).await?;

    let router = Arc::new(TxRouter::new(
        setup,
        Arc::new(KeyringSigner::new(secret_keys.to_vec())),
        Arc::new(NoNameResolver),
    ));

    let shared_state = Arc::new(Mutex::new(SharedState {
        confirmed: 0,
        synced: 0,
        idling: false,
    }));
    let shared_state_clone = shared_state.clone();
    let router_clone = router.clone();
    let jh = tokio::spawn(async move {
        service_loop(shared_state_clone, &mut conn, &router_clone, &LogNotifier).await
    });

    Ok(EngineRuntime {
        runtime_handle: jh,
        router,
        shared_state,
        conn: Arc::new(Mutex::new(conn2)),
    })
}
