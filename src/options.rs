use evm_tx_lib::err_custom_create;
use evm_tx_lib::error::EngineError;
use std::str::FromStr;
use structopt::StructOpt;
use web3::types::{Address, U256};

#[derive(Debug, StructOpt)]
struct RunOptions {
    #[structopt(long = "http", help = "Enable the status API server")]
    http: bool,

    #[structopt(
        long = "http-addr",
        default_value = "127.0.0.1:8080",
        help = "Bind address for the status API"
    )]
    http_addr: String,

    #[structopt(long = "service-sleep", default_value = "10")]
    service_sleep: u64,

    #[structopt(long = "process-sleep", default_value = "10")]
    process_sleep: u64,

    #[structopt(
        long = "wait-timeout",
        default_value = "300",
        help = "Seconds one wait cycle may block before re-checkpointing"
    )]
    wait_timeout: u64,
}

#[derive(Debug, StructOpt)]
struct TransferOptions {
    #[structopt(long = "receiver", help = "Receiver address")]
    receiver: String,

    #[structopt(long = "amount", help = "Amount in wei")]
    amount: String,

    #[structopt(long = "chain-id", default_value = "5")]
    chain_id: i64,
}

#[derive(Debug, StructOpt)]
struct FeesOptions {
    #[structopt(long = "chain-id", default_value = "5")]
    chain_id: i64,
}

#[derive(Debug, StructOpt)]
struct SyncOptions {
    #[structopt(long = "address", help = "Account address to synchronize")]
    address: String,

    #[structopt(long = "chain-id", default_value = "5")]
    chain_id: i64,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "evm_tx_processor", about = "EVM transaction lifecycle engine")]
enum CliOptions {
    /// Run the engine loop (and optionally the status API).
    #[structopt(name = "run")]
    Run(RunOptions),
    /// Send a plain transfer and wait for its confirmation.
    #[structopt(name = "transfer")]
    Transfer(TransferOptions),
    /// Print gas fee suggestions for a chain.
    #[structopt(name = "fees")]
    Fees(FeesOptions),
    /// One history synchronization pass for an account.
    #[structopt(name = "sync")]
    Sync(SyncOptions),
}

#[derive(Debug)]
pub enum ValidatedCommand {
    Run {
        http: bool,
        http_addr: String,
        service_sleep: u64,
        process_sleep: u64,
        wait_timeout: u64,
    },
    Transfer {
        receiver: Address,
        amount: U256,
        chain_id: i64,
    },
    Fees {
        chain_id: i64,
    },
    Sync {
        address: String,
        chain_id: i64,
    },
}

pub fn validated_cli() -> Result<ValidatedCommand, EngineError> {
    let opt: CliOptions = CliOptions::from_args();
    match opt {
        CliOptions::Run(run) => Ok(ValidatedCommand::Run {
            http: run.http,
            http_addr: run.http_addr,
            service_sleep: run.service_sleep,
            process_sleep: run.process_sleep,
            wait_timeout: run.wait_timeout,
        }),
        CliOptions::Transfer(transfer) => {
            let receiver = Address::from_str(&transfer.receiver).map_err(|_| {
                err_custom_create!("Invalid receiver when parsing input: {}", transfer.receiver)
            })?;
            let amount = U256::from_dec_str(&transfer.amount).map_err(|_| {
                err_custom_create!("Invalid amount when parsing input: {}", transfer.amount)
            })?;
            Ok(ValidatedCommand::Transfer {
                receiver,
                amount,
                chain_id: transfer.chain_id,
            })
        }
        CliOptions::Fees(fees) => Ok(ValidatedCommand::Fees {
            chain_id: fees.chain_id,
        }),
        CliOptions::Sync(sync) => Ok(ValidatedCommand::Sync {
            address: sync.address.to_lowercase(),
            chain_id: sync.chain_id,
        }),
    }
}
