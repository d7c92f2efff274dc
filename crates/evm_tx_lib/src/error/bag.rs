use crate::error::{CustomError, TransactionFailedError};
use crate::utils::ConversionError;
use thiserror::Error;
use web3::ethabi::ethereum_types::FromDecStrErr;

#[derive(Error, Debug)]
pub enum ErrorBag {
    #[error("{0}")]
    CustomError(#[from] CustomError),
    #[error("{0}")]
    TransactionFailedError(#[from] TransactionFailedError),
    #[error("Hex conversion error: {0}")]
    HexError(#[from] rustc_hex::FromHexError),
    #[error("Dec conversion error: {0}")]
    DecError(#[from] FromDecStrErr),
    #[error("sqlx error: {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("conversion error: {0}")]
    ConversionError(#[from] ConversionError),
    #[error("web3 error: {0}")]
    Web3Error(#[from] web3::Error),
    #[error("abi error: {0}")]
    Web3AbiError(#[from] web3::ethabi::Error),
    #[error("contract error: {0}")]
    Web3ContractError(#[from] web3::contract::Error),
    #[error("http error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("migrate error: {0}")]
    MigrateError(#[from] sqlx::migrate::MigrateError),
}
