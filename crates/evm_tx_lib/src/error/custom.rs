use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{msg}")]
pub struct CustomError {
    pub msg: String,
}

impl CustomError {
    pub fn new(msg: &str) -> Self {
        Self {
            msg: msg.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Transaction failed: {msg}")]
pub struct TransactionFailedError {
    pub msg: String,
}

impl TransactionFailedError {
    pub fn new(msg: &str) -> Self {
        Self {
            msg: msg.to_string(),
        }
    }
}
