//! Protocol Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid protocol message: {0}")]
    InvalidMessage(String),

    #[error("message is for protocol {got}, expected {expected}")]
    WrongProtocol { expected: String, got: String },

    #[error("store error: {0}")]
    Store(#[from] agbot_store::StoreError),

    #[error("exchange error: {0}")]
    Exchange(#[from] agbot_exchange::ExchangeError),

    #[error("policy error: {0}")]
    Policy(#[from] agbot_policy::PolicyError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the durable-commit substrate.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger {0} is not writable")]
    NotWritable(String),

    #[error("ledger write failed: {0}")]
    WriteFailed(String),
}
