//! Exchange Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("exchange returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid message target: {0}")]
    InvalidTarget(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
