//! Store Error Types
//!
//! All store operations return `Result<T>` aliased to
//! `Result<T, StoreError>` so errors propagate cleanly with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unarchived agreement already exists: {0}")]
    AgreementExists(String),

    #[error("agreement not found: {0}")]
    AgreementNotFound(String),

    #[error("agreement already has a reply recorded: {0}")]
    AlreadyReplied(String),

    #[error("workload usage already exists for {device_id}/{policy_name}")]
    WorkloadUsageExists {
        device_id: String,
        policy_name: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(e.to_string())
    }
}
