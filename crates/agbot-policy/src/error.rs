//! Policy Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policies are not compatible: {0}")]
    Incompatible(String),

    #[error("API spec {spec_ref} ({org}/{arch}) is not supported: {reason}")]
    UnsupportedApiSpec {
        spec_ref: String,
        org: String,
        arch: String,
        reason: String,
    },

    #[error("policy has no workloads")]
    NoWorkloads,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
