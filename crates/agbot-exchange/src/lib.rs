//! Exchange Client
//!
//! The exchange is the external directory and message relay: it knows which
//! devices and workload definitions exist, records agreement state for
//! observers, and queues protocol messages between the agbot and producers.
//! The negotiation core never talks to a device directly; everything flows
//! through these operations.
//!
//! The trait keeps the core testable: handlers hold an
//! `Arc<dyn ExchangeClient>` and the tests substitute an in-memory double.

pub mod client;
pub mod error;
pub mod types;

pub use client::HttpExchangeClient;
pub use error::{ExchangeError, Result};
pub use types::{
    create_message_target, Device, MessageTarget, Microservice, SearchResultDevice,
    WorkloadApiSpec, WorkloadDefinition, WorkloadDeployment,
};

use async_trait::async_trait;

/// Directory and message-relay operations the negotiation core consumes.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Read a device record, including its registered microservices and
    /// their producer policies.
    async fn get_device(&self, device_id: &str) -> Result<Device>;

    /// Fetch a workload definition; `None` when the directory has no
    /// matching entry.
    async fn get_workload(
        &self,
        workload_url: &str,
        org: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<WorkloadDefinition>>;

    /// Queue a protocol message for a producer.
    async fn send_message(&self, target: &MessageTarget, payload: &str, ttl_s: u64) -> Result<()>;

    /// Remove a consumed inbound message from the agbot's mailbox.
    async fn delete_message(&self, message_id: i64) -> Result<()>;

    /// Tell the directory an agreement is terminated.
    async fn delete_consumer_agreement(&self, agreement_id: &str) -> Result<()>;

    /// Publish an agreement state transition.
    async fn record_consumer_agreement_state(
        &self,
        agreement_id: &str,
        policy_name: &str,
        org: &str,
        state: &str,
    ) -> Result<()>;
}
