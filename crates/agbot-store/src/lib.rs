//! Agreement Store
//!
//! Durable storage for the negotiation core: the agreement records and the
//! workload-usage side table that drives priority rollback and retry
//! accounting. Backed by an embedded SQLite database; every operation is
//! atomic with respect to a single record, which is all the concurrency
//! model needs because each agreement id is mutated under its own lock.
//!
//! ## What Lives Here
//!
//! - **Agreements**: one row per agreement id, ever. Termination archives
//!   the row rather than deleting it, so ids can never be reused for a live
//!   record and history remains queryable.
//! - **WorkloadUsages**: one row per (device, policy) pair recording which
//!   workload priority is in play, how many retries have happened, and
//!   whether the choice was forced by unmet device requirements.
//!
//! ## Usage
//!
//! ```ignore
//! use agbot_store::{AgreementStore, SqliteAgreementStore};
//!
//! let store = SqliteAgreementStore::new("agbot.db").await?;
//! store.agreement_attempt("...64 hex chars...", "myorg", "device1",
//!     "netspeed policy", "", "", "", "Basic", "", "").await?;
//! ```
//!
//! In-memory databases (`SqliteAgreementStore::new_in_memory()`) are used
//! throughout the tests.

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::SqliteAgreementStore;
pub use types::{Agreement, AgreementFilter, AgreementState, WorkloadUsage};

use async_trait::async_trait;

/// Storage abstraction for agreements and workload usages.
///
/// Implementations must be `Send + Sync` so they can be shared as
/// `Arc<dyn AgreementStore>` across worker tasks. All operations are
/// single-record atomic; no multi-key transactions are required.
#[async_trait]
pub trait AgreementStore: Send + Sync {
    // ============================================================
    // AGREEMENT OPERATIONS
    // ============================================================

    /// Insert a new Pending agreement record.
    ///
    /// Fails with [`StoreError::AgreementExists`] when an unarchived record
    /// with the same id exists.
    #[allow(clippy::too_many_arguments)]
    async fn agreement_attempt(
        &self,
        agreement_id: &str,
        org: &str,
        device_id: &str,
        policy_name: &str,
        ledger_type: &str,
        ledger_name: &str,
        ledger_org: &str,
        protocol: &str,
        pattern_id: &str,
        node_health: &str,
    ) -> Result<()>;

    /// Freeze the serialized proposal and merged policy into the record and
    /// stamp the initiation time (Pending → Proposed).
    async fn persist_agreement_proposal(
        &self,
        agreement_id: &str,
        protocol: &str,
        proposal: &str,
        policy: &str,
    ) -> Result<Agreement>;

    /// Look up one agreement by id, narrowed by `filters`.
    async fn find_single_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> Result<Option<Agreement>>;

    /// All agreements for `protocol` matching every filter.
    async fn find_agreements(
        &self,
        filters: &[AgreementFilter],
        protocol: &str,
    ) -> Result<Vec<Agreement>>;

    /// Record the producer's reply: counterparty address and protocol
    /// version, set exactly once (Proposed → Replied).
    ///
    /// A second reply fails with [`StoreError::AlreadyReplied`].
    async fn persist_reply(
        &self,
        agreement_id: &str,
        protocol: &str,
        counterparty_address: &str,
        protocol_version: u32,
    ) -> Result<Agreement>;

    /// Record data receipt (Replied → DataReceived).
    async fn data_notification(&self, agreement_id: &str, protocol: &str) -> Result<Agreement>;

    /// Mark the agreement timed out, stamping the termination time.
    async fn agreement_timedout(&self, agreement_id: &str, protocol: &str) -> Result<Agreement>;

    /// Archive the record and store the termination reason. Archived
    /// records are hidden from default queries and never mutated again.
    async fn archive_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
        reason_code: u32,
        reason_text: &str,
    ) -> Result<Agreement>;

    /// Remove an unarchived record. Only used to roll back a failed
    /// initiation.
    async fn delete_agreement(&self, agreement_id: &str, protocol: &str) -> Result<()>;

    /// Delete archived agreements whose termination time is older than
    /// `cutoff` (Unix seconds). Returns the number of rows removed.
    async fn purge_archived(&self, cutoff: i64) -> Result<u64>;

    // ============================================================
    // WORKLOAD USAGE OPERATIONS
    // ============================================================

    /// Look up the usage record for a (device, policy) pair.
    async fn find_single_workload_usage(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>>;

    /// Create the usage record for a (device, policy) pair. The first try
    /// time is stamped now; retry count starts at zero.
    #[allow(clippy::too_many_arguments)]
    async fn new_workload_usage(
        &self,
        device_id: &str,
        ha_partners: &[String],
        policy: &str,
        policy_name: &str,
        priority: u32,
        retry_duration_s: u32,
        verified_duration_s: u32,
        reqs_not_met: bool,
        agreement_id: &str,
    ) -> Result<()>;

    /// Move the record to a new priority, resetting retry accounting.
    #[allow(clippy::too_many_arguments)]
    async fn update_priority(
        &self,
        device_id: &str,
        policy_name: &str,
        priority: u32,
        retry_duration_s: u32,
        verified_duration_s: u32,
        agreement_id: &str,
    ) -> Result<Option<WorkloadUsage>>;

    /// Set the retry count and stamp the latest retry time.
    async fn update_retry_count(
        &self,
        device_id: &str,
        policy_name: &str,
        retry_count: u32,
        agreement_id: &str,
    ) -> Result<Option<WorkloadUsage>>;

    /// Fill in the merged policy text.
    async fn update_policy(
        &self,
        device_id: &str,
        policy_name: &str,
        policy: &str,
    ) -> Result<Option<WorkloadUsage>>;

    /// Point the record at a different in-flight agreement (empty detaches).
    async fn update_wu_agreement_id(
        &self,
        device_id: &str,
        policy_name: &str,
        agreement_id: &str,
    ) -> Result<Option<WorkloadUsage>>;

    /// Stop rollback retries for a verified workload.
    async fn disable_workload_retry(
        &self,
        device_id: &str,
        policy_name: &str,
    ) -> Result<Option<WorkloadUsage>>;

    /// Remove the usage record; the next negotiation starts from the
    /// highest-priority workload.
    async fn delete_workload_usage(&self, device_id: &str, policy_name: &str) -> Result<()>;
}
