//! Store Record Types
//!
//! The two persistent records of the negotiation core: the agreement itself
//! and the per-(device, policy) workload usage that carries retry and
//! priority-rollback state between negotiations.

use serde::{Deserialize, Serialize};

/// Lifecycle of an agreement, derived from its timestamps.
///
/// The progression is monotone: Pending → Proposed → Replied → DataReceived,
/// with TimedOut reachable from any non-archived state and Archived
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgreementState {
    Pending,
    Proposed,
    Replied,
    DataReceived,
    TimedOut,
    Archived,
}

impl std::fmt::Display for AgreementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgreementState::Pending => "Pending",
            AgreementState::Proposed => "Proposed",
            AgreementState::Replied => "Replied",
            AgreementState::DataReceived => "DataReceived",
            AgreementState::TimedOut => "TimedOut",
            AgreementState::Archived => "Archived",
        };
        write!(f, "{s}")
    }
}

/// One bilateral agreement between the agbot and a producer device.
///
/// Timestamps are Unix seconds; zero means the event has not happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    /// Opaque 64-hex-char id, generated at initiation, never reused.
    pub current_agreement_id: String,

    pub device_id: String,
    pub org: String,
    pub policy_name: String,

    /// Merged consumer policy text frozen at initiation.
    pub policy: String,

    /// Serialized proposal text frozen at initiation.
    pub proposal: String,

    pub protocol: String,

    /// Set exactly once, from the first valid reply.
    pub protocol_version: u32,

    pub pattern_id: String,

    /// Durable-commit substrate identity; empty type means no external
    /// commit is performed for this agreement.
    pub ledger_type: String,
    pub ledger_name: String,
    pub ledger_org: String,

    /// Producer's address on the substrate; empty until a reply is
    /// processed.
    pub counterparty_address: String,

    /// Serialized node-health terms captured at initiation.
    pub node_health: String,

    pub agreement_creation_time: i64,
    pub agreement_initiated_time: i64,
    pub agreement_reply_time: i64,
    pub data_notification_time: i64,
    pub agreement_timedout_time: i64,

    pub archived: bool,
    pub terminated_reason: u32,
    pub terminated_description: String,
}

impl Agreement {
    pub fn state(&self) -> AgreementState {
        if self.archived {
            AgreementState::Archived
        } else if self.agreement_timedout_time != 0 {
            AgreementState::TimedOut
        } else if self.data_notification_time != 0 {
            AgreementState::DataReceived
        } else if self.agreement_reply_time != 0 {
            AgreementState::Replied
        } else if self.agreement_initiated_time != 0 {
            AgreementState::Proposed
        } else {
            AgreementState::Pending
        }
    }

    /// True iff a reply has already been recorded for this agreement.
    pub fn already_received_reply(&self) -> bool {
        self.agreement_reply_time != 0
    }
}

/// Retry and priority state for the workload currently in play on a device
/// under a given consumer policy. At most one record exists per
/// (device, policy) pair; deleting it restarts the next negotiation from
/// the highest-priority workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadUsage {
    pub device_id: String,
    pub policy_name: String,

    /// Peer device ids for high-availability grouping.
    pub ha_partners: Vec<String>,

    /// Merged policy text associated with the current workload choice;
    /// filled in at reply time when created empty.
    pub policy: String,

    pub priority: u32,
    pub retry_count: u32,
    pub retry_duration_s: u32,
    pub verified_duration_s: u32,

    /// True once the workload has run long enough to be considered
    /// verified; rollback retries stop.
    pub disable_retry: bool,

    /// True when this priority was selected because the device could not
    /// support a higher-priority workload. Cancellation deletes the record
    /// so the next attempt starts from the top again.
    pub reqs_not_met: bool,

    pub first_try_time: i64,
    pub latest_retry_time: i64,

    /// The in-flight agreement using this workload, if any.
    pub current_agreement_id: String,
}

/// Predicates narrowing agreement queries.
#[derive(Debug, Clone)]
pub enum AgreementFilter {
    Unarchived,
    Archived,
    DeviceAndPolicy {
        device_id: String,
        policy_name: String,
    },
}

impl AgreementFilter {
    pub fn matches(&self, ag: &Agreement) -> bool {
        match self {
            AgreementFilter::Unarchived => !ag.archived,
            AgreementFilter::Archived => ag.archived,
            AgreementFilter::DeviceAndPolicy {
                device_id,
                policy_name,
            } => ag.device_id == *device_id && ag.policy_name == *policy_name,
        }
    }
}
