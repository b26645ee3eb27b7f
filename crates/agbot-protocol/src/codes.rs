//! Termination Reasons
//!
//! Agreements terminate for a closed set of reasons. On the wire and in the
//! store the reason is an opaque numeric code; the driver owns the mapping
//! in both directions so other components never interpret raw numbers.

/// Semantic reasons an agreement can be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The agreement never finalized on the ledger in time.
    NotFinalizedTimeout,
    /// No reply to the proposal arrived in time.
    NoReply,
    /// The producer rejected the proposal.
    NegativeReply,
    /// The workload never produced data in time.
    NoDataReceived,
    /// The consumer policy changed out from under the agreement.
    PolicyChanged,
    /// A workload upgrade was forced for the device.
    ForcedUpgrade,
    /// The agreement could not be recorded on the ledger.
    LedgerWriteFailed,
    /// The device stopped heartbeating.
    NodeHeartbeat,
}

impl TerminationReason {
    pub fn code(self) -> u32 {
        match self {
            TerminationReason::NotFinalizedTimeout => 101,
            TerminationReason::NoReply => 102,
            TerminationReason::NegativeReply => 103,
            TerminationReason::NoDataReceived => 104,
            TerminationReason::PolicyChanged => 105,
            TerminationReason::ForcedUpgrade => 106,
            TerminationReason::LedgerWriteFailed => 107,
            TerminationReason::NodeHeartbeat => 108,
        }
    }

    pub fn from_code(code: u32) -> Option<TerminationReason> {
        match code {
            101 => Some(TerminationReason::NotFinalizedTimeout),
            102 => Some(TerminationReason::NoReply),
            103 => Some(TerminationReason::NegativeReply),
            104 => Some(TerminationReason::NoDataReceived),
            105 => Some(TerminationReason::PolicyChanged),
            106 => Some(TerminationReason::ForcedUpgrade),
            107 => Some(TerminationReason::LedgerWriteFailed),
            108 => Some(TerminationReason::NodeHeartbeat),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            TerminationReason::NotFinalizedTimeout => "agreement never finalized on the ledger",
            TerminationReason::NoReply => "proposal reply was never received",
            TerminationReason::NegativeReply => "producer rejected the proposal",
            TerminationReason::NoDataReceived => "workload data was never detected",
            TerminationReason::PolicyChanged => "consumer policy changed",
            TerminationReason::ForcedUpgrade => "workload upgrade was forced",
            TerminationReason::LedgerWriteFailed => "agreement could not be recorded on the ledger",
            TerminationReason::NodeHeartbeat => "device heartbeat stopped",
        }
    }
}
