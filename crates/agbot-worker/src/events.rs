//! Negotiation Work Items
//!
//! The event kinds the worker pool consumes. Producers of these events are
//! outside the core: a policy search loop enqueues `Initiate` items, the
//! inbound message poller enqueues `Reply` and `DataReceivedAck`, the
//! governance side enqueues `Cancel` and `WorkloadUpgrade`, and the
//! deferred-cancel retry task enqueues `AsyncCancel`.

use agbot_exchange::SearchResultDevice;
use agbot_policy::Policy;

/// Start a new negotiation with a device.
#[derive(Debug, Clone)]
pub struct InitiateAgreement {
    /// The producer policy, already demarshalled. Replaced by a merged
    /// per-microservice policy when the consumer policy names a pattern.
    pub producer_policy: Policy,

    /// The producer policy exactly as received, echoed back in the
    /// proposal.
    pub original_producer_policy: String,

    /// The consumer policy matched with this device. A private copy; the
    /// selection loop augments it with the chosen workload's API specs.
    pub consumer_policy: Policy,

    /// Org the consumer policy originated from.
    pub org: String,

    pub device: SearchResultDevice,
}

/// An inbound proposal reply.
#[derive(Debug, Clone)]
pub struct HandleReply {
    pub reply_text: String,
    pub sender_id: String,
    pub sender_pub_key: String,
    pub sender_msg_endpoint: String,
    /// Exchange message id to delete once consumed; zero when the event did
    /// not come through the relay.
    pub message_id: i64,
}

/// An inbound data-received ack.
#[derive(Debug, Clone)]
pub struct HandleDataReceivedAck {
    pub ack_text: String,
    pub sender_id: String,
    pub sender_pub_key: String,
    pub sender_msg_endpoint: String,
    pub message_id: i64,
}

/// Cancel one agreement.
#[derive(Debug, Clone)]
pub struct CancelAgreement {
    pub agreement_id: String,
    pub protocol: String,
    pub reason: u32,
}

/// Force a device off its current workload so the next negotiation starts
/// from the highest priority again.
#[derive(Debug, Clone)]
pub struct HandleWorkloadUpgrade {
    /// May be empty; the (device, policy) pair then selects the agreements.
    pub agreement_id: String,
    pub protocol: String,
    pub device_id: String,
    pub policy_name: String,
}

/// Retry of a cancellation whose ledger-side work was deferred.
#[derive(Debug, Clone)]
pub struct AsyncCancelAgreement {
    pub agreement_id: String,
    pub protocol: String,
    pub reason: u32,
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub enum AgreementWork {
    Initiate(InitiateAgreement),
    Reply(HandleReply),
    DataReceivedAck(HandleDataReceivedAck),
    Cancel(CancelAgreement),
    WorkloadUpgrade(HandleWorkloadUpgrade),
    AsyncCancel(AsyncCancelAgreement),
}

impl AgreementWork {
    pub fn work_type(&self) -> &'static str {
        match self {
            AgreementWork::Initiate(_) => "INITIATE_AGREEMENT",
            AgreementWork::Reply(_) => "AGREEMENT_REPLY",
            AgreementWork::DataReceivedAck(_) => "AGREEMENT_DATARECEIVED_ACK",
            AgreementWork::Cancel(_) => "AGREEMENT_CANCEL",
            AgreementWork::WorkloadUpgrade(_) => "WORKLOAD_UPGRADE",
            AgreementWork::AsyncCancel(_) => "ASYNC_CANCEL",
        }
    }
}

impl std::fmt::Display for AgreementWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgreementWork::Initiate(wi) => {
                write!(f, "{}: org {}, device {}", self.work_type(), wi.org, wi.device.id)
            }
            AgreementWork::Reply(wi) => {
                write!(f, "{}: sender {}, message {}", self.work_type(), wi.sender_id, wi.message_id)
            }
            AgreementWork::DataReceivedAck(wi) => {
                write!(f, "{}: sender {}, message {}", self.work_type(), wi.sender_id, wi.message_id)
            }
            AgreementWork::Cancel(wi) => {
                write!(f, "{}: agreement {}, reason {}", self.work_type(), wi.agreement_id, wi.reason)
            }
            AgreementWork::WorkloadUpgrade(wi) => write!(
                f,
                "{}: device {}, policy {}",
                self.work_type(),
                wi.device_id,
                wi.policy_name
            ),
            AgreementWork::AsyncCancel(wi) => {
                write!(f, "{}: agreement {}, reason {}", self.work_type(), wi.agreement_id, wi.reason)
            }
        }
    }
}
