//! Agreement Negotiation Workers
//!
//! The concurrent heart of the agbot: a pool of workers consuming
//! negotiation events, a per-agreement lock manager serializing everything
//! that touches one agreement id, and the handlers that drive workload
//! selection, the proposal/reply/ack state machine, and cancellation.

pub mod events;
pub mod locks;
pub mod pool;
pub mod worker;

pub use events::{
    AgreementWork, AsyncCancelAgreement, CancelAgreement, HandleDataReceivedAck, HandleReply,
    HandleWorkloadUpgrade, InitiateAgreement,
};
pub use locks::AgreementLockManager;
pub use pool::WorkerPool;
pub use worker::{generate_agreement_id, AgreementWorker, NegotiationConfig};
