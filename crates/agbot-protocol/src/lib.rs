//! Agreement Protocol
//!
//! Everything specific to a protocol variant: the wire messages, the driver
//! that produces and consumes them, the termination-reason code space, and
//! the durable-commit (ledger) interface. Agreement state itself lives in
//! the store; the driver only knows how to move it.

pub mod codes;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod messages;

pub use codes::TerminationReason;
pub use driver::{
    AsyncCancelCmd, BasicProtocolDriver, ProtocolDriver, BASIC_PROTOCOL_NAME,
    BASIC_PROTOCOL_VERSION,
};
pub use error::{LedgerError, ProtocolError, Result};
pub use ledger::{LedgerClient, LedgerResult, NullLedger};
pub use messages::{DataReceivedAck, Proposal, ProposalReply, ReplyAck};
