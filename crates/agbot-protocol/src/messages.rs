//! Protocol Wire Messages
//!
//! The four message kinds exchanged through the relay during a
//! negotiation. All travel as JSON with a `msgType` discriminator; each
//! carries the protocol name and version so a receiver can reject messages
//! from a variant it does not speak.
//!
//! Flow: the agbot sends a [`Proposal`]; the producer answers with a
//! [`ProposalReply`]; the agbot confirms with a [`ReplyAck`]; once data is
//! flowing the producer reports it with a [`DataReceivedAck`].

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

pub const MSG_TYPE_PROPOSAL: &str = "proposal";
pub const MSG_TYPE_REPLY: &str = "proposalReply";
pub const MSG_TYPE_REPLY_ACK: &str = "replyAck";
pub const MSG_TYPE_DATA_RECEIVED_ACK: &str = "dataReceivedAck";

/// The agbot's offer: terms and conditions plus the producer policy the
/// offer was matched against. Frozen into the agreement record at
/// initiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(rename = "msgType")]
    pub msg_type: String,

    pub protocol: String,
    pub version: u32,

    #[serde(rename = "agreementId")]
    pub agreement_id: String,

    /// Serialized consumer policy holding exactly the chosen workload.
    #[serde(rename = "tsandcs")]
    pub ts_and_cs: String,

    /// The producer policy text as received from the exchange.
    #[serde(rename = "producerPolicy")]
    pub producer_policy: String,

    /// Exchange id of the agbot making the offer.
    #[serde(rename = "consumerId")]
    pub consumer_id: String,
}

impl Proposal {
    pub fn new(
        protocol: &str,
        version: u32,
        agreement_id: &str,
        ts_and_cs: &str,
        producer_policy: &str,
        consumer_id: &str,
    ) -> Self {
        Self {
            msg_type: MSG_TYPE_PROPOSAL.to_string(),
            protocol: protocol.to_string(),
            version,
            agreement_id: agreement_id.to_string(),
            ts_and_cs: ts_and_cs.to_string(),
            producer_policy: producer_policy.to_string(),
            consumer_id: consumer_id.to_string(),
        }
    }

    pub fn from_json(text: &str) -> Result<Proposal> {
        let p: Proposal = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidMessage(format!("proposal: {e}")))?;
        if p.msg_type != MSG_TYPE_PROPOSAL {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected {MSG_TYPE_PROPOSAL}, got {}",
                p.msg_type
            )));
        }
        Ok(p)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The producer's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalReply {
    #[serde(rename = "msgType")]
    pub msg_type: String,

    pub protocol: String,
    pub version: u32,

    #[serde(rename = "agreementId")]
    pub agreement_id: String,

    /// True when the producer accepts the proposal.
    pub decision: bool,

    /// The producer's address on the durable-commit substrate; empty when
    /// the protocol variant does not use one.
    #[serde(rename = "address", default)]
    pub counterparty_address: String,

    #[serde(rename = "deviceId", default)]
    pub device_id: String,
}

impl ProposalReply {
    pub fn new(protocol: &str, version: u32, agreement_id: &str, decision: bool) -> Self {
        Self {
            msg_type: MSG_TYPE_REPLY.to_string(),
            protocol: protocol.to_string(),
            version,
            agreement_id: agreement_id.to_string(),
            decision,
            counterparty_address: String::new(),
            device_id: String::new(),
        }
    }

    pub fn accepted(&self) -> bool {
        self.decision
    }

    pub fn from_json(text: &str) -> Result<ProposalReply> {
        let r: ProposalReply = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidMessage(format!("reply: {e}")))?;
        if r.msg_type != MSG_TYPE_REPLY {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected {MSG_TYPE_REPLY}, got {}",
                r.msg_type
            )));
        }
        if r.agreement_id.is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "reply carries no agreement id".to_string(),
            ));
        }
        Ok(r)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The agbot's confirmation of a reply. `still_valid == false` tells the
/// producer to tear down whatever it set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyAck {
    #[serde(rename = "msgType")]
    pub msg_type: String,

    pub protocol: String,
    pub version: u32,

    #[serde(rename = "agreementId")]
    pub agreement_id: String,

    #[serde(rename = "stillValid")]
    pub still_valid: bool,
}

impl ReplyAck {
    pub fn new(protocol: &str, version: u32, agreement_id: &str, still_valid: bool) -> Self {
        Self {
            msg_type: MSG_TYPE_REPLY_ACK.to_string(),
            protocol: protocol.to_string(),
            version,
            agreement_id: agreement_id.to_string(),
            still_valid,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Producer's notice that workload data has been observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReceivedAck {
    #[serde(rename = "msgType")]
    pub msg_type: String,

    pub protocol: String,
    pub version: u32,

    #[serde(rename = "agreementId")]
    pub agreement_id: String,
}

impl DataReceivedAck {
    pub fn new(protocol: &str, version: u32, agreement_id: &str) -> Self {
        Self {
            msg_type: MSG_TYPE_DATA_RECEIVED_ACK.to_string(),
            protocol: protocol.to_string(),
            version,
            agreement_id: agreement_id.to_string(),
        }
    }

    pub fn from_json(text: &str) -> Result<DataReceivedAck> {
        let a: DataReceivedAck = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidMessage(format!("data received ack: {e}")))?;
        if a.msg_type != MSG_TYPE_DATA_RECEIVED_ACK {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected {MSG_TYPE_DATA_RECEIVED_ACK}, got {}",
                a.msg_type
            )));
        }
        Ok(a)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_round_trip() {
        let p = Proposal::new("Basic", 2, "ag1", "{\"tc\":1}", "{\"pp\":1}", "myorg/agbot1");
        let back = Proposal::from_json(&p.to_json().unwrap()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_reply_validation() {
        let mut r = ProposalReply::new("Basic", 2, "ag1", true);
        r.counterparty_address = "0xabc".to_string();
        let back = ProposalReply::from_json(&r.to_json().unwrap()).unwrap();
        assert!(back.accepted());
        assert_eq!(back.counterparty_address, "0xabc");

        // wrong discriminator
        let ack = ReplyAck::new("Basic", 2, "ag1", true).to_json().unwrap();
        assert!(ProposalReply::from_json(&ack).is_err());

        // missing agreement id
        let empty = ProposalReply::new("Basic", 2, "", true).to_json().unwrap();
        assert!(ProposalReply::from_json(&empty).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Proposal::from_json("not json").is_err());
        assert!(DataReceivedAck::from_json("{}").is_err());
    }
}
