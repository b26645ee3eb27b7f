//! Exchange Resource Types
//!
//! JSON shapes of the directory resources the negotiation core reads:
//! devices with their registered microservices, workload definitions, and
//! the message routing handle used to reach a producer through the relay.

use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, Result};

/// A device entry returned by a policy search, carrying just enough to
/// start a negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultDevice {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "msgEndPoint", default)]
    pub msg_endpoint: String,

    #[serde(rename = "publicKey", default)]
    pub public_key: String,
}

/// A microservice a device advertises, with its producer policy text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microservice {
    pub url: String,

    /// Serialized producer policy for this microservice.
    #[serde(default)]
    pub policy: String,

    #[serde(rename = "numAgreements", default)]
    pub num_agreements: u32,
}

/// Full device record from the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub owner: String,

    #[serde(rename = "registeredMicroservices", default)]
    pub registered_microservices: Vec<Microservice>,

    #[serde(rename = "msgEndPoint", default)]
    pub msg_endpoint: String,

    #[serde(rename = "publicKey", default)]
    pub public_key: String,
}

/// An API spec a workload definition requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadApiSpec {
    #[serde(rename = "specRef")]
    pub spec_ref: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub arch: String,
}

/// The deployable payload of a workload definition. Definitions with
/// anything other than exactly one entry are rejected upstream, so readers
/// may index the first element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDeployment {
    #[serde(default)]
    pub deployment: String,

    #[serde(rename = "deployment_signature", default)]
    pub deployment_signature: String,

    /// Serialized torrent descriptor; may be empty.
    #[serde(default)]
    pub torrent: String,
}

/// A versioned workload definition from the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub label: String,

    #[serde(rename = "workloadUrl", default)]
    pub workload_url: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub arch: String,

    #[serde(rename = "apiSpec", default)]
    pub api_specs: Vec<WorkloadApiSpec>,

    #[serde(default)]
    pub workloads: Vec<WorkloadDeployment>,
}

/// Opaque routing handle for sending a protocol message to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTarget {
    pub receiver_id: String,
    pub receiver_msg_endpoint: String,
    pub receiver_public_key: String,
}

/// Build a message target from a device's identity and relay coordinates.
pub fn create_message_target(
    device_id: &str,
    public_key: &str,
    msg_endpoint: &str,
) -> Result<MessageTarget> {
    if device_id.is_empty() {
        return Err(ExchangeError::InvalidTarget(
            "receiver id must not be empty".to_string(),
        ));
    }
    Ok(MessageTarget {
        receiver_id: device_id.to_string(),
        receiver_msg_endpoint: msg_endpoint.to_string(),
        receiver_public_key: public_key.to_string(),
    })
}
