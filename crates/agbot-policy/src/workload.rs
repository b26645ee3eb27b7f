//! Workload Definitions
//!
//! A workload is a versioned deployable artifact referenced by a consumer
//! policy. A policy may carry several workload variants at different
//! priorities; the negotiation loop walks them from the most preferred
//! (lowest priority value) downward, governed by the retry accounting in
//! each variant's [`WorkloadPriority`].

use serde::{Deserialize, Serialize};

/// Priority and retry policy for one workload variant.
///
/// A zero `priority_value` means the workload carries no priority at all;
/// such workloads never participate in rollback accounting and no usage
/// record is kept for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadPriority {
    #[serde(rename = "priority_value", default)]
    pub priority_value: u32,

    /// Number of retries permitted within the retry window.
    #[serde(default)]
    pub retries: u32,

    /// Length of the retry window in seconds. After the window expires the
    /// retry count starts over.
    #[serde(rename = "retry_durations", default)]
    pub retry_duration_s: u32,

    /// How long an agreement must stay up before the workload is considered
    /// verified and retries are disabled.
    #[serde(rename = "verified_durations", default)]
    pub verified_duration_s: u32,
}

impl WorkloadPriority {
    pub fn is_same(&self, other: &WorkloadPriority) -> bool {
        self.priority_value == other.priority_value
    }
}

/// Download descriptor for a workload's image package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Torrent {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub signature: String,
}

/// One deployable workload variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(rename = "workloadUrl", default)]
    pub workload_url: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub arch: String,

    #[serde(default)]
    pub priority: WorkloadPriority,

    /// Deployment configuration, filled in from the exchange definition
    /// when the workload is chosen.
    #[serde(default)]
    pub deployment: String,

    #[serde(rename = "deployment_signature", default)]
    pub deployment_signature: String,

    #[serde(default)]
    pub torrent: Torrent,

    /// Password a device presents to fetch the workload. Defaults to the
    /// agbot-wide password when the policy leaves it empty.
    #[serde(rename = "workload_password", default)]
    pub workload_password: String,
}

impl Workload {
    pub fn has_empty_priority(&self) -> bool {
        self.priority.priority_value == 0
    }

    /// Identity of the variant irrespective of the deployment details that
    /// get attached after selection.
    pub fn same_variant(&self, other: &Workload) -> bool {
        self.workload_url == other.workload_url
            && self.org == other.org
            && self.version == other.version
            && self.arch == other.arch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_priority() {
        let w = Workload::default();
        assert!(w.has_empty_priority());

        let mut w2 = Workload::default();
        w2.priority.priority_value = 3;
        assert!(!w2.has_empty_priority());
    }

    #[test]
    fn test_same_variant_ignores_deployment() {
        let mut a = Workload {
            workload_url: "https://wl/netspeed".into(),
            org: "myorg".into(),
            version: "1.0.0".into(),
            arch: "amd64".into(),
            ..Default::default()
        };
        let b = a.clone();
        a.deployment = "{\"services\":{}}".into();
        assert!(a.same_variant(&b));
    }
}
