//! Policy Documents
//!
//! A policy is the negotiable unit both sides of an agreement exchange:
//! producers (devices) advertise what they can supply, consumers (the agbot)
//! describe the workloads they want placed and under which terms. Policies
//! travel as JSON; the merged consumer policy text is frozen into the
//! agreement record at initiation.
//!
//! Two operations here carry the negotiation logic:
//!
//! - [`Policy::next_highest_priority_workload`] walks the workload variants
//!   in priority order with retry accounting, feeding the selection loop.
//! - [`Policy::merge_producers`] merges the per-microservice producer
//!   policies of a device into one producer policy for compatibility
//!   checking when a pattern is in play.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::api_spec::ApiSpecList;
use crate::error::{PolicyError, Result};
use crate::workload::Workload;

/// Identifying header of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyHeader {
    pub name: String,

    #[serde(default)]
    pub version: String,
}

/// A named property a producer advertises or a consumer requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: serde_json::Value,
}

/// High-availability partner group. When non-empty, every partner must be
/// registered before any agreement may proceed with any member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HAGroup {
    #[serde(default)]
    pub partners: Vec<String>,
}

/// Data verification terms carried into the proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataVerification {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds without data before the agreement is considered idle.
    #[serde(rename = "interval", default)]
    pub no_data_interval_s: u64,
}

/// Node health terms captured at initiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    #[serde(rename = "missing_heartbeat_interval", default)]
    pub missing_heartbeat_interval_s: u64,

    #[serde(rename = "check_agreement_status", default)]
    pub check_agreement_status_s: u64,
}

/// A durable-commit substrate a protocol can anchor agreements on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRef {
    #[serde(rename = "type", default)]
    pub ledger_type: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub org: String,
}

/// An agreement protocol a policy is willing to negotiate under, with the
/// ledgers acceptable for that protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementProtocol {
    pub name: String,

    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: u32,

    #[serde(default)]
    pub ledgers: Vec<LedgerRef>,
}

/// A complete policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub header: PolicyHeader,

    #[serde(rename = "patternId", default)]
    pub pattern_id: String,

    #[serde(rename = "apiSpec", default)]
    pub api_specs: ApiSpecList,

    #[serde(rename = "agreementProtocols", default)]
    pub agreement_protocols: Vec<AgreementProtocol>,

    #[serde(default)]
    pub workloads: Vec<Workload>,

    #[serde(default)]
    pub properties: Vec<Property>,

    #[serde(rename = "ha_group", default)]
    pub ha_group: HAGroup,

    #[serde(rename = "dataVerification", default)]
    pub data_verify: DataVerification,

    #[serde(rename = "nodeHealth", default)]
    pub node_health: NodeHealth,
}

impl Policy {
    pub fn from_json(text: &str) -> Result<Policy> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The ledger a protocol requires for this policy, or empty strings when
    /// the protocol is acceptable without one.
    pub fn requires_known_ledger(&self, protocol: &str) -> (String, String, String) {
        for agp in &self.agreement_protocols {
            if agp.name == protocol {
                if let Some(ledger) = agp.ledgers.first() {
                    return (
                        ledger.ledger_type.clone(),
                        ledger.name.clone(),
                        ledger.org.clone(),
                    );
                }
            }
        }
        (String::new(), String::new(), String::new())
    }

    /// Choose the workload variant to try next.
    ///
    /// Variants are ordered by ascending `priority_value` (lower value =
    /// more preferred), ties broken by input order. The arguments describe
    /// where the previous attempts left off:
    ///
    /// - `priority == 0` means no prior attempt; the most preferred variant
    ///   is returned.
    /// - A zero `retry_count` with a nonzero `priority` marks the variant
    ///   at `priority` as done (it ran verified and retries are disabled):
    ///   the most preferred variant strictly less preferred than it is
    ///   returned, with window accounting carried from `first_try_time`.
    /// - Otherwise variants more preferred than `priority` are skipped, and
    ///   the variant at `priority` is kept while `retry_count` stays within
    ///   its retry budget or its retry window (measured from
    ///   `first_try_time`) has expired, which resets the count. When the
    ///   budget at `priority` is exhausted, the next less preferred variant
    ///   is returned.
    ///
    /// When every candidate is exhausted the least preferred variant is
    /// returned again; callers detect the repeat and stop iterating.
    pub fn next_highest_priority_workload(
        &self,
        priority: u32,
        retry_count: u32,
        first_try_time: i64,
    ) -> Option<&Workload> {
        self.next_workload_at(priority, retry_count, first_try_time, Utc::now().timestamp())
    }

    fn next_workload_at(
        &self,
        priority: u32,
        retry_count: u32,
        first_try_time: i64,
        now: i64,
    ) -> Option<&Workload> {
        let mut candidates: Vec<&Workload> = self.workloads.iter().collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|w| w.priority.priority_value);

        if priority == 0 {
            return Some(candidates[0]);
        }

        // A zero retry count at a nonzero floor is the verified-workload
        // call shape: the variant at `priority` itself is excluded.
        let floor_is_exclusive = retry_count == 0;

        for w in candidates
            .iter()
            .copied()
            .filter(|w| w.priority.priority_value >= priority)
        {
            if w.priority.priority_value > priority {
                // rolled past the finished priority
                return Some(w);
            }
            if floor_is_exclusive {
                continue;
            }
            let window_expired = w.priority.retry_duration_s > 0
                && first_try_time > 0
                && now - first_try_time > i64::from(w.priority.retry_duration_s);
            if window_expired || retry_count <= w.priority.retries {
                return Some(w);
            }
        }

        // Everything at or below the requested preference is used up; hand
        // back the least preferred variant so the caller's repeat check
        // terminates the loop.
        candidates.last().copied()
    }

    /// Merge two producer policies into one.
    ///
    /// API specs are unioned (first occurrence wins), properties are unioned
    /// with equal-value conflicts tolerated, HA groups must agree when both
    /// are present. Data verification takes the stricter interval;
    /// `no_data_interval_s` fills in when verification is enabled without
    /// one.
    pub fn merge_producers(a: &Policy, b: &Policy, no_data_interval_s: u64) -> Result<Policy> {
        let mut merged = a.clone();

        merged.api_specs.merge(&b.api_specs);

        for prop in &b.properties {
            match merged.properties.iter().find(|p| p.name == prop.name) {
                Some(existing) if existing.value != prop.value => {
                    return Err(PolicyError::Incompatible(format!(
                        "property {} has conflicting values",
                        prop.name
                    )));
                }
                Some(_) => {}
                None => merged.properties.push(prop.clone()),
            }
        }

        if !merged.ha_group.partners.is_empty()
            && !b.ha_group.partners.is_empty()
            && merged.ha_group.partners != b.ha_group.partners
        {
            return Err(PolicyError::Incompatible(
                "HA groups do not match".to_string(),
            ));
        }
        if merged.ha_group.partners.is_empty() {
            merged.ha_group = b.ha_group.clone();
        }

        merged.data_verify.enabled = merged.data_verify.enabled || b.data_verify.enabled;
        if b.data_verify.no_data_interval_s != 0
            && (merged.data_verify.no_data_interval_s == 0
                || b.data_verify.no_data_interval_s < merged.data_verify.no_data_interval_s)
        {
            merged.data_verify.no_data_interval_s = b.data_verify.no_data_interval_s;
        }
        if merged.data_verify.enabled && merged.data_verify.no_data_interval_s == 0 {
            merged.data_verify.no_data_interval_s = no_data_interval_s;
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_spec::ApiSpecification;
    use crate::workload::WorkloadPriority;

    fn workload(url: &str, priority: u32, retries: u32, retry_duration_s: u32) -> Workload {
        Workload {
            workload_url: url.to_string(),
            org: "myorg".to_string(),
            version: "1.0.0".to_string(),
            arch: "amd64".to_string(),
            priority: WorkloadPriority {
                priority_value: priority,
                retries,
                retry_duration_s,
                verified_duration_s: 0,
            },
            ..Default::default()
        }
    }

    fn policy_with(workloads: Vec<Workload>) -> Policy {
        Policy {
            header: PolicyHeader {
                name: "netspeed policy".to_string(),
                version: "2.0".to_string(),
            },
            workloads,
            ..Default::default()
        }
    }

    // ----------------------------------------------------------------
    // next workload selection
    // ----------------------------------------------------------------

    #[test]
    fn test_first_attempt_picks_most_preferred() {
        let pol = policy_with(vec![
            workload("https://wl/b", 2, 1, 3600),
            workload("https://wl/a", 1, 2, 3600),
        ]);
        let w = pol.next_workload_at(0, 0, 0, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/a");
    }

    #[test]
    fn test_retries_within_budget_stay_at_priority() {
        let pol = policy_with(vec![
            workload("https://wl/a", 1, 2, 3600),
            workload("https://wl/b", 2, 1, 3600),
        ]);
        let w = pol.next_workload_at(1, 2, 500, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/a");
    }

    #[test]
    fn test_exhausted_budget_rolls_to_lower_priority() {
        let pol = policy_with(vec![
            workload("https://wl/a", 1, 2, 3600),
            workload("https://wl/b", 2, 1, 3600),
        ]);
        let w = pol.next_workload_at(1, 3, 500, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/b");
    }

    #[test]
    fn test_expired_window_resets_retries() {
        let pol = policy_with(vec![
            workload("https://wl/a", 1, 2, 60),
            workload("https://wl/b", 2, 1, 3600),
        ]);
        // budget exhausted but the window has long expired
        let w = pol.next_workload_at(1, 9, 100, 10_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/a");
    }

    #[test]
    fn test_verified_workload_rolls_strictly_lower() {
        let pol = policy_with(vec![
            workload("https://wl/a", 1, 2, 3600),
            workload("https://wl/b", 2, 1, 3600),
        ]);
        // zero retry count at priority 1: the verified variant is done,
        // selection must fall to priority 2
        let w = pol.next_workload_at(1, 0, 500, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/b");
    }

    #[test]
    fn test_verified_workload_with_no_lower_variant_repeats_last() {
        let pol = policy_with(vec![workload("https://wl/a", 1, 2, 3600)]);
        // nothing strictly less preferred exists; the repeat lets the
        // caller's same-twice check terminate
        let w = pol.next_workload_at(1, 0, 500, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/a");
    }

    #[test]
    fn test_all_exhausted_repeats_last() {
        let pol = policy_with(vec![workload("https://wl/a", 1, 2, 3600)]);
        let w = pol.next_workload_at(1, 5, 500, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/a");
    }

    #[test]
    fn test_ties_broken_by_input_order() {
        let pol = policy_with(vec![
            workload("https://wl/first", 1, 0, 0),
            workload("https://wl/second", 1, 0, 0),
        ]);
        let w = pol.next_workload_at(0, 0, 0, 1_000).unwrap();
        assert_eq!(w.workload_url, "https://wl/first");
    }

    #[test]
    fn test_no_workloads() {
        let pol = policy_with(vec![]);
        assert!(pol.next_workload_at(0, 0, 0, 1_000).is_none());
    }

    // ----------------------------------------------------------------
    // producer merge
    // ----------------------------------------------------------------

    fn producer(props: Vec<(&str, serde_json::Value)>) -> Policy {
        Policy {
            header: PolicyHeader {
                name: "device policy".to_string(),
                version: "2.0".to_string(),
            },
            properties: props
                .into_iter()
                .map(|(n, v)| Property {
                    name: n.to_string(),
                    value: v,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_unions_specs_and_properties() {
        let mut a = producer(vec![("cpus", serde_json::json!(2))]);
        a.api_specs
            .push(ApiSpecification::new("https://ms/gps", "myorg", "1.0.0", "amd64"));
        let mut b = producer(vec![("ram", serde_json::json!(1024))]);
        b.api_specs
            .push(ApiSpecification::new("https://ms/net", "myorg", "1.0.0", "amd64"));

        let merged = Policy::merge_producers(&a, &b, 900).unwrap();
        assert_eq!(merged.api_specs.0.len(), 2);
        assert_eq!(merged.properties.len(), 2);
    }

    #[test]
    fn test_merge_conflicting_property_fails() {
        let a = producer(vec![("cpus", serde_json::json!(2))]);
        let b = producer(vec![("cpus", serde_json::json!(4))]);
        assert!(Policy::merge_producers(&a, &b, 900).is_err());
    }

    #[test]
    fn test_merge_fills_default_data_interval() {
        let mut a = producer(vec![]);
        a.data_verify.enabled = true;
        let b = producer(vec![]);
        let merged = Policy::merge_producers(&a, &b, 900).unwrap();
        assert_eq!(merged.data_verify.no_data_interval_s, 900);
    }

    // ----------------------------------------------------------------
    // serialization
    // ----------------------------------------------------------------

    #[test]
    fn test_json_round_trip_preserves_priorities() {
        let pol = policy_with(vec![workload("https://wl/a", 3, 1, 120)]);
        let text = pol.to_json().unwrap();
        let back = Policy::from_json(&text).unwrap();
        assert_eq!(back.workloads[0].priority.priority_value, 3);
        assert_eq!(back.header.name, "netspeed policy");
    }

    #[test]
    fn test_requires_known_ledger() {
        let mut pol = policy_with(vec![]);
        pol.agreement_protocols.push(AgreementProtocol {
            name: "Basic".to_string(),
            protocol_version: 2,
            ledgers: vec![LedgerRef {
                ledger_type: "ethereum".to_string(),
                name: "main".to_string(),
                org: "myorg".to_string(),
            }],
        });
        let (t, n, o) = pol.requires_known_ledger("Basic");
        assert_eq!((t.as_str(), n.as_str(), o.as_str()), ("ethereum", "main", "myorg"));
        let (t, _, _) = pol.requires_known_ledger("Other");
        assert!(t.is_empty());
    }
}
