//! API Specification Lists
//!
//! An API spec identifies a microservice interface a workload depends on (or
//! a device provides): a spec reference URL plus org, version, and
//! architecture. Producer policies advertise the specs a device can supply;
//! workload definitions list the specs they require. Compatibility checking
//! between the two sides is the gate that decides whether a workload variant
//! can be offered to a device at all.
//!
//! ## Version Semantics
//! Versions are dotted numeric strings ("1.2.3"). A required version is
//! treated as a minimum: a producer spec fulfills a requirement when the
//! spec reference, org, and architecture match exactly and the advertised
//! version is greater than or equal to the required one.

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};

/// A single API specification reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSpecification {
    #[serde(rename = "specRef")]
    pub spec_ref: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub arch: String,
}

impl ApiSpecification {
    pub fn new(spec_ref: &str, org: &str, version: &str, arch: &str) -> Self {
        Self {
            spec_ref: spec_ref.to_string(),
            org: org.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        }
    }

    /// True when this spec can stand in for `required`.
    pub fn fulfills(&self, required: &ApiSpecification) -> bool {
        self.spec_ref == required.spec_ref
            && self.org == required.org
            && self.arch == required.arch
            && version_at_least(&self.version, &required.version)
    }
}

/// An ordered list of API specifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiSpecList(pub Vec<ApiSpecification>);

impl ApiSpecList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, spec: ApiSpecification) {
        self.0.push(spec);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ApiSpecification> {
        self.0.iter()
    }

    /// Check that every spec in `required` is fulfilled by some spec in this
    /// list. The first unfulfilled requirement is reported.
    pub fn supports(&self, required: &ApiSpecList) -> Result<()> {
        for req in required.iter() {
            if !self.iter().any(|have| have.fulfills(req)) {
                return Err(PolicyError::UnsupportedApiSpec {
                    spec_ref: req.spec_ref.clone(),
                    org: req.org.clone(),
                    arch: req.arch.clone(),
                    reason: format!("no advertised spec fulfills version {}", req.version),
                });
            }
        }
        Ok(())
    }

    /// Append the specs from `other` that are not already present,
    /// identified by spec reference, org, and architecture.
    pub fn merge(&mut self, other: &ApiSpecList) {
        for spec in other.iter() {
            let present = self.iter().any(|s| {
                s.spec_ref == spec.spec_ref && s.org == spec.org && s.arch == spec.arch
            });
            if !present {
                self.0.push(spec.clone());
            }
        }
    }
}

/// Compare dotted numeric versions; missing components count as zero.
/// Unparseable components make the comparison fail closed.
fn version_at_least(have: &str, want: &str) -> bool {
    let parse = |v: &str| -> Option<Vec<u64>> {
        if v.is_empty() {
            return Some(vec![0]);
        }
        v.split('.').map(|p| p.parse::<u64>().ok()).collect()
    };
    match (parse(have), parse(want)) {
        (Some(h), Some(w)) => {
            let len = h.len().max(w.len());
            for i in 0..len {
                let hv = h.get(i).copied().unwrap_or(0);
                let wv = w.get(i).copied().unwrap_or(0);
                if hv != wv {
                    return hv > wv;
                }
            }
            true
        }
        _ => false,
    }
}
