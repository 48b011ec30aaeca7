//! Shared types used across the hosted control plane resources
//!
//! Every struct keeps the fields it does not model in an `extra` map and
//! every enum keeps values it does not know in an `Other` variant, so a
//! read-modify-write never drops what a newer operator put on the object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Platform a hosted cluster's infrastructure runs on
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum PlatformType {
    /// Isolated cloud infrastructure (workers in the customer's AWS account)
    #[default]
    #[serde(rename = "AWS")]
    Aws,
    /// Bare control plane with no managed infrastructure or workers
    None,
    /// Any platform this crate does not drive, kept as sent by the server
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for PlatformType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "AWS"),
            Self::None => write!(f, "None"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Replica policy for control plane components or infrastructure
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum AvailabilityPolicy {
    /// One replica of everything
    #[default]
    SingleReplica,
    /// Replicas spread across at least three zones
    HighlyAvailable,
    /// A policy this crate does not know, kept as sent by the server
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for AvailabilityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleReplica => write!(f, "SingleReplica"),
            Self::HighlyAvailable => write!(f, "HighlyAvailable"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Network exposure of a hosted cluster's API endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum EndpointAccess {
    /// Reachable only from the public internet
    #[default]
    Public,
    /// Reachable publicly and through a private link
    PublicAndPrivate,
    /// Reachable only through a private link
    Private,
    /// A mode this crate does not know, kept as sent by the server
    #[serde(untagged)]
    Other(String),
}

impl EndpointAccess {
    /// Whether a test runner outside the private network can reach the API
    ///
    /// Unknown modes count as unreachable; nothing is assumed about them.
    pub fn is_publicly_reachable(&self) -> bool {
        matches!(self, Self::Public | Self::PublicAndPrivate)
    }
}

impl std::fmt::Display for EndpointAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "Public"),
            Self::PublicAndPrivate => write!(f, "PublicAndPrivate"),
            Self::Private => write!(f, "Private"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Kubernetes-style status condition
///
/// Status is kept as the raw string so unexpected values from the server
/// deserialize instead of failing the whole object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Available, EtcdAvailable)
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False", or "Unknown"
    pub status: String,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 timestamp of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Object generation the reporting controller had seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Condition {
    /// A condition with status "True"
    pub fn truthy(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: crate::kube_utils::STATUS_TRUE.to_string(),
            ..Default::default()
        }
    }

    /// A condition with status "False" and a reason
    pub fn falsy(type_: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: "False".to_string(),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Stamp the generation this condition was computed from
    pub fn observed(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    /// True when the condition is "True" and was computed from `generation`
    /// or a later one
    pub fn holds_for(&self, generation: i64) -> bool {
        self.status == crate::kube_utils::STATUS_TRUE
            && self.observed_generation.is_some_and(|seen| seen >= generation)
    }
}

/// Reference to a secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecretReference {
    /// Secret name
    pub name: String,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SecretReference {
    /// Reference a secret by name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: BTreeMap::new(),
        }
    }
}

/// Release payload a cluster or node pool runs
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Release {
    /// Release image pull spec
    pub image: String,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Release {
    /// Release for an image pull spec
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            extra: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_type_wire_names() {
        assert_eq!(serde_json::to_string(&PlatformType::Aws).unwrap(), "\"AWS\"");
        assert_eq!(serde_json::to_string(&PlatformType::None).unwrap(), "\"None\"");
        let aws: PlatformType = serde_json::from_str("\"AWS\"").unwrap();
        assert_eq!(aws, PlatformType::Aws);
    }

    #[test]
    fn unknown_enum_values_are_written_back_unchanged() {
        let platform: PlatformType = serde_json::from_str("\"KubeVirt\"").unwrap();
        assert_eq!(platform, PlatformType::Other("KubeVirt".to_string()));
        assert_eq!(serde_json::to_string(&platform).unwrap(), "\"KubeVirt\"");
        assert_eq!(platform.to_string(), "KubeVirt");

        let access: EndpointAccess = serde_json::from_str("\"PrivateWithProxy\"").unwrap();
        assert_eq!(serde_json::to_string(&access).unwrap(), "\"PrivateWithProxy\"");
        assert!(!access.is_publicly_reachable());

        let policy: AvailabilityPolicy = serde_json::from_str("\"ZonalPair\"").unwrap();
        assert_eq!(policy, AvailabilityPolicy::Other("ZonalPair".to_string()));
        assert_eq!(serde_json::to_string(&policy).unwrap(), "\"ZonalPair\"");
    }

    #[test]
    fn endpoint_access_reachability() {
        assert!(EndpointAccess::Public.is_publicly_reachable());
        assert!(EndpointAccess::PublicAndPrivate.is_publicly_reachable());
        assert!(!EndpointAccess::Private.is_publicly_reachable());
    }

    #[test]
    fn condition_holds_only_for_observed_generation() {
        let stale = Condition::truthy("Available").observed(1);
        assert!(stale.holds_for(1));
        assert!(!stale.holds_for(2));
        assert!(!Condition::truthy("Available").holds_for(1));
        assert!(!Condition::falsy("Available", "Rolling").observed(3).holds_for(2));
    }

    #[test]
    fn condition_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "type": "Available",
            "status": "True",
            "observedGeneration": 4,
            "severity": "Info"
        });
        let condition: Condition = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(condition.observed_generation, Some(4));
        assert_eq!(serde_json::to_value(&condition).unwrap(), raw);
    }
}
