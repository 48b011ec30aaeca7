//! HostedControlPlane resource
//!
//! Created by the operator inside the control plane namespace; the harness
//! only reads its conditions.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{Condition, EndpointAccess};
use crate::kube_utils::has_condition;

/// Condition reported once etcd has quorum
pub const CONDITION_ETCD_AVAILABLE: &str = "EtcdAvailable";

/// Condition reported once the guest API server serves requests
pub const CONDITION_KUBE_APISERVER_AVAILABLE: &str = "KubeAPIServerAvailable";

/// Specification of a HostedControlPlane (opaque to the harness)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1beta1",
    kind = "HostedControlPlane",
    plural = "hostedcontrolplanes",
    namespaced,
    status = "HostedControlPlaneStatus",
    schema = "disabled"
)]
pub struct HostedControlPlaneSpec {
    /// All fields, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Observed state of a HostedControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HostedControlPlaneStatus {
    /// Conditions reported by the control plane operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Set once every control plane component is up
    #[serde(default)]
    pub ready: bool,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl HostedControlPlane {
    /// Whether the named status condition is "True"
    pub fn has_condition(&self, condition_type: &str) -> bool {
        has_condition(
            self.status.as_ref().map(|s| s.conditions.as_slice()),
            condition_type,
        )
    }

    /// Whether the named condition is "True" and reflects the current
    /// generation of this object
    pub fn condition_current(&self, condition_type: &str) -> bool {
        let generation = self.metadata.generation.unwrap_or_default();
        self.status
            .iter()
            .flat_map(|s| s.conditions.iter())
            .any(|c| c.type_ == condition_type && c.holds_for(generation))
    }

    /// Endpoint access the operator propagated from the HostedCluster
    pub fn endpoint_access(&self) -> Option<EndpointAccess> {
        self.spec
            .extra
            .get("platform")
            .and_then(|p| p.pointer("/aws/endpointAccess"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Names of the OAuth identity providers the operator propagated from
    /// the HostedCluster
    pub fn identity_provider_names(&self) -> Vec<String> {
        self.spec
            .extra
            .get("configuration")
            .and_then(|c| c.pointer("/oauth/identityProviders"))
            .and_then(|p| p.as_array())
            .map(|providers| {
                providers
                    .iter()
                    .filter_map(|p| p.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
