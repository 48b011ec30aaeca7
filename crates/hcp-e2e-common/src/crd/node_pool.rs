//! NodePool resource: a group of guest worker nodes of one HostedCluster

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{Condition, PlatformType, Release};

/// Specification of a NodePool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1beta1",
    kind = "NodePool",
    plural = "nodepools",
    namespaced,
    status = "NodePoolStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Name of the HostedCluster in the same namespace
    pub cluster_name: String,

    /// Desired node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Release the nodes run
    pub release: Release,

    /// Platform of the nodes
    pub platform: NodePoolPlatform,

    /// Upgrade and repair behaviour
    pub management: NodePoolManagement,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Platform section of a NodePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NodePoolPlatform {
    /// Platform type, matching the HostedCluster's
    #[serde(rename = "type")]
    pub type_: PlatformType,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// NodePool lifecycle management
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolManagement {
    /// "Replace" or "InPlace"
    pub upgrade_type: String,

    /// Replace unhealthy nodes automatically
    #[serde(default)]
    pub auto_repair: bool,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for NodePoolManagement {
    fn default() -> Self {
        Self {
            upgrade_type: "Replace".to_string(),
            auto_repair: false,
            extra: BTreeMap::new(),
        }
    }
}

/// Observed state of a NodePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NodePoolStatus {
    /// Nodes currently joined
    #[serde(default)]
    pub replicas: i32,

    /// Conditions reported by the operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn management_and_status_keep_unknown_fields() {
        let raw = serde_json::json!({
            "apiVersion": "hypershift.openshift.io/v1beta1",
            "kind": "NodePool",
            "metadata": {"name": "demo-us-east-1a", "namespace": "clusters"},
            "spec": {
                "clusterName": "demo",
                "replicas": 2,
                "release": {"image": "quay.io/release:4.17"},
                "platform": {"type": "AWS", "aws": {"instanceType": "m5.large"}},
                "management": {
                    "upgradeType": "Replace",
                    "autoRepair": false,
                    "replace": {"strategy": "RollingUpdate"}
                }
            },
            "status": {"replicas": 2, "version": "4.17.0"}
        });

        let pool: NodePool = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(pool.spec.management.upgrade_type, "Replace");
        assert_eq!(serde_json::to_value(&pool).unwrap(), raw);
    }
}
