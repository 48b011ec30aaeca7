//! Readiness plans
//!
//! What "ready" means depends on the platform and on whether the guest API
//! can be reached from the test runner at all. Each [`ClusterProfile`] maps
//! to a fixed, ordered list of [`ReadinessCheck`]s; the orchestrator awaits
//! them one after the other.

use std::fmt;

use hcp_e2e_common::crd::{
    EndpointAccess, CONDITION_ETCD_AVAILABLE, CONDITION_KUBE_APISERVER_AVAILABLE,
};
use hcp_e2e_common::kube_utils::CONDITION_AVAILABLE;

use crate::request::Platform;

/// Readiness-relevant shape of a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterProfile {
    /// Cloud platform with a publicly reachable API
    CloudPublic {
        /// Worker nodes the node pools ask for
        expected_nodes: usize,
    },
    /// Cloud platform whose API only answers on a private link
    CloudPrivate,
    /// Bare platform: control plane only
    Bare,
}

impl ClusterProfile {
    /// Profile of a cluster on `platform` with the given endpoint exposure
    pub fn for_cluster(
        platform: &Platform,
        endpoint_access: &EndpointAccess,
        expected_nodes: usize,
    ) -> Self {
        match platform {
            Platform::None => Self::Bare,
            Platform::Aws { .. } if !endpoint_access.is_publicly_reachable() => {
                Self::CloudPrivate
            }
            Platform::Aws { .. } => Self::CloudPublic { expected_nodes },
        }
    }

    /// Checks that must pass, in order, before validation starts
    pub fn readiness_plan(&self) -> Vec<ReadinessCheck> {
        match *self {
            Self::CloudPublic { expected_nodes } => {
                let mut plan = vec![
                    ReadinessCheck::ClusterCondition(CONDITION_AVAILABLE),
                    ReadinessCheck::GuestApiReachable,
                ];
                if expected_nodes > 0 {
                    plan.push(ReadinessCheck::GuestNodesReady(expected_nodes));
                }
                plan.push(ReadinessCheck::RolloutComplete);
                plan.push(ReadinessCheck::NoCrashingPods);
                plan
            }
            Self::CloudPrivate => vec![
                ReadinessCheck::ClusterCondition(CONDITION_AVAILABLE),
                ReadinessCheck::ControlPlaneCondition(CONDITION_KUBE_APISERVER_AVAILABLE),
                ReadinessCheck::RolloutComplete,
                ReadinessCheck::NoCrashingPods,
            ],
            // Without workers the release rollout never completes, and etcd
            // and the API server restart a few times while they settle.
            Self::Bare => vec![
                ReadinessCheck::ControlPlaneCondition(CONDITION_ETCD_AVAILABLE),
                ReadinessCheck::ControlPlaneCondition(CONDITION_KUBE_APISERVER_AVAILABLE),
            ],
        }
    }
}

/// One condition awaited during provisioning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessCheck {
    /// HostedCluster condition is "True"
    ClusterCondition(&'static str),
    /// HostedControlPlane condition is "True"
    ControlPlaneCondition(&'static str),
    /// Guest kubeconfig published and guest API answering
    GuestApiReachable,
    /// At least this many guest nodes are Ready
    GuestNodesReady(usize),
    /// Newest release rollout in the HostedCluster's version history completed
    RolloutComplete,
    /// No control plane pod is crash looping or past
    /// [`MAX_CONTROL_PLANE_RESTARTS`] restarts
    NoCrashingPods,
}

/// Container restarts a control plane pod may accumulate while it settles
pub const MAX_CONTROL_PLANE_RESTARTS: i32 = 3;

impl ReadinessCheck {
    /// Whether the check needs a guest client
    pub fn requires_guest(&self) -> bool {
        matches!(self, Self::GuestApiReachable | Self::GuestNodesReady(_))
    }
}

impl fmt::Display for ReadinessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterCondition(c) => write!(f, "HostedCluster condition {c}"),
            Self::ControlPlaneCondition(c) => write!(f, "HostedControlPlane condition {c}"),
            Self::GuestApiReachable => write!(f, "guest API reachable"),
            Self::GuestNodesReady(n) => write!(f, "{n} guest node(s) Ready"),
            Self::RolloutComplete => write!(f, "release rollout complete"),
            Self::NoCrashingPods => write!(f, "no crashing control plane pods"),
        }
    }
}
