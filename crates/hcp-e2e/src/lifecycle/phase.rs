//! Lifecycle phases of a scenario's cluster

use std::fmt;

use tracing::{error, info};

/// Phase of the cluster lifecycle driven by [`super::HostedClusterTest`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Request rendered, not yet accepted by the management cluster
    Requested,
    /// HostedCluster created; waiting for readiness
    Provisioning,
    /// Every readiness check of the cluster's profile passed
    Ready,
    /// Validation callback running
    Validating,
    /// Deleting the cluster
    TearingDown,
    /// Cluster gone
    Done,
    /// Absorbing failure state
    Errored,
}

impl LifecyclePhase {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }

    /// Whether `next` may follow this phase
    pub fn can_transition_to(&self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        match (*self, next) {
            (from, Errored) => !from.is_terminal(),
            (Requested, Provisioning)
            | (Provisioning, Ready)
            | (Provisioning, TearingDown)
            | (Ready, Validating)
            | (Ready, TearingDown)
            | (Validating, TearingDown)
            | (TearingDown, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "Requested"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Ready => write!(f, "Ready"),
            Self::Validating => write!(f, "Validating"),
            Self::TearingDown => write!(f, "TearingDown"),
            Self::Done => write!(f, "Done"),
            Self::Errored => write!(f, "Errored"),
        }
    }
}

/// Ordered record of the phases one cluster went through
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    cluster: String,
    phases: Vec<LifecyclePhase>,
}

impl PhaseTracker {
    pub(crate) fn new(cluster: impl Into<String>) -> Self {
        let tracker = Self {
            cluster: cluster.into(),
            phases: vec![LifecyclePhase::Requested],
        };
        info!(cluster = %tracker.cluster, phase = %LifecyclePhase::Requested, "Lifecycle phase");
        tracker
    }

    pub(crate) fn current(&self) -> LifecyclePhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(LifecyclePhase::Requested)
    }

    /// Move to `next`. Illegal transitions are logged and ignored; they
    /// indicate a harness bug, not a cluster problem.
    pub(crate) fn enter(&mut self, next: LifecyclePhase) {
        let current = self.current();
        if !current.can_transition_to(next) {
            error!(
                cluster = %self.cluster,
                from = %current,
                to = %next,
                "Ignoring illegal lifecycle transition"
            );
            return;
        }
        info!(cluster = %self.cluster, from = %current, phase = %next, "Lifecycle phase");
        self.phases.push(next);
    }

    pub(crate) fn into_phases(self) -> Vec<LifecyclePhase> {
        self.phases
    }
}
