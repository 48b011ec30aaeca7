//! Result of one scenario execution

use std::fmt::Write as _;

use crate::context::Failure;
use crate::request::{ClusterHandle, TopologyDowngrade};

use super::LifecyclePhase;

/// Everything a scenario run produced
#[derive(Clone, Debug)]
pub struct ScenarioOutcome {
    /// Scenario name
    pub scenario: String,
    /// Cluster the scenario provisioned
    pub handle: ClusterHandle,
    /// Phases in the order they were entered
    pub phases: Vec<LifecyclePhase>,
    /// Provisioning and validation failures, in order
    pub failures: Vec<Failure>,
    /// Settings weakened to fit the available zones
    pub downgrades: Vec<TopologyDowngrade>,
    /// Teardown failure, kept apart from validation failures
    pub teardown_error: Option<String>,
}

impl ScenarioOutcome {
    /// No failure anywhere, teardown included
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.teardown_error.is_none()
    }

    /// Last phase entered
    pub fn final_phase(&self) -> LifecyclePhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(LifecyclePhase::Requested)
    }

    /// How often `phase` was entered
    pub fn times_entered(&self, phase: LifecyclePhase) -> usize {
        self.phases.iter().filter(|p| **p == phase).count()
    }

    /// Collapse into a test result.
    ///
    /// Validation failures are listed before the teardown error so the
    /// first line names the original cause.
    pub fn into_result(self) -> Result<(), String> {
        if self.passed() {
            return Ok(());
        }

        let mut msg = format!(
            "scenario {} on {} failed (final phase {}):",
            self.scenario,
            self.handle,
            self.final_phase()
        );
        for failure in &self.failures {
            let _ = write!(msg, "\n  {failure}");
        }
        if let Some(e) = &self.teardown_error {
            let _ = write!(msg, "\n  TEARDOWN {e}");
        }
        Err(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> ScenarioOutcome {
        ScenarioOutcome {
            scenario: "create-cluster".to_string(),
            handle: ClusterHandle::new("ns", "c"),
            phases: vec![
                LifecyclePhase::Requested,
                LifecyclePhase::Provisioning,
                LifecyclePhase::Ready,
                LifecyclePhase::Validating,
                LifecyclePhase::TearingDown,
                LifecyclePhase::Done,
            ],
            failures: Vec::new(),
            downgrades: Vec::new(),
            teardown_error: None,
        }
    }

    #[test]
    fn clean_run_passes() {
        let o = outcome();
        assert!(o.passed());
        assert_eq!(o.final_phase(), LifecyclePhase::Done);
        assert_eq!(o.times_entered(LifecyclePhase::TearingDown), 1);
        assert!(o.into_result().is_ok());
    }

    #[test]
    fn teardown_error_does_not_mask_validation_failure() {
        let mut o = outcome();
        o.failures.push(Failure {
            step: "create-cluster/break-glass-credentials".to_string(),
            message: "wrong group".to_string(),
            fatal: true,
        });
        o.teardown_error = Some("timed out waiting for deletion".to_string());

        let msg = o.into_result().unwrap_err();
        let validation = msg.find("wrong group").unwrap();
        let teardown = msg.find("TEARDOWN").unwrap();
        assert!(validation < teardown);
    }

    #[test]
    fn teardown_error_alone_fails() {
        let mut o = outcome();
        o.teardown_error = Some("namespace stuck".to_string());
        assert!(!o.passed());
        assert!(o.into_result().unwrap_err().contains("namespace stuck"));
    }
}
