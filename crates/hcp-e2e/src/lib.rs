//! Lifecycle test harness for hosted control plane clusters.
//!
//! A scenario renders a [`ClusterRequest`], submits it to the management
//! cluster, waits for the readiness conditions that fit its platform, hands
//! the cluster to a validation callback, and tears it down no matter how
//! validation went. The building blocks:
//!
//! - [`mutate::update_object`]: read-modify-write with conflict retry
//! - [`guest`]: guest and break-glass client resolution
//! - [`lifecycle::HostedClusterTest`]: the lifecycle state machine
//! - [`endpoint_access`]: private/public endpoint transitions
//! - [`checks`]: pod health, placement, admission, encryption and OAuth checks
//! - [`scenarios`]: the named scenario drivers

#![deny(missing_docs)]

pub mod checks;
pub mod client;
pub mod config;
pub mod context;
pub mod endpoint_access;
pub mod guest;
pub mod lifecycle;
pub mod mutate;
pub mod request;
pub mod scenarios;

pub use client::{GuestClient, GuestConnector, GuestCredentials, ManagementClient};
pub use config::{HarnessOptions, HarnessTimeouts};
pub use context::{Assertions, Failure, StepContext};
pub use hcp_e2e_common::{Error, Result};
pub use lifecycle::{HostedClusterTest, LifecyclePhase, ScenarioOutcome, Validation};
pub use request::{ClusterHandle, ClusterRequest, Platform, TopologyDowngrade};
pub use scenarios::{ScenarioEnv, ScenarioRun};
