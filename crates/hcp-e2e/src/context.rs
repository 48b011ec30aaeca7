//! Context handed to validation callbacks
//!
//! [`StepContext`] plays the role of a test handle: it names the current
//! step, carries the scenario's cancellation token and clients, resolves the
//! guest client lazily, and runs named sub-steps. [`Assertions`] records
//! soft failures without aborting the step. Both write into one failure log
//! per scenario, which ends up in the scenario outcome.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hcp_e2e_common::crd::HostedCluster;
use hcp_e2e_common::kube_utils::poll_until;
use hcp_e2e_common::{Error, Result};

use crate::client::{GuestClient, GuestConnector, ManagementClient};
use crate::config::HarnessTimeouts;
use crate::guest::{wait_for_break_glass_client, wait_for_guest_client};
use crate::request::ClusterHandle;

/// A recorded test failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    /// Step the failure happened in (`scenario/sub-step`)
    pub step: String,
    /// What went wrong
    pub message: String,
    /// Whether the step was aborted (error or panic) rather than a soft
    /// assertion
    pub fatal: bool,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.fatal { "FATAL" } else { "FAIL" };
        write!(f, "{kind} [{}] {}", self.step, self.message)
    }
}

/// Failures of one scenario, shared by all of its steps
#[derive(Clone, Default)]
pub(crate) struct FailureLog(Arc<Mutex<Vec<Failure>>>);

impl FailureLog {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Failure>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record(&self, step: &str, message: impl Into<String>, fatal: bool) {
        let failure = Failure {
            step: step.to_string(),
            message: message.into(),
            fatal,
        };
        if fatal {
            error!(step = %failure.step, error = %failure.message, "Step failed");
        } else {
            warn!(step = %failure.step, error = %failure.message, "Expectation failed");
        }
        self.lock().push(failure);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Failure> {
        self.lock().clone()
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Soft assertions bound to one step
#[derive(Clone)]
pub struct Assertions {
    step: String,
    failures: FailureLog,
}

impl Assertions {
    /// Record a failure unless `ok` holds; returns `ok`
    pub fn expect(&self, ok: bool, message: impl Into<String>) -> bool {
        if !ok {
            self.failures.record(&self.step, message, false);
        }
        ok
    }

    /// Record a failure unless `actual == expected`
    pub fn expect_eq<T>(&self, actual: T, expected: T, what: &str) -> bool
    where
        T: PartialEq + fmt::Debug,
    {
        let ok = actual == expected;
        if !ok {
            self.failures.record(
                &self.step,
                format!("{what}: expected {expected:?}, got {actual:?}"),
                false,
            );
        }
        ok
    }

    /// Record a failure for an error result; returns the value otherwise
    pub fn expect_ok<T, E>(&self, result: std::result::Result<T, E>, what: &str) -> Option<T>
    where
        E: fmt::Display,
    {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.failures.record(&self.step, format!("{what}: {e}"), false);
                None
            }
        }
    }
}

/// Handle to the running step of a scenario
#[derive(Clone)]
pub struct StepContext {
    name: String,
    cancel: CancellationToken,
    mgmt: ManagementClient,
    connector: Arc<dyn GuestConnector>,
    handle: ClusterHandle,
    timeouts: HarnessTimeouts,
    guest: Arc<tokio::sync::Mutex<Option<GuestClient>>>,
    failures: FailureLog,
}

impl StepContext {
    /// Root step of a scenario
    pub fn new(
        name: impl Into<String>,
        cancel: CancellationToken,
        mgmt: ManagementClient,
        connector: Arc<dyn GuestConnector>,
        handle: ClusterHandle,
        timeouts: HarnessTimeouts,
    ) -> Self {
        Self {
            name: name.into(),
            cancel,
            mgmt,
            connector,
            handle,
            timeouts,
            guest: Arc::default(),
            failures: FailureLog::default(),
        }
    }

    /// Step name, `scenario/sub-step/...`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancellation token of this step
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Management cluster client
    pub fn management(&self) -> &ManagementClient {
        &self.mgmt
    }

    /// Cluster under test
    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    /// Deadlines and poll cadence
    pub fn timeouts(&self) -> &HarnessTimeouts {
        &self.timeouts
    }

    /// Soft assertions recorded against this step
    pub fn assertions(&self) -> Assertions {
        Assertions {
            step: self.name.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Every failure recorded in the scenario so far
    pub fn failures(&self) -> Vec<Failure> {
        self.failures.snapshot()
    }

    pub(crate) fn failure_log(&self) -> &FailureLog {
        &self.failures
    }

    /// Current copy of the HostedCluster under test
    pub async fn hosted_cluster(&self) -> Result<HostedCluster> {
        let key = self.handle.key();
        self.mgmt
            .hosted_clusters
            .get(&key)
            .await?
            .ok_or_else(|| Error::validation(format!("HostedCluster {key} does not exist")))
    }

    /// Guest client for the cluster, resolved on first use and shared by
    /// every step of the scenario afterwards
    pub async fn guest_client(&self) -> Result<GuestClient> {
        self.guest_client_within(self.timeouts.guest_client).await
    }

    /// Like [`StepContext::guest_client`], but a resolution gives up after
    /// `timeout` or the configured guest-client timeout, whichever is shorter
    pub async fn guest_client_within(&self, timeout: Duration) -> Result<GuestClient> {
        let mut cached = self.guest.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }
        let client = wait_for_guest_client(
            &self.cancel,
            &self.mgmt,
            self.connector.as_ref(),
            &self.handle,
            &self.timeouts,
            timeout.min(self.timeouts.guest_client),
        )
        .await?;
        *cached = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached guest client, e.g. after the endpoint changed
    pub async fn forget_guest_client(&self) {
        self.guest.lock().await.take();
    }

    /// Client authenticated with the break-glass certificate (never cached)
    pub async fn break_glass_client(&self) -> Result<GuestClient> {
        wait_for_break_glass_client(
            &self.cancel,
            &self.mgmt,
            self.connector.as_ref(),
            &self.handle,
            &self.timeouts,
        )
        .await
    }

    /// Poll `check` at the configured interval until it holds
    pub async fn wait_for<F, Fut>(
        &self,
        condition: impl Into<String>,
        timeout: Duration,
        check: F,
    ) -> Result<Duration>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        poll_until(&self.cancel, self.timeouts.poll_interval, timeout, condition, check).await
    }

    /// Run a named sub-step.
    ///
    /// An error or panic inside `f` is recorded as a fatal failure of the
    /// sub-step; the caller continues either way. Returns whether the
    /// sub-step passed, soft assertions included.
    pub async fn run<F, Fut>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(StepContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut child = self.clone();
        child.name = format!("{}/{name}", self.name);
        child.cancel = self.cancel.child_token();
        let step = child.name.clone();

        info!(step = %step, "Running step");
        let start = Instant::now();
        let recorded_before = self.failures.len();

        match AssertUnwindSafe(f(child)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.failures.record(&step, e.to_string(), true),
            Err(panic) => {
                self.failures
                    .record(&step, format!("PANIC: {}", panic_message(panic)), true)
            }
        }

        let passed = self.failures.len() == recorded_before;
        let duration_ms = start.elapsed().as_millis() as u64;
        if passed {
            info!(step = %step, duration_ms, "PASS");
        } else {
            error!(step = %step, duration_ms, "FAIL");
        }
        passed
    }
}
