//! Cluster lifecycle orchestration
//!
//! [`HostedClusterTest::execute`] drives one cluster through
//! `Requested -> Provisioning -> Ready -> Validating -> TearingDown -> Done`.
//! A rejected create ends in `Errored` without teardown since nothing
//! exists; the namespace is removed only if this run created it. Every
//! later failure (readiness timeout, failed or panicking validation,
//! cancellation) is recorded and followed by teardown, which runs under its
//! own cancellation token.

mod outcome;
mod phase;
mod readiness;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use hcp_e2e_common::kube_utils::{is_node_ready, poll_until};
use hcp_e2e_common::object::ObjectKey;
use hcp_e2e_common::retry::{retry_with_backoff, RetryConfig};
use hcp_e2e_common::{Error, Result};

use crate::checks::crashing_pods;
use crate::client::{GuestConnector, ManagementClient};
use crate::config::{HarnessOptions, HarnessTimeouts};
use crate::context::{panic_message, Assertions, StepContext};
use crate::request::{ClusterHandle, ClusterRequest, Platform, RenderedCluster};

pub use outcome::ScenarioOutcome;
pub use phase::LifecyclePhase;
pub(crate) use phase::PhaseTracker;
pub use readiness::{ClusterProfile, ReadinessCheck, MAX_CONTROL_PLANE_RESTARTS};

/// Attempts for a single delete call during teardown
const TEARDOWN_DELETE_ATTEMPTS: u32 = 5;

/// Validation callback: `(t, assertions, management client, cluster)`
pub type Validation = Box<
    dyn FnOnce(
            StepContext,
            Assertions,
            ManagementClient,
            ClusterHandle,
        ) -> BoxFuture<'static, Result<()>>
        + Send,
>;

/// Box a closure as a [`Validation`]
pub fn validation<F, Fut>(f: F) -> Validation
where
    F: FnOnce(StepContext, Assertions, ManagementClient, ClusterHandle) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |t, g, mgmt, handle| f(t, g, mgmt, handle).boxed())
}

/// Runs one cluster through its lifecycle
pub struct HostedClusterTest {
    scenario: String,
    mgmt: ManagementClient,
    connector: Arc<dyn GuestConnector>,
    timeouts: HarnessTimeouts,
    pull_secret: Vec<u8>,
    cancel: CancellationToken,
}

impl HostedClusterTest {
    /// Harness for one scenario
    pub fn new(
        scenario: impl Into<String>,
        mgmt: ManagementClient,
        connector: Arc<dyn GuestConnector>,
        options: &HarnessOptions,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            mgmt,
            connector,
            timeouts: options.timeouts.clone(),
            pull_secret: options.pull_secret.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` as the scenario's cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token cancelling provisioning and validation (never teardown)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Provision a cluster for `request`, validate it, and tear it down.
    ///
    /// Never fails itself: every problem is recorded in the returned
    /// outcome. Teardown is entered exactly once for every cluster that was
    /// created.
    pub async fn execute(
        &self,
        request: &ClusterRequest,
        platform: &Platform,
        artifact_dir: Option<&Path>,
        signing_key: Option<&[u8]>,
        validation: Option<Validation>,
    ) -> ScenarioOutcome {
        let handle = ClusterHandle::generate(&request.name_prefix);
        let span = info_span!("scenario", scenario = %self.scenario, cluster = %handle);
        self.run(handle, request, platform, artifact_dir, signing_key, validation)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        handle: ClusterHandle,
        request: &ClusterRequest,
        platform: &Platform,
        artifact_dir: Option<&Path>,
        signing_key: Option<&[u8]>,
        validation: Option<Validation>,
    ) -> ScenarioOutcome {
        let (request, downgrades) = request.resolve_topology(platform);
        let rendered = request.render(&handle, platform, signing_key, &self.pull_secret);
        let mut tracker = PhaseTracker::new(handle.to_string());
        let t = StepContext::new(
            self.scenario.clone(),
            self.cancel.clone(),
            self.mgmt.clone(),
            self.connector.clone(),
            handle.clone(),
            self.timeouts.clone(),
        );
        let failures = t.failure_log().clone();

        let submitted = match self.mgmt.namespaces.create(&rendered.namespace).await {
            Ok(_) => self.submit(&rendered).await.map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };
        if let Err((e, owns_namespace)) = submitted {
            failures.record(&self.scenario, format!("cluster creation rejected: {e}"), true);
            tracker.enter(LifecyclePhase::Errored);
            if owns_namespace {
                self.discard_namespace(&handle).await;
            }
            return ScenarioOutcome {
                scenario: self.scenario.clone(),
                handle,
                phases: tracker.into_phases(),
                failures: failures.snapshot(),
                downgrades,
                teardown_error: None,
            };
        }
        tracker.enter(LifecyclePhase::Provisioning);

        let profile = ClusterProfile::for_cluster(
            platform,
            &request.endpoint_access,
            rendered.expected_nodes(),
        );
        let provisioned = match self.create_node_pools(&rendered).await {
            Ok(()) => self.await_readiness(&t, profile).await,
            Err(e) => Err(e),
        };
        match provisioned {
            Ok(elapsed) => {
                info!(
                    profile = ?profile,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cluster ready"
                );
                tracker.enter(LifecyclePhase::Ready);
                if let Some(validate) = validation {
                    tracker.enter(LifecyclePhase::Validating);
                    self.validate(&t, validate).await;
                }
            }
            Err(e) => failures.record(
                &self.scenario,
                format!("cluster did not become ready: {e}"),
                true,
            ),
        }

        tracker.enter(LifecyclePhase::TearingDown);
        if let Some(dir) = artifact_dir {
            self.dump_artifacts(dir, &handle).await;
        }
        let teardown_error = match self.teardown(&handle).await {
            Ok(()) => {
                tracker.enter(LifecyclePhase::Done);
                None
            }
            Err(e) => {
                error!(error = %e, "Teardown failed");
                tracker.enter(LifecyclePhase::Errored);
                Some(e.to_string())
            }
        };

        ScenarioOutcome {
            scenario: self.scenario.clone(),
            handle,
            phases: tracker.into_phases(),
            failures: failures.snapshot(),
            downgrades,
            teardown_error,
        }
    }

    /// Create everything but the namespace, which the caller already owns
    async fn submit(&self, rendered: &RenderedCluster) -> Result<()> {
        self.mgmt.secrets.create(&rendered.pull_secret).await?;
        if let Some(signing_key) = &rendered.signing_key {
            self.mgmt.secrets.create(signing_key).await?;
        }
        let hc = self
            .mgmt
            .hosted_clusters
            .create(&rendered.hosted_cluster)
            .await?;
        info!(
            platform = %hc.spec.platform.type_,
            endpoint_access = %hc.endpoint_access(),
            "HostedCluster created"
        );
        Ok(())
    }

    async fn create_node_pools(&self, rendered: &RenderedCluster) -> Result<()> {
        for pool in &rendered.node_pools {
            self.mgmt.node_pools.create(pool).await?;
            debug!(node_pool = %ObjectKey::of(pool), "NodePool created");
        }
        Ok(())
    }

    async fn await_readiness(&self, t: &StepContext, profile: ClusterProfile) -> Result<Duration> {
        let start = Instant::now();
        let deadline = start + self.timeouts.provision;
        for check in profile.readiness_plan() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let elapsed = self.await_check(t, check, remaining).await?;
            info!(
                check = %check,
                elapsed_ms = elapsed.as_millis() as u64,
                "Readiness check passed"
            );
        }
        Ok(start.elapsed())
    }

    async fn await_check(
        &self,
        t: &StepContext,
        check: ReadinessCheck,
        timeout: Duration,
    ) -> Result<Duration> {
        let handle = t.handle();
        match check {
            ReadinessCheck::ClusterCondition(condition) => {
                let key = &handle.key();
                let clusters = &self.mgmt.hosted_clusters;
                t.wait_for(format!("{check} on {handle}"), timeout, || async move {
                    Ok(clusters
                        .get(key)
                        .await?
                        .is_some_and(|hc| hc.has_condition(condition)))
                })
                .await
            }
            ReadinessCheck::ControlPlaneCondition(condition) => {
                let key = &handle.control_plane_key();
                let control_planes = &self.mgmt.control_planes;
                t.wait_for(format!("{check} on {key}"), timeout, || async move {
                    Ok(control_planes
                        .get(key)
                        .await?
                        .is_some_and(|hcp| hcp.has_condition(condition)))
                })
                .await
            }
            ReadinessCheck::GuestApiReachable => {
                let start = Instant::now();
                t.guest_client_within(timeout).await?;
                Ok(start.elapsed())
            }
            ReadinessCheck::GuestNodesReady(expected) => {
                let guest = t.guest_client_within(timeout).await?;
                let nodes = &guest.nodes;
                t.wait_for(format!("{check} in {handle}"), timeout, || async move {
                    let ready = nodes
                        .list(None, None)
                        .await?
                        .iter()
                        .filter(|n| is_node_ready(n))
                        .count();
                    Ok(ready >= expected)
                })
                .await
            }
            ReadinessCheck::RolloutComplete => {
                let key = &handle.key();
                let clusters = &self.mgmt.hosted_clusters;
                t.wait_for(format!("{check} on {handle}"), timeout, || async move {
                    Ok(clusters
                        .get(key)
                        .await?
                        .is_some_and(|hc| hc.rollout_complete()))
                })
                .await
            }
            ReadinessCheck::NoCrashingPods => {
                let namespace = &handle.control_plane_namespace();
                let pods = &self.mgmt.pods;
                let last_seen = std::sync::Mutex::new(Vec::new());
                let last_seen = &last_seen;
                let waited = t
                    .wait_for(format!("{check} in {namespace}"), timeout, || async move {
                        let crashing = crashing_pods(
                            &pods.list(Some(namespace.as_str()), None).await?,
                            MAX_CONTROL_PLANE_RESTARTS,
                        );
                        let healthy = crashing.is_empty();
                        *last_seen.lock().unwrap_or_else(|e| e.into_inner()) = crashing;
                        Ok(healthy)
                    })
                    .await;
                waited.map_err(|e| match e {
                    Error::Timeout { .. } => {
                        let crashing = last_seen.lock().unwrap_or_else(|e| e.into_inner());
                        Error::assertion(format!("{e}: {}", crashing.join("; ")))
                    }
                    e => e,
                })
            }
        }
    }

    async fn validate(&self, t: &StepContext, validate: Validation) {
        info!(step = %t.name(), "Running validation");
        let fut = validate(
            t.clone(),
            t.assertions(),
            self.mgmt.clone(),
            t.handle().clone(),
        );
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => t.failure_log().record(t.name(), e.to_string(), true),
            Err(panic) => t
                .failure_log()
                .record(t.name(), format!("PANIC: {}", panic_message(panic)), true),
        }
    }

    async fn teardown(&self, handle: &ClusterHandle) -> Result<()> {
        // The scenario token may already be cancelled; cleanup must still run.
        let cancel = CancellationToken::new();
        let retry = RetryConfig::with_max_attempts(TEARDOWN_DELETE_ATTEMPTS);
        let key = &handle.key();
        let clusters = &self.mgmt.hosted_clusters;

        retry_with_backoff(&retry, &format!("delete HostedCluster {key}"), move || {
            clusters.delete(key)
        })
        .await?;

        let elapsed = poll_until(
            &cancel,
            self.timeouts.poll_interval,
            self.timeouts.teardown,
            format!("HostedCluster {key} to be deleted"),
            || async move { Ok(clusters.get(key).await?.is_none()) },
        )
        .await?;
        info!(elapsed_ms = elapsed.as_millis() as u64, "HostedCluster deleted");

        let namespace = &ObjectKey::cluster(&handle.namespace);
        let namespaces = &self.mgmt.namespaces;
        retry_with_backoff(&retry, &format!("delete namespace {namespace}"), move || {
            namespaces.delete(namespace)
        })
        .await?;
        info!(namespace = %namespace, "Namespace deletion requested");
        Ok(())
    }

    async fn discard_namespace(&self, handle: &ClusterHandle) {
        let key = ObjectKey::cluster(&handle.namespace);
        if let Err(e) = self.mgmt.namespaces.delete(&key).await {
            debug!(namespace = %key, error = %e, "Could not remove namespace of rejected cluster");
        }
    }

    async fn dump_artifacts(&self, dir: &Path, handle: &ClusterHandle) {
        let hc = match self.mgmt.hosted_clusters.get(&handle.key()).await {
            Ok(Some(hc)) => hc,
            Ok(None) => {
                warn!("HostedCluster gone before artifacts could be collected");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read HostedCluster for artifacts");
                return;
            }
        };
        let yaml = match serde_yaml::to_string(&hc) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!(error = %e, "Failed to serialize HostedCluster");
                return;
            }
        };

        let dir = dir.join(&handle.name);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create artifact directory");
            return;
        }
        let path = dir.join("hostedcluster.yaml");
        match tokio::fs::write(&path, yaml).await {
            Ok(()) => debug!(path = %path.display(), "Wrote HostedCluster artifact"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write artifact"),
        }
    }
}
