//! Scenario drivers
//!
//! Each driver builds its own [`ClusterRequest`] from the shared options,
//! picks a validation callback, and hands both to a fresh
//! [`HostedClusterTest`]. Drivers share nothing mutable, so any number of
//! them can run at once (see [`run_all`]).

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hcp_e2e_common::crd::{
    AvailabilityPolicy, EndpointAccess, CONDITION_ETCD_AVAILABLE,
    CONDITION_KUBE_APISERVER_AVAILABLE,
};
use hcp_e2e_common::{
    Result, CONTROL_PLANE_NODE_LABEL, DEDICATED_REQUEST_SERVING_TOPOLOGY,
    REQUEST_SERVING_LABEL, TOPOLOGY_ANNOTATION,
};

use crate::checks::{
    ensure_oauth_identity_provider, ensure_psa_not_privileged, ensure_secret_encrypted_using_kms,
    pods_off_control_plane_nodes,
};
use crate::client::{GuestConnector, KubeGuestConnector, ManagementClient};
use crate::config::HarnessOptions;
use crate::endpoint_access::{switch_to_private, switch_to_public};
use crate::guest::verify_break_glass_identity;
use crate::lifecycle::{validation, HostedClusterTest, ScenarioOutcome, Validation};
use crate::request::{ClusterRequest, Platform, RequestServing, MIN_HA_ZONES};

/// Result of invoking a scenario driver
#[derive(Clone, Debug)]
pub enum ScenarioRun {
    /// The scenario provisioned a cluster and ran to completion
    Completed(ScenarioOutcome),
    /// Preconditions of the scenario are not met in this environment
    Skipped {
        /// Scenario name
        scenario: String,
        /// Why the scenario did not run
        reason: String,
    },
}

impl ScenarioRun {
    fn skipped(scenario: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!(scenario, reason = %reason, "Skipping scenario");
        Self::Skipped {
            scenario: scenario.to_string(),
            reason,
        }
    }

    /// Outcome of a completed run
    pub fn outcome(&self) -> Option<&ScenarioOutcome> {
        match self {
            Self::Completed(outcome) => Some(outcome),
            Self::Skipped { .. } => None,
        }
    }

    /// Whether the scenario was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Test result; a skipped scenario passes
    pub fn into_result(self) -> std::result::Result<(), String> {
        match self {
            Self::Completed(outcome) => outcome.into_result(),
            Self::Skipped { .. } => Ok(()),
        }
    }
}

/// Everything scenario drivers share: read-only options and the management
/// connection
#[derive(Clone)]
pub struct ScenarioEnv {
    /// Process-wide options
    pub options: Arc<HarnessOptions>,
    /// Management cluster client
    pub mgmt: ManagementClient,
    /// Builds guest clients
    pub connector: Arc<dyn GuestConnector>,
    cancel: CancellationToken,
}

impl ScenarioEnv {
    /// Environment from explicit parts
    pub fn new(
        options: Arc<HarnessOptions>,
        mgmt: ManagementClient,
        connector: Arc<dyn GuestConnector>,
    ) -> Self {
        Self {
            options,
            mgmt,
            connector,
            cancel: CancellationToken::new(),
        }
    }

    /// Environment from `HCP_E2E_*` variables and the ambient kubeconfig
    pub async fn from_env() -> Result<Self> {
        let options = HarnessOptions::from_env()?;
        let mgmt = ManagementClient::try_default().await?;
        Ok(Self::new(Arc::new(options), mgmt, Arc::new(KubeGuestConnector)))
    }

    /// Tie every scenario started from this environment to `cancel`
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn request(&self) -> ClusterRequest {
        ClusterRequest::from_options(&self.options)
    }

    fn has_ha_zones(&self) -> bool {
        self.options.zones.len() >= MIN_HA_ZONES
    }

    async fn execute(
        &self,
        scenario: &str,
        request: &ClusterRequest,
        platform: &Platform,
        validation: Option<Validation>,
    ) -> ScenarioRun {
        let test = HostedClusterTest::new(
            scenario,
            self.mgmt.clone(),
            self.connector.clone(),
            &self.options,
        )
        .with_cancellation(self.cancel.child_token());

        let outcome = test
            .execute(
                request,
                platform,
                self.options.artifact_dir.as_deref(),
                self.options.signing_key.as_deref(),
                validation,
            )
            .await;
        ScenarioRun::Completed(outcome)
    }
}

/// Default cluster; highly available infrastructure when the zones allow
/// it, and the break-glass credential check
pub async fn create_cluster(env: &ScenarioEnv) -> ScenarioRun {
    let request = create_cluster_request(env);
    let validate = validation(|t, _, _, _| async move {
        t.run("break-glass-credentials", |t| async move {
            let client = t.break_glass_client().await?;
            verify_break_glass_identity(&client).await?;
            Ok(())
        })
        .await;
        Ok(())
    });

    env.execute("create-cluster", &request, &env.options.platform, Some(validate))
        .await
}

fn create_cluster_request(env: &ScenarioEnv) -> ClusterRequest {
    let mut request = env.request();
    if env.has_ha_zones() {
        // One worker per zone exercises multi-zone node pools.
        request.infrastructure_availability = AvailabilityPolicy::HighlyAvailable;
        request.node_pool_replicas = 1;
    }
    request
}

fn request_serving_request(env: &ScenarioEnv) -> ClusterRequest {
    let mut request = env.request();
    request.controller_availability = AvailabilityPolicy::HighlyAvailable;
    if env.has_ha_zones() {
        request.infrastructure_availability = AvailabilityPolicy::HighlyAvailable;
        request.request_serving = RequestServing::Dedicated;
        request.node_pool_replicas = 1;
    }
    // Kept even without dedicated node placement.
    request.annotations.insert(
        TOPOLOGY_ANNOTATION.to_string(),
        DEDICATED_REQUEST_SERVING_TOPOLOGY.to_string(),
    );
    request
}

/// Request-serving components on dedicated nodes
pub async fn create_cluster_request_serving_isolation(env: &ScenarioEnv) -> ScenarioRun {
    const NAME: &str = "create-cluster-request-serving-isolation";
    if !env.options.request_serving_isolation {
        return ScenarioRun::skipped(NAME, "request serving isolation is not enabled");
    }
    if !matches!(env.options.platform, Platform::Aws { .. }) {
        return ScenarioRun::skipped(NAME, "request serving isolation requires the AWS platform");
    }

    let request = request_serving_request(env);
    let validate = validation(|t, g, mgmt, handle| async move {
        let guest = t.guest_client().await?;
        t.run("psa-not-privileged", |_| async move {
            ensure_psa_not_privileged(&guest).await
        })
        .await;

        let namespace = handle.control_plane_namespace();
        let pods = mgmt.pods.list(Some(namespace.as_str()), None).await?;
        let serving_nodes: BTreeSet<String> = mgmt
            .nodes
            .list(None, Some(REQUEST_SERVING_LABEL))
            .await?
            .iter()
            .map(|n| n.name_any())
            .collect();
        g.expect(
            !serving_nodes.is_empty(),
            format!("no nodes labelled {REQUEST_SERVING_LABEL}"),
        );

        for violation in request_serving_violations(&pods, &serving_nodes) {
            g.expect(false, violation);
        }

        let hc = t.hosted_cluster().await?;
        if hc.spec.node_selector.is_some() {
            let control_plane_nodes: BTreeSet<String> = mgmt
                .nodes
                .list(None, Some(&format!("{CONTROL_PLANE_NODE_LABEL}=true")))
                .await?
                .iter()
                .map(|n| n.name_any())
                .collect();
            for violation in pods_off_control_plane_nodes(&pods, &control_plane_nodes) {
                g.expect(false, violation);
            }
        }
        Ok(())
    });

    env.execute(NAME, &request, &env.options.platform, Some(validate))
        .await
}

/// Placement problems of control plane pods.
///
/// Pods labelled as request serving must run on a node from
/// `serving_nodes`; every other pod must stay off those nodes. Pods not yet
/// scheduled are ignored.
pub fn request_serving_violations(pods: &[Pod], serving_nodes: &BTreeSet<String>) -> Vec<String> {
    let mut violations = Vec::new();
    for pod in pods {
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            continue;
        };
        let serving = pod.labels().get(REQUEST_SERVING_LABEL).map(String::as_str) == Some("true");
        let on_serving_node = serving_nodes.contains(node);
        if serving && !on_serving_node {
            violations.push(format!(
                "request-serving pod {} runs on non-request-serving node {node}",
                pod.name_any()
            ));
        } else if !serving && on_serving_node {
            violations.push(format!(
                "pod {} runs on request-serving node {node}",
                pod.name_any()
            ));
        }
    }
    violations
}

/// Custom configuration: KMS secret encryption and an OAuth identity
/// provider
pub async fn create_cluster_custom_config(env: &ScenarioEnv) -> ScenarioRun {
    const NAME: &str = "create-cluster-custom-config";
    if !matches!(env.options.platform, Platform::Aws { .. }) {
        return ScenarioRun::skipped(NAME, "custom config is only supported on the AWS platform");
    }
    let Some(kms) = env.options.kms.clone() else {
        return ScenarioRun::skipped(NAME, "no KMS key configured");
    };

    let mut request = env.request();
    request.encryption = Some(kms.clone());

    let validate = validation(move |t, g, _, _| async move {
        let hc = t.hosted_cluster().await?;
        let aws_kms = hc
            .spec
            .secret_encryption
            .as_ref()
            .and_then(|e| e.kms.as_ref())
            .and_then(|k| k.aws.as_ref());

        if g.expect(aws_kms.is_some(), "HostedCluster has no AWS KMS encryption") {
            if let Some(aws_kms) = aws_kms {
                g.expect_eq(
                    aws_kms.active_key.arn.as_str(),
                    kms.key_arn.as_str(),
                    "active KMS key ARN",
                );
                g.expect(
                    !aws_kms.auth.aws_kms_role_arn.is_empty(),
                    "KMS role ARN is empty",
                );
            }
        }

        t.guest_client().await?;
        t.run("secret-encrypted-using-kms", |t| async move {
            ensure_secret_encrypted_using_kms(&t).await
        })
        .await;
        t.run("oauth-identity-provider", |t| async move {
            ensure_oauth_identity_provider(&t).await
        })
        .await;
        Ok(())
    });

    env.execute(NAME, &request, &env.options.platform, Some(validate))
        .await
}

/// Bare platform: control plane only, ready from its own conditions
pub async fn none_create_cluster(env: &ScenarioEnv) -> ScenarioRun {
    let request = env.request();

    let validate = validation(|t, g, mgmt, handle| async move {
        let key = &handle.control_plane_key();
        let control_planes = &mgmt.control_planes;
        t.wait_for(
            format!("control plane conditions of {key}"),
            t.timeouts().provision,
            || async move {
                Ok(control_planes.get(key).await?.is_some_and(|hcp| {
                    hcp.has_condition(CONDITION_ETCD_AVAILABLE)
                        && hcp.has_condition(CONDITION_KUBE_APISERVER_AVAILABLE)
                }))
            },
        )
        .await?;

        let pools = mgmt.node_pools.list(Some(handle.namespace.as_str()), None).await?;
        g.expect(
            pools.is_empty(),
            format!("bare cluster has {} node pool(s)", pools.len()),
        );
        Ok(())
    });

    env.execute("none-create-cluster", &request, &Platform::None, Some(validate))
        .await
}

/// Cluster whose egress goes through a proxy; provisioning is the test
pub async fn create_cluster_proxy(env: &ScenarioEnv) -> ScenarioRun {
    const NAME: &str = "create-cluster-proxy";
    let Some(proxy) = env.options.proxy_url.clone() else {
        return ScenarioRun::skipped(NAME, "no proxy URL configured");
    };

    let mut request = env.request();
    request.proxy = Some(proxy);
    request.controller_availability = AvailabilityPolicy::SingleReplica;

    env.execute(NAME, &request, &env.options.platform, None).await
}

/// Private cluster, switched to public and back
pub async fn create_cluster_private(env: &ScenarioEnv) -> ScenarioRun {
    const NAME: &str = "create-cluster-private";
    if !matches!(env.options.platform, Platform::Aws { .. }) {
        return ScenarioRun::skipped(NAME, "endpoint access requires the AWS platform");
    }

    let mut request = env.request();
    request.controller_availability = AvailabilityPolicy::SingleReplica;
    request.endpoint_access = EndpointAccess::Private;

    let validate = validation(|t, _, _, _| async move {
        t.run("switch-from-private-to-public", |t| async move {
            switch_to_public(&t).await
        })
        .await;
        t.run("switch-from-public-to-private", |t| async move {
            switch_to_private(&t).await
        })
        .await;
        Ok(())
    });

    env.execute(NAME, &request, &env.options.platform, Some(validate))
        .await
}

/// Run `scenario` against `env` and cancel it once `deadline` passes.
///
/// Cancellation only ends provisioning and validation; the run is awaited to
/// the end afterwards so teardown still removes whatever was created.
pub async fn run_with_deadline<F, Fut>(
    env: &ScenarioEnv,
    deadline: Duration,
    scenario: F,
) -> ScenarioRun
where
    F: FnOnce(ScenarioEnv) -> Fut,
    Fut: Future<Output = ScenarioRun>,
{
    let cancel = env.cancel.child_token();
    let run = scenario(env.clone().with_cancellation(cancel.clone()));
    tokio::pin!(run);
    tokio::select! {
        run = &mut run => run,
        _ = tokio::time::sleep(deadline) => {
            warn!(deadline_secs = deadline.as_secs(), "Scenario deadline passed, cancelling");
            cancel.cancel();
            run.await
        }
    }
}

/// Run every scenario concurrently
pub async fn run_all(env: &ScenarioEnv) -> Vec<ScenarioRun> {
    let (a, b, c, d, e, f) = tokio::join!(
        create_cluster(env),
        create_cluster_request_serving_isolation(env),
        create_cluster_custom_config(env),
        none_create_cluster(env),
        create_cluster_proxy(env),
        create_cluster_private(env),
    );
    vec![a, b, c, d, e, f]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::PodSpec;
    use kube::api::ObjectMeta;

    use hcp_e2e_common::testing::FakeStore;

    use crate::client::{MockGuestConnector, MockPodExecutor};

    fn env(options: HarnessOptions) -> ScenarioEnv {
        let mgmt = ManagementClient {
            hosted_clusters: Arc::new(FakeStore::new()),
            node_pools: Arc::new(FakeStore::new()),
            control_planes: Arc::new(FakeStore::new()),
            secrets: Arc::new(FakeStore::new()),
            namespaces: Arc::new(FakeStore::new()),
            pods: Arc::new(FakeStore::new()),
            nodes: Arc::new(FakeStore::new()),
            exec: Arc::new(MockPodExecutor::new()),
        };
        let mut connector = MockGuestConnector::new();
        connector.expect_connect().never();
        ScenarioEnv::new(Arc::new(options), mgmt, Arc::new(connector))
    }

    fn options(platform: Platform) -> HarnessOptions {
        HarnessOptions::new(platform, "quay.io/release:4.17", "example.com", b"{}".to_vec())
    }

    fn aws() -> Platform {
        Platform::Aws {
            region: "us-east-1".to_string(),
        }
    }

    fn pod(name: &str, node: &str, serving: bool) -> Pod {
        let labels = serving.then(|| {
            BTreeMap::from([(REQUEST_SERVING_LABEL.to_string(), "true".to_string())])
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: (!node.is_empty()).then(|| node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn placement_check_flags_both_directions() {
        let serving = BTreeSet::from(["rs-1".to_string()]);
        let pods = vec![
            pod("kube-apiserver-0", "rs-1", true),
            pod("kube-apiserver-1", "default-1", true),
            pod("etcd-0", "rs-1", false),
            pod("etcd-1", "default-1", false),
            pod("router-0", "", true),
        ];

        let violations = request_serving_violations(&pods, &serving);
        assert_eq!(violations.len(), 2, "{violations:?}");
        assert!(violations[0].contains("kube-apiserver-1"));
        assert!(violations[1].contains("etcd-0"));
    }

    fn with_zones(platform: Platform, zones: &[&str]) -> ScenarioEnv {
        let mut opts = options(platform);
        opts.zones = zones.iter().map(|z| z.to_string()).collect();
        env(opts)
    }

    #[test]
    fn single_zone_requests_nothing_that_needs_downgrading() {
        let env = with_zones(aws(), &["us-east-1a"]);

        let request = create_cluster_request(&env);
        assert_eq!(request.infrastructure_availability, AvailabilityPolicy::SingleReplica);
        assert_eq!(request.node_pool_replicas, env.options.node_pool_replicas);
        assert!(request.resolve_topology(&aws()).1.is_empty());

        let request = request_serving_request(&env);
        assert_eq!(request.controller_availability, AvailabilityPolicy::HighlyAvailable);
        assert_eq!(request.request_serving, RequestServing::Shared);
        assert!(request.annotations.contains_key(TOPOLOGY_ANNOTATION));
        assert!(request.resolve_topology(&aws()).1.is_empty());
    }

    #[test]
    fn three_zones_request_one_worker_per_zone() {
        let env = with_zones(aws(), &["us-east-1a", "us-east-1b", "us-east-1c"]);

        let request = create_cluster_request(&env);
        assert_eq!(request.infrastructure_availability, AvailabilityPolicy::HighlyAvailable);
        assert_eq!(request.node_pool_replicas, 1);

        let request = request_serving_request(&env);
        assert_eq!(request.request_serving, RequestServing::Dedicated);
        assert_eq!(request.node_pool_replicas, 1);
    }

    #[tokio::test]
    async fn request_serving_isolation_needs_opt_in() {
        let run = create_cluster_request_serving_isolation(&env(options(aws()))).await;
        assert!(run.is_skipped());
        assert!(run.into_result().is_ok());
    }

    #[tokio::test]
    async fn request_serving_isolation_needs_aws() {
        let mut opts = options(Platform::None);
        opts.request_serving_isolation = true;
        let run = create_cluster_request_serving_isolation(&env(opts)).await;
        assert!(matches!(run, ScenarioRun::Skipped { ref reason, .. } if reason.contains("AWS")));
    }

    #[tokio::test]
    async fn custom_config_without_kms_is_skipped() {
        let run = create_cluster_custom_config(&env(options(aws()))).await;
        assert!(matches!(run, ScenarioRun::Skipped { ref reason, .. } if reason.contains("KMS")));
    }

    #[tokio::test]
    async fn proxy_without_url_is_skipped() {
        assert!(create_cluster_proxy(&env(options(aws()))).await.is_skipped());
    }

    #[tokio::test]
    async fn private_cluster_needs_aws() {
        let run = create_cluster_private(&env(options(Platform::None))).await;
        assert!(run.is_skipped());
        assert!(run.outcome().is_none());
    }
}
