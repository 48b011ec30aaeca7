//! Checks run against a ready cluster
//!
//! The pure helpers ([`crashing_pods`], [`pods_off_control_plane_nodes`])
//! turn pod lists into violation messages. The `ensure_*` functions act on a
//! live cluster and fail the calling step when the cluster does not behave.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec, Secret, SecurityContext};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use hcp_e2e_common::crd::{HostedCluster, HtpasswdProvider, IdentityProvider, SecretReference};
use hcp_e2e_common::kube_utils::CONDITION_AVAILABLE;
use hcp_e2e_common::object::ObjectKey;
use hcp_e2e_common::{Error, Result};

use crate::client::GuestClient;
use crate::context::StepContext;
use crate::mutate::update_object;

/// Waiting reason of a container the kubelet keeps restarting
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// Guest namespace the pod security admission check creates its pod in
pub const PSA_CHECK_NAMESPACE: &str = "e2e-psa-check";

/// Etcd member queried for raw values
pub const ETCD_POD: &str = "etcd-0";
const ETCD_CONTAINER: &str = "etcd";

/// Prefix etcd stores KMS-encrypted values under
pub const KMS_ENCRYPTION_PREFIX: &[u8] = b"k8s:enc:kms:v1:";

/// Identity provider added by [`ensure_oauth_identity_provider`]
pub const E2E_IDENTITY_PROVIDER: &str = "e2e-htpasswd";

/// `htpasswd` entry for `e2e-user` (SHA1 of `e2e-oauth-password`)
const HTPASSWD_ENTRY: &str = "e2e-user:{SHA}ANsWzGf6vHrvkcTxilNyqtmjLSU=";

/// Pods crash looping or restarted more than `max_restarts` times
pub fn crashing_pods(pods: &[Pod], max_restarts: i32) -> Vec<String> {
    let mut crashing = Vec::new();
    for pod in pods {
        let statuses = pod
            .status
            .iter()
            .flat_map(|s| s.container_statuses.iter().flatten());
        for status in statuses {
            let waiting_reason = status
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref());
            if waiting_reason == Some(CRASH_LOOP_BACK_OFF) {
                crashing.push(format!(
                    "container {} of pod {} is in {CRASH_LOOP_BACK_OFF}",
                    status.name,
                    pod.name_any()
                ));
            } else if status.restart_count > max_restarts {
                crashing.push(format!(
                    "container {} of pod {} restarted {} times (limit {max_restarts})",
                    status.name,
                    pod.name_any(),
                    status.restart_count
                ));
            }
        }
    }
    crashing
}

/// Scheduled pods running outside the dedicated control plane nodes
pub fn pods_off_control_plane_nodes(
    pods: &[Pod],
    control_plane_nodes: &BTreeSet<String>,
) -> Vec<String> {
    pods.iter()
        .filter_map(|pod| {
            let node = pod.spec.as_ref()?.node_name.as_deref()?;
            (!control_plane_nodes.contains(node))
                .then(|| format!("pod {} runs on non-control-plane node {node}", pod.name_any()))
        })
        .collect()
}

fn privileged_pod() -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("privileged-pod".to_string()),
            namespace: Some(PSA_CHECK_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "busybox".to_string(),
                image: Some("busybox".to_string()),
                command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Check that pod security admission refuses privileged pods in the guest.
///
/// A privileged pod that gets admitted is removed again before the failure
/// is reported.
pub async fn ensure_psa_not_privileged(guest: &GuestClient) -> Result<()> {
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(PSA_CHECK_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match guest.namespaces.create(&namespace).await {
        Ok(_) => {}
        Err(e) if e.is_conflict() => debug!(namespace = PSA_CHECK_NAMESPACE, "Namespace exists"),
        Err(e) => return Err(e),
    }

    let pod = privileged_pod();
    match guest.pods.create(&pod).await {
        Err(e) if e.is_forbidden() => {
            info!(error = %e, "Privileged pod rejected by admission");
            Ok(())
        }
        Err(e) => Err(e),
        Ok(_) => {
            let key = ObjectKey::of(&pod);
            if let Err(e) = guest.pods.delete(&key).await {
                warn!(pod = %key, error = %e, "Failed to remove admitted privileged pod");
            }
            Err(Error::assertion(format!(
                "privileged pod {key} was admitted; pod security admission is not enforced"
            )))
        }
    }
}

fn etcdctl_get(key: &str) -> Vec<String> {
    [
        "/usr/bin/etcdctl",
        "--endpoints=localhost:2379",
        "--cacert=/etc/etcd/tls/etcd-ca/ca.crt",
        "--cert=/etc/etcd/tls/client/etcd-client.crt",
        "--key=/etc/etcd/tls/client/etcd-client.key",
        "get",
        key,
        "--print-value-only",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Check that secrets written through the guest API land KMS-encrypted in
/// etcd.
///
/// Writes a throwaway secret, reads its raw etcd value from inside the etcd
/// pod and removes the secret again whatever the outcome.
pub async fn ensure_secret_encrypted_using_kms(t: &StepContext) -> Result<()> {
    let guest = t.guest_client().await?;
    let handle = t.handle();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(format!("{}-kms-check", handle.name)),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "value".to_string(),
            ByteString(b"encrypted at rest".to_vec()),
        )])),
        ..Default::default()
    };
    let key = ObjectKey::of(&secret);
    guest.secrets.create(&secret).await?;

    let etcd = ObjectKey::namespaced(handle.control_plane_namespace(), ETCD_POD);
    let etcd_key = format!("/kubernetes.io/secrets/{}/{}", key.namespace, key.name);
    let raw = t
        .management()
        .exec
        .exec(&etcd, ETCD_CONTAINER, etcdctl_get(&etcd_key))
        .await;

    if let Err(e) = guest.secrets.delete(&key).await {
        warn!(secret = %key, error = %e, "Failed to remove KMS check secret");
    }

    let raw = raw?;
    let prefix = KMS_ENCRYPTION_PREFIX;
    if !raw.windows(prefix.len()).any(|w| w == prefix) {
        return Err(Error::assertion(format!(
            "secret {key} is not stored KMS-encrypted in etcd (no {} prefix)",
            String::from_utf8_lossy(prefix)
        )));
    }
    info!(secret = %key, "Secret stored KMS-encrypted");
    Ok(())
}

/// Add an HTPasswd identity provider to the cluster and wait for the control
/// plane to pick it up.
pub async fn ensure_oauth_identity_provider(t: &StepContext) -> Result<()> {
    let handle = t.handle();
    let mgmt = t.management();

    let secret_name = format!("{}-htpasswd", handle.name);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(handle.namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "htpasswd".to_string(),
            ByteString(HTPASSWD_ENTRY.as_bytes().to_vec()),
        )])),
        ..Default::default()
    };
    match mgmt.secrets.create(&secret).await {
        Ok(_) => {}
        Err(e) if e.is_conflict() => debug!(secret = %secret_name, "htpasswd secret exists"),
        Err(e) => return Err(e),
    }

    let hc = t.hosted_cluster().await?;
    let provider = IdentityProvider {
        name: E2E_IDENTITY_PROVIDER.to_string(),
        mapping_method: Some("claim".to_string()),
        type_: "HTPasswd".to_string(),
        htpasswd: Some(HtpasswdProvider {
            file_data: SecretReference::new(&secret_name),
            ..Default::default()
        }),
        ..Default::default()
    };
    let clusters = &mgmt.hosted_clusters;
    let add_provider = |hc: &mut HostedCluster| {
        let oauth = hc
            .spec
            .configuration
            .get_or_insert_with(Default::default)
            .oauth
            .get_or_insert_with(Default::default);
        if !oauth.identity_providers.iter().any(|p| p.name == provider.name) {
            oauth.identity_providers.push(provider.clone());
        }
    };
    let updated = update_object(t.cancel_token(), clusters.as_ref(), &hc, add_provider).await?;
    let generation = updated.metadata.generation.ok_or_else(|| {
        Error::internal_with_context("oauth", format!("HostedCluster {handle} has no generation"))
    })?;
    info!(cluster = %handle, generation, "Identity provider added");

    let key = &handle.key();
    t.wait_for(
        format!("HostedCluster {key} to be Available at generation {generation}"),
        t.timeouts().provision,
        || async move {
            Ok(clusters
                .get(key)
                .await?
                .is_some_and(|hc| hc.condition_holds_for(CONDITION_AVAILABLE, generation)))
        },
    )
    .await?;

    let hcp_key = &handle.control_plane_key();
    let control_planes = &mgmt.control_planes;
    let elapsed = t
        .wait_for(
            format!("{E2E_IDENTITY_PROVIDER} on HostedControlPlane {hcp_key}"),
            t.timeouts().provision,
            || async move {
                Ok(control_planes.get(hcp_key).await?.is_some_and(|hcp| {
                    hcp.identity_provider_names()
                        .iter()
                        .any(|n| n == E2E_IDENTITY_PROVIDER)
                }))
            },
        )
        .await?;
    info!(elapsed_ms = elapsed.as_millis() as u64, "Identity provider rolled out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };
    use tokio_util::sync::CancellationToken;

    use hcp_e2e_common::crd::{
        Condition, HostedClusterSpec, HostedClusterStatus, HostedControlPlane,
        HostedControlPlaneSpec,
    };
    use hcp_e2e_common::object::ObjectClient;
    use hcp_e2e_common::testing::FakeStore;
    use hcp_e2e_common::KUBECONFIG_SECRET_KEY;

    use crate::client::{
        ManagementClient, MockGuestConnector, MockIdentityReviewer, MockPodExecutor,
    };
    use crate::config::HarnessTimeouts;
    use crate::request::ClusterHandle;

    fn pod_with(name: &str, node: Option<&str>, restarts: i32, waiting: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "main".to_string(),
                    restart_count: restarts,
                    state: waiting.map(|reason| ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn crash_loops_and_restart_storms_are_reported() {
        let pods = vec![
            pod_with("etcd-0", None, 0, None),
            pod_with("kube-apiserver-0", None, 1, Some(CRASH_LOOP_BACK_OFF)),
            pod_with("router-0", None, 4, None),
            pod_with("oauth-0", None, 3, Some("ContainerCreating")),
        ];
        let crashing = crashing_pods(&pods, 3);
        assert_eq!(crashing.len(), 2, "{crashing:?}");
        assert!(crashing[0].contains("kube-apiserver-0"));
        assert!(crashing[1].contains("router-0") && crashing[1].contains("4 times"));
    }

    #[test]
    fn pods_on_default_nodes_are_reported() {
        let control_plane = BTreeSet::from(["cp-1".to_string()]);
        let pods = vec![
            pod_with("etcd-0", Some("cp-1"), 0, None),
            pod_with("etcd-1", Some("worker-1"), 0, None),
            pod_with("pending-0", None, 0, None),
        ];
        let off = pods_off_control_plane_nodes(&pods, &control_plane);
        assert_eq!(off, vec!["pod etcd-1 runs on non-control-plane node worker-1"]);
    }

    /// Pod store behind an admission webhook that may refuse privileged pods
    struct Admission {
        refuses: bool,
        pods: FakeStore<Pod>,
    }

    #[async_trait]
    impl ObjectClient<Pod> for Admission {
        async fn get(&self, key: &ObjectKey) -> Result<Option<Pod>> {
            self.pods.get(key).await
        }
        async fn list(&self, ns: Option<&str>, sel: Option<&str>) -> Result<Vec<Pod>> {
            self.pods.list(ns, sel).await
        }
        async fn create(&self, pod: &Pod) -> Result<Pod> {
            if self.refuses {
                return Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "violates PodSecurity \"restricted:latest\"".to_string(),
                    reason: "Forbidden".to_string(),
                    code: 403,
                })));
            }
            self.pods.create(pod).await
        }
        async fn replace(&self, pod: &Pod) -> Result<Pod> {
            self.pods.replace(pod).await
        }
        async fn delete(&self, key: &ObjectKey) -> Result<()> {
            self.pods.delete(key).await
        }
    }

    fn guest(pods: Arc<Admission>) -> GuestClient {
        GuestClient {
            nodes: Arc::new(FakeStore::new()),
            pods,
            namespaces: Arc::new(FakeStore::new()),
            secrets: Arc::new(FakeStore::new()),
            identity: Arc::new(MockIdentityReviewer::new()),
        }
    }

    #[tokio::test]
    async fn refused_privileged_pod_passes() {
        let pods = Arc::new(Admission {
            refuses: true,
            pods: FakeStore::new(),
        });
        ensure_psa_not_privileged(&guest(pods.clone())).await.unwrap();
        assert!(pods.pods.creates().is_empty());
    }

    #[tokio::test]
    async fn admitted_privileged_pod_fails_and_is_removed() {
        let pods = Arc::new(Admission {
            refuses: false,
            pods: FakeStore::new(),
        });
        let err = ensure_psa_not_privileged(&guest(pods.clone())).await.unwrap_err();
        assert!(matches!(err, Error::Assertion { .. }), "{err}");
        assert_eq!(pods.pods.deletes().len(), 1);
        assert!(pods.pods.keys().is_empty());
    }

    struct Cluster {
        t: StepContext,
        clusters: Arc<FakeStore<HostedCluster>>,
        control_planes: Arc<FakeStore<HostedControlPlane>>,
        guest_secrets: Arc<FakeStore<Secret>>,
    }

    fn cluster(exec: MockPodExecutor) -> Cluster {
        let handle = ClusterHandle::new("e2e-clusters-abc", "custom");
        let clusters = Arc::new(FakeStore::new());
        let mut hc = HostedCluster::new(&handle.name, HostedClusterSpec::default());
        hc.metadata.namespace = Some(handle.namespace.clone());
        hc.status = Some(HostedClusterStatus {
            conditions: vec![Condition::truthy(CONDITION_AVAILABLE).observed(1)],
            kubeconfig: Some(SecretReference::new("admin-kubeconfig")),
            ..Default::default()
        });
        clusters.insert(hc);

        let control_planes = Arc::new(FakeStore::new());
        let mut hcp = HostedControlPlane::new(&handle.name, HostedControlPlaneSpec::default());
        hcp.metadata.namespace = Some(handle.control_plane_namespace());
        control_planes.insert(hcp);

        let secrets = Arc::new(FakeStore::new());
        secrets.insert(Secret {
            metadata: ObjectMeta {
                name: Some("admin-kubeconfig".to_string()),
                namespace: Some(handle.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                KUBECONFIG_SECRET_KEY.to_string(),
                ByteString(b"apiVersion: v1".to_vec()),
            )])),
            ..Default::default()
        });

        let guest_secrets = Arc::new(FakeStore::new());
        let guest = GuestClient {
            secrets: guest_secrets.clone(),
            ..guest(Arc::new(Admission {
                refuses: true,
                pods: FakeStore::new(),
            }))
        };
        let mut connector = MockGuestConnector::new();
        connector
            .expect_connect()
            .returning(move |_, _| Ok(guest.clone()));

        let mgmt = ManagementClient {
            hosted_clusters: clusters.clone(),
            node_pools: Arc::new(FakeStore::new()),
            control_planes: control_planes.clone(),
            secrets,
            namespaces: Arc::new(FakeStore::new()),
            pods: Arc::new(FakeStore::new()),
            nodes: Arc::new(FakeStore::new()),
            exec: Arc::new(exec),
        };
        let t = StepContext::new(
            "create-cluster-custom-config",
            CancellationToken::new(),
            mgmt,
            Arc::new(connector),
            handle,
            HarnessTimeouts::default(),
        );
        Cluster {
            t,
            clusters,
            control_planes,
            guest_secrets,
        }
    }

    #[tokio::test]
    async fn kms_prefixed_value_passes_and_secret_is_removed() {
        let mut exec = MockPodExecutor::new();
        exec.expect_exec()
            .withf(|pod, container, command| {
                pod.name == ETCD_POD
                    && pod.namespace == "e2e-clusters-abc-custom"
                    && container == "etcd"
                    && command.contains(&"/kubernetes.io/secrets/default/custom-kms-check".into())
            })
            .times(1)
            .returning(|_, _, _| Ok(b"\x00k8s:enc:kms:v1:aws:\x12\x34".to_vec()));
        let c = cluster(exec);

        ensure_secret_encrypted_using_kms(&c.t).await.unwrap();
        assert_eq!(c.guest_secrets.creates().len(), 1);
        assert!(c.guest_secrets.keys().is_empty());
    }

    #[tokio::test]
    async fn plaintext_value_is_an_assertion_failure() {
        let mut exec = MockPodExecutor::new();
        exec.expect_exec()
            .returning(|_, _, _| Ok(b"k8s:enc:aescbc:v1:key1:...".to_vec()));
        let c = cluster(exec);

        let err = ensure_secret_encrypted_using_kms(&c.t).await.unwrap_err();
        assert!(matches!(err, Error::Assertion { .. }), "{err}");
        assert!(c.guest_secrets.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn identity_provider_waits_for_the_control_plane() {
        let c = cluster(MockPodExecutor::new());
        let hc_key = c.t.handle().key();
        let hcp_key = c.t.handle().control_plane_key();

        // Operator: acknowledge the new generation, then propagate the
        // providers to the control plane a little later.
        let operator = {
            let (clusters, control_planes) = (c.clusters.clone(), c.control_planes.clone());
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    let Some(hc) = clusters.snapshot(&hc_key) else { return };
                    let generation = hc.metadata.generation.unwrap_or_default();
                    if generation < 2 {
                        continue;
                    }
                    clusters.modify(&hc_key, |hc| {
                        if let Some(status) = hc.status.as_mut() {
                            status.conditions =
                                vec![Condition::truthy(CONDITION_AVAILABLE).observed(generation)];
                        }
                    });
                    tokio::time::sleep(std::time::Duration::from_secs(20)).await;
                    let configuration = serde_json::to_value(&hc.spec.configuration).unwrap();
                    control_planes.modify(&hcp_key, |hcp| {
                        hcp.spec.extra.insert("configuration".to_string(), configuration);
                    });
                    return;
                }
            })
        };

        ensure_oauth_identity_provider(&c.t).await.unwrap();
        operator.await.unwrap();

        let hc = c.clusters.snapshot(&c.t.handle().key()).unwrap();
        let providers = &hc.spec.configuration.unwrap().oauth.unwrap().identity_providers;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].htpasswd.as_ref().unwrap().file_data.name, "custom-htpasswd");
        assert_eq!(hc.metadata.generation, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn identity_provider_times_out_without_the_operator() {
        let c = cluster(MockPodExecutor::new());
        let err = ensure_oauth_identity_provider(&c.t).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }
}
