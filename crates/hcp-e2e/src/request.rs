//! Cluster requests and handles
//!
//! A [`ClusterRequest`] describes the cluster a scenario wants. Before
//! submission it is resolved against the available zones (see
//! [`ClusterRequest::resolve_topology`]) and rendered into the objects the
//! management cluster receives.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use rand::Rng;
use tracing::{debug, warn};

use hcp_e2e_common::crd::{
    AvailabilityPolicy, AwsKmsAuthSpec, AwsKmsKeyEntry, AwsKmsSpec, AwsPlatformSpec,
    ClusterConfiguration, DnsSpec, EndpointAccess, HostedCluster, HostedClusterSpec, KmsSpec,
    NodePool, NodePoolManagement, NodePoolPlatform, NodePoolSpec, PlatformSpec, PlatformType,
    ProxySpec, Release, SecretEncryptionSpec, SecretReference,
};
use hcp_e2e_common::object::ObjectKey;
use hcp_e2e_common::{
    CONTROL_PLANE_NODE_LABEL, DEDICATED_REQUEST_SERVING_TOPOLOGY, TOPOLOGY_ANNOTATION, ZONE_LABEL,
};

use crate::config::HarnessOptions;

/// Zones needed for highly available infrastructure or dedicated request serving
pub const MIN_HA_ZONES: usize = 3;

/// Label marking namespaces created by this harness
pub const E2E_NAMESPACE_LABEL: &str = "hypershift.openshift.io/e2e";

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 6;

/// Infrastructure a cluster is provisioned on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Platform {
    /// Workers in an isolated AWS account
    Aws {
        /// AWS region
        region: String,
    },
    /// Control plane only; no infrastructure and no workers
    None,
}

impl Platform {
    /// Platform type written to the HostedCluster
    pub fn platform_type(&self) -> PlatformType {
        match self {
            Self::Aws { .. } => PlatformType::Aws,
            Self::None => PlatformType::None,
        }
    }

    /// Whether this is the bare platform
    pub fn is_bare(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.platform_type())
    }
}

/// Where request-serving control plane components run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestServing {
    /// Alongside every other control plane component
    #[default]
    Shared,
    /// On nodes reserved for request serving
    Dedicated,
}

/// KMS encryption of secrets at rest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KmsEncryption {
    /// ARN of the active key
    pub key_arn: String,
    /// Role the control plane assumes to use the key
    pub role_arn: String,
}

/// Description of the cluster a scenario wants
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRequest {
    /// Prefix of the generated cluster name
    pub name_prefix: String,
    /// Release image
    pub release_image: String,
    /// Base DNS domain
    pub base_domain: String,
    /// Replica policy of control plane components
    pub controller_availability: AvailabilityPolicy,
    /// Replica policy of guest infrastructure components
    pub infrastructure_availability: AvailabilityPolicy,
    /// Placement of request-serving components
    pub request_serving: RequestServing,
    /// Availability zones; one node pool per zone
    pub zones: Vec<String>,
    /// Replicas per node pool
    pub node_pool_replicas: i32,
    /// KMS secret encryption
    pub encryption: Option<KmsEncryption>,
    /// Extra annotations on the HostedCluster
    pub annotations: BTreeMap<String, String>,
    /// API endpoint exposure
    pub endpoint_access: EndpointAccess,
    /// Egress proxy URL
    pub proxy: Option<String>,
}

impl ClusterRequest {
    /// Request with the process-wide defaults from `options`
    pub fn from_options(options: &HarnessOptions) -> Self {
        Self {
            name_prefix: options.cluster_prefix.clone(),
            release_image: options.release_image.clone(),
            base_domain: options.base_domain.clone(),
            controller_availability: AvailabilityPolicy::SingleReplica,
            infrastructure_availability: AvailabilityPolicy::SingleReplica,
            request_serving: RequestServing::Shared,
            zones: options.zones.clone(),
            node_pool_replicas: options.node_pool_replicas,
            encryption: None,
            annotations: BTreeMap::new(),
            endpoint_access: EndpointAccess::Public,
            proxy: None,
        }
    }

    /// Adjust the request to what the platform and zones can deliver.
    ///
    /// Highly available infrastructure and dedicated request serving both
    /// need [`MIN_HA_ZONES`] zones; with fewer they fall back to single
    /// replica and shared placement. Every fallback is logged and returned.
    /// The bare platform gets no workers.
    pub fn resolve_topology(
        &self,
        platform: &Platform,
    ) -> (ClusterRequest, Vec<TopologyDowngrade>) {
        let mut resolved = self.clone();
        let mut downgrades = Vec::new();
        let zones = self.zones.len();

        if resolved.infrastructure_availability == AvailabilityPolicy::HighlyAvailable
            && zones < MIN_HA_ZONES
        {
            resolved.infrastructure_availability = AvailabilityPolicy::SingleReplica;
            downgrades.push(TopologyDowngrade {
                setting: "infrastructureAvailabilityPolicy",
                requested: AvailabilityPolicy::HighlyAvailable.to_string(),
                granted: AvailabilityPolicy::SingleReplica.to_string(),
                reason: format!("{zones} zone(s) available, {MIN_HA_ZONES} required"),
            });
        }

        if resolved.request_serving == RequestServing::Dedicated && zones < MIN_HA_ZONES {
            resolved.request_serving = RequestServing::Shared;
            downgrades.push(TopologyDowngrade {
                setting: "requestServing",
                requested: "Dedicated".to_string(),
                granted: "Shared".to_string(),
                reason: format!("{zones} zone(s) available, {MIN_HA_ZONES} required"),
            });
        }

        for downgrade in &downgrades {
            warn!(
                prefix = %self.name_prefix,
                setting = downgrade.setting,
                requested = %downgrade.requested,
                granted = %downgrade.granted,
                reason = %downgrade.reason,
                "Downgrading requested topology"
            );
        }

        if platform.is_bare() && resolved.node_pool_replicas != 0 {
            debug!(
                prefix = %self.name_prefix,
                "Bare platform has no workers; node pool replicas set to 0"
            );
            resolved.node_pool_replicas = 0;
        }

        (resolved, downgrades)
    }

    /// Build every object submitted for this request
    pub fn render(
        &self,
        handle: &ClusterHandle,
        platform: &Platform,
        signing_key: Option<&[u8]>,
        pull_secret: &[u8],
    ) -> RenderedCluster {
        let pull_secret_name = format!("{}-pull-secret", handle.name);
        let signing_key_name = format!("{}-signing-key", handle.name);

        let mut annotations = self.annotations.clone();
        let mut node_selector = None;
        if self.request_serving == RequestServing::Dedicated {
            annotations.insert(
                TOPOLOGY_ANNOTATION.to_string(),
                DEDICATED_REQUEST_SERVING_TOPOLOGY.to_string(),
            );
            node_selector = Some(BTreeMap::from([(
                CONTROL_PLANE_NODE_LABEL.to_string(),
                "true".to_string(),
            )]));
        }

        let aws = match platform {
            Platform::Aws { region } => Some(AwsPlatformSpec {
                region: region.clone(),
                endpoint_access: self.endpoint_access.clone(),
                extra: BTreeMap::new(),
            }),
            Platform::None => None,
        };

        let secret_encryption = self.encryption.as_ref().map(|kms| SecretEncryptionSpec {
            type_: "kms".to_string(),
            kms: Some(KmsSpec {
                provider: "AWS".to_string(),
                aws: Some(AwsKmsSpec {
                    region: match platform {
                        Platform::Aws { region } => region.clone(),
                        Platform::None => String::new(),
                    },
                    active_key: AwsKmsKeyEntry {
                        arn: kms.key_arn.clone(),
                        ..Default::default()
                    },
                    auth: AwsKmsAuthSpec {
                        aws_kms_role_arn: kms.role_arn.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        let configuration = self.proxy.as_ref().map(|url| ClusterConfiguration {
            proxy: Some(ProxySpec {
                http_proxy: Some(url.clone()),
                https_proxy: Some(url.clone()),
                no_proxy: None,
                ..Default::default()
            }),
            ..Default::default()
        });

        let mut hosted_cluster = HostedCluster::new(
            &handle.name,
            HostedClusterSpec {
                release: Release::new(&self.release_image),
                platform: PlatformSpec {
                    type_: platform.platform_type(),
                    aws,
                    extra: BTreeMap::new(),
                },
                dns: Some(DnsSpec {
                    base_domain: self.base_domain.clone(),
                    ..Default::default()
                }),
                controller_availability_policy: Some(self.controller_availability.clone()),
                infrastructure_availability_policy: Some(self.infrastructure_availability.clone()),
                pull_secret: Some(SecretReference::new(&pull_secret_name)),
                service_account_signing_key: signing_key
                    .map(|_| SecretReference::new(&signing_key_name)),
                secret_encryption,
                configuration,
                node_selector,
                extra: BTreeMap::new(),
            },
        );
        hosted_cluster.metadata.namespace = Some(handle.namespace.clone());
        if !annotations.is_empty() {
            hosted_cluster.metadata.annotations = Some(annotations);
        }

        let node_pools = if platform.is_bare() || self.node_pool_replicas == 0 {
            Vec::new()
        } else if self.zones.is_empty() {
            vec![self.node_pool(handle, platform, handle.name.clone(), None)]
        } else {
            self.zones
                .iter()
                .map(|zone| {
                    self.node_pool(handle, platform, format!("{}-{zone}", handle.name), Some(zone))
                })
                .collect()
        };

        RenderedCluster {
            namespace: Namespace {
                metadata: ObjectMeta {
                    name: Some(handle.namespace.clone()),
                    labels: Some(BTreeMap::from([(
                        E2E_NAMESPACE_LABEL.to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            },
            pull_secret: secret(
                handle,
                &pull_secret_name,
                ".dockerconfigjson",
                pull_secret,
                Some("kubernetes.io/dockerconfigjson"),
            ),
            signing_key: signing_key
                .map(|key| secret(handle, &signing_key_name, "key", key, None)),
            hosted_cluster,
            node_pools,
        }
    }

    fn node_pool(
        &self,
        handle: &ClusterHandle,
        platform: &Platform,
        name: String,
        zone: Option<&String>,
    ) -> NodePool {
        let mut extra = BTreeMap::new();
        if let Some(zone) = zone {
            let labels = serde_json::Map::from_iter([(
                ZONE_LABEL.to_string(),
                serde_json::Value::String(zone.clone()),
            )]);
            extra.insert("nodeLabels".to_string(), serde_json::Value::Object(labels));
        }
        let mut pool = NodePool::new(
            &name,
            NodePoolSpec {
                cluster_name: handle.name.clone(),
                replicas: Some(self.node_pool_replicas),
                release: Release::new(&self.release_image),
                platform: NodePoolPlatform {
                    type_: platform.platform_type(),
                    extra: BTreeMap::new(),
                },
                management: NodePoolManagement::default(),
                extra,
            },
        );
        pool.metadata.namespace = Some(handle.namespace.clone());
        pool
    }
}

fn secret(
    handle: &ClusterHandle,
    name: &str,
    key: &str,
    value: &[u8],
    type_: Option<&str>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(handle.namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(key.to_string(), ByteString(value.to_vec()))])),
        type_: type_.map(String::from),
        ..Default::default()
    }
}

/// Objects submitted to the management cluster for one request
#[derive(Clone, Debug)]
pub struct RenderedCluster {
    /// Namespace holding every other object
    pub namespace: Namespace,
    /// Pull secret referenced by the HostedCluster
    pub pull_secret: Secret,
    /// Service account signing key, when one is configured
    pub signing_key: Option<Secret>,
    /// The HostedCluster itself
    pub hosted_cluster: HostedCluster,
    /// Worker pools, created after the HostedCluster
    pub node_pools: Vec<NodePool>,
}

impl RenderedCluster {
    /// Number of worker nodes the node pools ask for
    pub fn expected_nodes(&self) -> usize {
        self.node_pools
            .iter()
            .map(|p| p.spec.replicas.unwrap_or(0).max(0) as usize)
            .sum()
    }
}

/// A setting that was weakened to fit the available infrastructure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyDowngrade {
    /// Setting that changed
    pub setting: &'static str,
    /// Requested value
    pub requested: String,
    /// Value actually used
    pub granted: String,
    /// Why the request could not be met
    pub reason: String,
}

impl fmt::Display for TopologyDowngrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} -> {} ({})",
            self.setting, self.requested, self.granted, self.reason
        )
    }
}

/// Identity of the cluster provisioned for one scenario
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterHandle {
    /// Management namespace holding the HostedCluster
    pub namespace: String,
    /// HostedCluster name
    pub name: String,
}

impl ClusterHandle {
    /// Handle for an existing cluster
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Fresh handle with a random suffix shared by name and namespace
    pub fn generate(prefix: &str) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
            .collect();
        Self {
            namespace: format!("e2e-clusters-{suffix}"),
            name: format!("{prefix}-{suffix}"),
        }
    }

    /// Namespace the operator runs this cluster's control plane in
    pub fn control_plane_namespace(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }

    /// Key of the HostedCluster object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.namespace, &self.name)
    }

    /// Key of the HostedControlPlane object
    pub fn control_plane_key(&self) -> ObjectKey {
        ObjectKey::namespaced(self.control_plane_namespace(), &self.name)
    }
}

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aws() -> Platform {
        Platform::Aws {
            region: "us-east-1".to_string(),
        }
    }

    fn request(zones: &[&str]) -> ClusterRequest {
        let mut options = HarnessOptions::new(
            aws(),
            "quay.io/release:4.17",
            "ci.example.com",
            b"{}".to_vec(),
        );
        options.zones = zones.iter().map(|z| z.to_string()).collect();
        ClusterRequest::from_options(&options)
    }

    #[test]
    fn generated_handles_are_unique_and_well_formed() {
        let a = ClusterHandle::generate("create");
        let b = ClusterHandle::generate("create");
        assert_ne!(a, b);

        let suffix = a.name.strip_prefix("create-").unwrap();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(a.namespace, format!("e2e-clusters-{suffix}"));
        assert_eq!(
            a.control_plane_namespace(),
            format!("e2e-clusters-{suffix}-create-{suffix}")
        );
    }

    #[test]
    fn ha_with_two_zones_is_downgraded() {
        let mut req = request(&["a", "b"]);
        req.infrastructure_availability = AvailabilityPolicy::HighlyAvailable;
        req.controller_availability = AvailabilityPolicy::HighlyAvailable;

        let (resolved, downgrades) = req.resolve_topology(&aws());
        assert_eq!(
            resolved.infrastructure_availability,
            AvailabilityPolicy::SingleReplica
        );
        assert_eq!(
            resolved.controller_availability,
            AvailabilityPolicy::HighlyAvailable
        );
        assert_eq!(downgrades.len(), 1);
        assert_eq!(downgrades[0].setting, "infrastructureAvailabilityPolicy");
        // the original request is untouched
        assert_eq!(
            req.infrastructure_availability,
            AvailabilityPolicy::HighlyAvailable
        );
    }

    #[test]
    fn ha_with_three_zones_is_kept() {
        let mut req = request(&["a", "b", "c"]);
        req.infrastructure_availability = AvailabilityPolicy::HighlyAvailable;
        req.request_serving = RequestServing::Dedicated;

        let (resolved, downgrades) = req.resolve_topology(&aws());
        assert!(downgrades.is_empty());
        assert_eq!(resolved, req);
    }

    #[test]
    fn dedicated_request_serving_needs_zones() {
        let mut req = request(&["a"]);
        req.request_serving = RequestServing::Dedicated;

        let (resolved, downgrades) = req.resolve_topology(&aws());
        assert_eq!(resolved.request_serving, RequestServing::Shared);
        assert_eq!(downgrades[0].setting, "requestServing");

        let rendered = resolved.render(&ClusterHandle::new("ns", "c"), &aws(), None, b"{}");
        assert!(rendered.hosted_cluster.spec.node_selector.is_none());
        assert!(rendered.hosted_cluster.metadata.annotations.is_none());
    }

    #[test]
    fn bare_platform_has_no_workers() {
        let req = request(&["a", "b", "c"]);
        let (resolved, downgrades) = req.resolve_topology(&Platform::None);
        assert!(downgrades.is_empty());
        assert_eq!(resolved.node_pool_replicas, 0);

        let handle = ClusterHandle::new("ns", "c");
        let rendered = resolved.render(&handle, &Platform::None, None, b"{}");
        assert!(rendered.node_pools.is_empty());
        assert_eq!(rendered.hosted_cluster.spec.platform.type_, PlatformType::None);
        assert!(rendered.hosted_cluster.spec.platform.aws.is_none());
    }

    #[test]
    fn render_full_request() {
        let mut req = request(&["us-east-1a", "us-east-1b", "us-east-1c"]);
        req.node_pool_replicas = 1;
        req.request_serving = RequestServing::Dedicated;
        req.endpoint_access = EndpointAccess::Private;
        req.proxy = Some("http://proxy:3128".to_string());
        req.encryption = Some(KmsEncryption {
            key_arn: "arn:aws:kms:key".to_string(),
            role_arn: "arn:aws:iam::role/kms".to_string(),
        });
        let handle = ClusterHandle::new("e2e-clusters-abc123", "create-abc123");

        let rendered = req.render(&handle, &aws(), Some(b"signing-key"), b"{\"auths\":{}}");
        let hc = &rendered.hosted_cluster;

        assert_eq!(hc.metadata.namespace.as_deref(), Some("e2e-clusters-abc123"));
        assert_eq!(hc.endpoint_access(), EndpointAccess::Private);
        assert_eq!(
            hc.metadata.annotations.as_ref().unwrap()[TOPOLOGY_ANNOTATION],
            DEDICATED_REQUEST_SERVING_TOPOLOGY
        );
        assert_eq!(
            hc.spec.node_selector.as_ref().unwrap()[CONTROL_PLANE_NODE_LABEL],
            "true"
        );
        let kms = hc.spec.secret_encryption.as_ref().unwrap().kms.as_ref().unwrap();
        assert_eq!(kms.aws.as_ref().unwrap().active_key.arn, "arn:aws:kms:key");
        assert_eq!(
            hc.spec.configuration.as_ref().unwrap().proxy.as_ref().unwrap().https_proxy.as_deref(),
            Some("http://proxy:3128")
        );
        assert_eq!(
            hc.spec.service_account_signing_key.as_ref().unwrap().name,
            "create-abc123-signing-key"
        );
        assert_eq!(
            hc.spec.pull_secret.as_ref().unwrap().name,
            rendered.pull_secret.metadata.name.clone().unwrap()
        );

        let key = rendered.signing_key.as_ref().unwrap();
        assert_eq!(key.data.as_ref().unwrap()["key"].0, b"signing-key");
        assert!(rendered.pull_secret.data.as_ref().unwrap().contains_key(".dockerconfigjson"));

        assert_eq!(rendered.node_pools.len(), 3);
        assert_eq!(
            rendered.node_pools[0].metadata.name.as_deref(),
            Some("create-abc123-us-east-1a")
        );
        assert_eq!(rendered.node_pools[0].spec.cluster_name, "create-abc123");
        assert_eq!(rendered.expected_nodes(), 3);
    }

    #[test]
    fn single_pool_without_zones() {
        let rendered = request(&[]).render(&ClusterHandle::new("ns", "c"), &aws(), None, b"{}");
        assert_eq!(rendered.node_pools.len(), 1);
        assert_eq!(rendered.expected_nodes(), 2);
        assert!(rendered.signing_key.is_none());
        assert!(rendered.hosted_cluster.spec.service_account_signing_key.is_none());
    }
}
