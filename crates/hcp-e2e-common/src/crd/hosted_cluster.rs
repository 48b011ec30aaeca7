//! HostedCluster resource
//!
//! A HostedCluster is the management-side request for a cluster whose
//! control plane runs in a namespace of the management cluster.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::types::{
    AvailabilityPolicy, Condition, EndpointAccess, PlatformType, Release, SecretReference,
};
use crate::kube_utils::has_condition;

/// Specification of a HostedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1beta1",
    kind = "HostedCluster",
    plural = "hostedclusters",
    namespaced,
    status = "HostedClusterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterSpec {
    /// Release the control plane runs
    pub release: Release,

    /// Infrastructure platform
    pub platform: PlatformSpec,

    /// DNS configuration for cluster endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSpec>,

    /// Replica policy of control plane components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_availability_policy: Option<AvailabilityPolicy>,

    /// Replica policy of guest infrastructure components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_availability_policy: Option<AvailabilityPolicy>,

    /// Pull secret used by control plane and nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<SecretReference>,

    /// Secret holding the service account token signing key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_signing_key: Option<SecretReference>,

    /// Encryption of secrets at rest in etcd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_encryption: Option<SecretEncryptionSpec>,

    /// Cluster-wide configuration (proxy, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ClusterConfiguration>,

    /// Node selector applied to control plane pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Platform section of a HostedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSpec {
    /// Platform type
    #[serde(rename = "type")]
    pub type_: PlatformType,

    /// AWS-specific settings (only for the AWS platform)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPlatformSpec>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// AWS platform settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatformSpec {
    /// AWS region
    pub region: String,

    /// Exposure of the API endpoint
    #[serde(default)]
    pub endpoint_access: EndpointAccess,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// DNS settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DnsSpec {
    /// Base domain under which cluster records are created
    pub base_domain: String,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Secret encryption settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SecretEncryptionSpec {
    /// Encryption type ("kms" or "aescbc")
    #[serde(rename = "type")]
    pub type_: String,

    /// KMS settings when type is "kms"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<KmsSpec>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// KMS provider selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct KmsSpec {
    /// KMS provider ("AWS")
    pub provider: String,

    /// AWS KMS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsKmsSpec>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// AWS KMS settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwsKmsSpec {
    /// Region of the key
    pub region: String,

    /// Key used to encrypt new data
    pub active_key: AwsKmsKeyEntry,

    /// Role the control plane assumes to use the key
    #[serde(default)]
    pub auth: AwsKmsAuthSpec,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A KMS key
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AwsKmsKeyEntry {
    /// Key ARN
    #[serde(rename = "arn")]
    pub arn: String,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Role used by the control plane to reach KMS
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AwsKmsAuthSpec {
    /// Role ARN, filled in by infrastructure provisioning
    #[serde(rename = "awsKms", default)]
    pub aws_kms_role_arn: String,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Cluster-wide configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterConfiguration {
    /// Egress proxy settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Guest OAuth server settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSpec>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Guest OAuth server settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSpec {
    /// Identity providers users can log in through
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_providers: Vec<IdentityProvider>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One OAuth identity provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProvider {
    /// Provider name, used as the login prefix
    pub name: String,

    /// How provider identities map to users ("claim", "lookup", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_method: Option<String>,

    /// Provider type ("HTPasswd", "OpenID", ...)
    #[serde(rename = "type")]
    pub type_: String,

    /// Settings for the HTPasswd provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htpasswd: Option<HtpasswdProvider>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// HTPasswd identity provider settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HtpasswdProvider {
    /// Secret holding the `htpasswd` file
    pub file_data: SecretReference,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Egress proxy settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Proxy for plain HTTP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,

    /// Proxy for HTTPS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,

    /// Comma-separated hosts that bypass the proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Observed state of a HostedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostedClusterStatus {
    /// Conditions reported by the operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Admin kubeconfig secret for the guest cluster, once published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<SecretReference>,

    /// Release rollout progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ClusterVersionStatus>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Release rollout state of a HostedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionStatus {
    /// Rollouts, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<UpdateHistory>,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One release rollout
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHistory {
    /// "Completed" or "Partial"
    pub state: String,

    /// Release version being rolled out
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Release image being rolled out
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Fields not modelled here, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// History state of a rollout that finished
pub const ROLLOUT_COMPLETED: &str = "Completed";

impl HostedCluster {
    /// Effective endpoint access; clusters without AWS settings are public
    pub fn endpoint_access(&self) -> EndpointAccess {
        self.spec
            .platform
            .aws
            .as_ref()
            .map(|aws| aws.endpoint_access.clone())
            .unwrap_or_default()
    }

    /// Whether the named condition is "True" and reflects `generation` of
    /// the spec or a later one
    pub fn condition_holds_for(&self, condition_type: &str, generation: i64) -> bool {
        self.status
            .iter()
            .flat_map(|s| s.conditions.iter())
            .any(|c| c.type_ == condition_type && c.holds_for(generation))
    }

    /// Whether the newest release rollout has completed
    pub fn rollout_complete(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.version.as_ref())
            .and_then(|v| v.history.first())
            .is_some_and(|latest| latest.state == ROLLOUT_COMPLETED)
    }

    /// Whether the named status condition is "True"
    pub fn has_condition(&self, condition_type: &str) -> bool {
        has_condition(
            self.status.as_ref().map(|s| s.conditions.as_slice()),
            condition_type,
        )
    }

    /// Name of the published admin kubeconfig secret, if any
    pub fn kubeconfig_secret(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.kubeconfig.as_ref())
            .map(|r| r.name.as_str())
    }
}
