//! Common types for hosted control plane e2e tests: resource types, errors,
//! polling, retries, and the typed object client abstraction.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod object;
pub mod retry;
pub mod telemetry;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation selecting the control plane topology of a HostedCluster
pub const TOPOLOGY_ANNOTATION: &str = "hypershift.openshift.io/topology";

/// Topology value that places request-serving components on dedicated nodes
pub const DEDICATED_REQUEST_SERVING_TOPOLOGY: &str = "dedicated-request-serving-components";

/// Node selector key used for control plane placement on request-serving topologies
pub const CONTROL_PLANE_NODE_LABEL: &str = "hypershift.openshift.io/control-plane";

/// Label carried by request-serving control plane pods and the nodes reserved for them
pub const REQUEST_SERVING_LABEL: &str = "hypershift.openshift.io/request-serving-component";

/// Label identifying the zone of a node pool
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Key of the kubeconfig payload inside the admin kubeconfig secret
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Name of the break-glass client certificate secret in the control plane namespace
pub const BREAK_GLASS_CERT_SECRET: &str = "customer-system-admin-client-cert-key";

/// Secret keys of a TLS client certificate pair
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key of the TLS private key
pub const TLS_KEY_KEY: &str = "tls.key";

/// Install the process-wide rustls crypto provider.
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
