//! Clients for the management cluster and for guest clusters
//!
//! Both are bundles of [`ObjectClient`]s so harness code can run against the
//! API server or against in-memory stores. Guest clients are produced by a
//! [`GuestConnector`] from a kubeconfig payload; the break-glass path swaps
//! the kubeconfig's credentials for a client certificate. Commands inside
//! management pods go through a [`PodExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::SelfSubjectReview;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Secret};
use kube::api::{Api, AttachParams, PostParams};
use kube::Client;
use tokio::io::AsyncReadExt;
#[cfg(test)]
use mockall::automock;

use hcp_e2e_common::crd::{HostedCluster, HostedControlPlane, NodePool};
use hcp_e2e_common::kube_utils::{client_from_kubeconfig, parse_kubeconfig, with_client_certificate};
use hcp_e2e_common::object::{KubeClusterObjects, KubeObjects, ObjectClient, ObjectKey};
use hcp_e2e_common::{Error, Result};

/// Typed access to the management cluster
#[derive(Clone)]
pub struct ManagementClient {
    /// HostedCluster objects
    pub hosted_clusters: Arc<dyn ObjectClient<HostedCluster>>,
    /// NodePool objects
    pub node_pools: Arc<dyn ObjectClient<NodePool>>,
    /// HostedControlPlane objects (in control plane namespaces)
    pub control_planes: Arc<dyn ObjectClient<HostedControlPlane>>,
    /// Secrets
    pub secrets: Arc<dyn ObjectClient<Secret>>,
    /// Namespaces
    pub namespaces: Arc<dyn ObjectClient<Namespace>>,
    /// Pods
    pub pods: Arc<dyn ObjectClient<Pod>>,
    /// Nodes
    pub nodes: Arc<dyn ObjectClient<Node>>,
    /// Command execution inside pods
    pub exec: Arc<dyn PodExecutor>,
}

impl ManagementClient {
    /// Wrap a kube client
    pub fn from_client(client: Client) -> Self {
        Self {
            hosted_clusters: Arc::new(KubeObjects::<HostedCluster>::new(client.clone())),
            node_pools: Arc::new(KubeObjects::<NodePool>::new(client.clone())),
            control_planes: Arc::new(KubeObjects::<HostedControlPlane>::new(client.clone())),
            secrets: Arc::new(KubeObjects::<Secret>::new(client.clone())),
            namespaces: Arc::new(KubeClusterObjects::<Namespace>::new(client.clone())),
            pods: Arc::new(KubeObjects::<Pod>::new(client.clone())),
            nodes: Arc::new(KubeClusterObjects::<Node>::new(client.clone())),
            exec: Arc::new(KubePodExecutor::new(client)),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self> {
        hcp_e2e_common::install_crypto_provider();
        let client = Client::try_default().await?;
        Ok(Self::from_client(client))
    }
}

/// Runs a command in a container and collects its stdout
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run `command` in `container` of `pod`; returns everything the command
    /// wrote to stdout
    async fn exec(&self, pod: &ObjectKey, container: &str, command: Vec<String>)
        -> Result<Vec<u8>>;
}

/// [`PodExecutor`] using the pod `exec` subresource
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(
        &self,
        pod: &ObjectKey,
        container: &str,
        command: Vec<String>,
    ) -> Result<Vec<u8>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default().container(container).stderr(false);
        let mut attached = pods.exec(&pod.name, command, &params).await?;

        let mut output = Vec::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_end(&mut output).await.map_err(|e| {
                Error::internal_with_context("exec", format!("reading stdout of {pod}: {e}"))
            })?;
        }
        attached.join().await.map_err(|e| {
            Error::internal_with_context("exec", format!("exec session in {pod}: {e}"))
        })?;
        Ok(output)
    }
}

/// Identity the guest API server resolved for the caller
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserIdentity {
    /// Username
    pub username: String,
    /// Group memberships
    pub groups: Vec<String>,
}

/// Asks the guest API server who the caller is
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityReviewer: Send + Sync {
    /// Perform a self subject review
    async fn review(&self) -> Result<UserIdentity>;
}

/// [`IdentityReviewer`] issuing a `SelfSubjectReview`
pub struct KubeIdentityReviewer {
    client: Client,
}

impl KubeIdentityReviewer {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityReviewer for KubeIdentityReviewer {
    async fn review(&self) -> Result<UserIdentity> {
        let api: Api<SelfSubjectReview> = Api::all(self.client.clone());
        let review = match api
            .create(&PostParams::default(), &SelfSubjectReview::default())
            .await
        {
            Ok(review) => review,
            Err(kube::Error::Api(ae)) if ae.code == 401 || ae.code == 403 => {
                return Err(Error::authentication(format!(
                    "self subject review rejected ({}): {}",
                    ae.code, ae.message
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let user = review
            .status
            .and_then(|s| s.user_info)
            .ok_or_else(|| Error::authentication("self subject review returned no user info"))?;
        Ok(UserIdentity {
            username: user.username.unwrap_or_default(),
            groups: user.groups.unwrap_or_default(),
        })
    }
}

/// Typed access to a guest cluster
#[derive(Clone)]
pub struct GuestClient {
    /// Guest nodes
    pub nodes: Arc<dyn ObjectClient<Node>>,
    /// Guest pods
    pub pods: Arc<dyn ObjectClient<Pod>>,
    /// Guest namespaces
    pub namespaces: Arc<dyn ObjectClient<Namespace>>,
    /// Guest secrets
    pub secrets: Arc<dyn ObjectClient<Secret>>,
    /// Identity of the credentials this client uses
    pub identity: Arc<dyn IdentityReviewer>,
}

impl std::fmt::Debug for GuestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestClient").finish_non_exhaustive()
    }
}

impl GuestClient {
    /// Wrap a kube client bound to a guest API server
    pub fn from_client(client: Client) -> Self {
        Self {
            nodes: Arc::new(KubeClusterObjects::<Node>::new(client.clone())),
            pods: Arc::new(KubeObjects::<Pod>::new(client.clone())),
            namespaces: Arc::new(KubeClusterObjects::<Namespace>::new(client.clone())),
            secrets: Arc::new(KubeObjects::<Secret>::new(client.clone())),
            identity: Arc::new(KubeIdentityReviewer::new(client)),
        }
    }
}

/// Credentials a guest client authenticates with
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestCredentials {
    /// Whatever the kubeconfig carries (the admin kubeconfig)
    Embedded,
    /// Only the given client certificate; the kubeconfig's own credentials
    /// are discarded
    ClientCertificate {
        /// PEM certificate
        cert_pem: Vec<u8>,
        /// PEM private key
        key_pem: Vec<u8>,
    },
}

/// Builds guest clients from kubeconfig payloads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GuestConnector: Send + Sync {
    /// Build a client for the cluster `kubeconfig` points at
    async fn connect(&self, kubeconfig: &[u8], credentials: &GuestCredentials)
        -> Result<GuestClient>;
}

/// [`GuestConnector`] producing kube-backed clients
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeGuestConnector;

#[async_trait]
impl GuestConnector for KubeGuestConnector {
    async fn connect(
        &self,
        kubeconfig: &[u8],
        credentials: &GuestCredentials,
    ) -> Result<GuestClient> {
        let kubeconfig = match credentials {
            GuestCredentials::Embedded => parse_kubeconfig(kubeconfig)?,
            GuestCredentials::ClientCertificate { cert_pem, key_pem } => {
                with_client_certificate(kubeconfig, cert_pem, key_pem)?
            }
        };
        let client = client_from_kubeconfig(kubeconfig).await?;
        Ok(GuestClient::from_client(client))
    }
}
