//! Guest client resolution
//!
//! The operator publishes an admin kubeconfig for every hosted cluster some
//! time after creation. [`wait_for_guest_client`] waits for it and for the
//! guest API to answer. [`wait_for_break_glass_client`] instead
//! authenticates with the break-glass client certificate the operator
//! materializes in the control plane namespace.

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hcp_e2e_common::kube_utils::{poll_for_value, poll_until};
use hcp_e2e_common::object::ObjectKey;
use hcp_e2e_common::{
    Error, Result, BREAK_GLASS_CERT_SECRET, KUBECONFIG_SECRET_KEY, TLS_CERT_KEY, TLS_KEY_KEY,
};

use crate::client::{GuestClient, GuestConnector, GuestCredentials, ManagementClient, UserIdentity};
use crate::config::HarnessTimeouts;
use crate::request::ClusterHandle;

/// Group every break-glass identity must belong to
pub const BREAK_GLASS_GROUP: &str = "system:masters";

/// Prefix of every break-glass username
pub const BREAK_GLASS_USER_PREFIX: &str = "customer-break-glass-";

fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .filter(|v| !v.is_empty())
}

/// Wait up to `timeout` for the admin kubeconfig of a cluster and return
/// its payload
pub async fn wait_for_guest_kubeconfig(
    cancel: &CancellationToken,
    mgmt: &ManagementClient,
    handle: &ClusterHandle,
    timeouts: &HarnessTimeouts,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let cluster_key = &handle.key();
    poll_for_value(
        cancel,
        timeouts.poll_interval,
        timeout,
        format!("admin kubeconfig of {handle}"),
        || async move {
            let Some(hc) = mgmt.hosted_clusters.get(cluster_key).await? else {
                return Err(Error::validation(format!(
                    "HostedCluster {handle} does not exist"
                )));
            };
            let Some(secret_name) = hc.kubeconfig_secret() else {
                return Ok(None);
            };
            let secret_key = ObjectKey::namespaced(&handle.namespace, secret_name);
            Ok(mgmt
                .secrets
                .get(&secret_key)
                .await?
                .and_then(|s| secret_value(&s, KUBECONFIG_SECRET_KEY)))
        },
    )
    .await
}

/// Wait until the guest API of a cluster is reachable and return a client for it.
///
/// `timeout` bounds the whole resolution, kubeconfig wait and API wait
/// together. Callers treat a timeout as fatal for their step.
pub async fn wait_for_guest_client(
    cancel: &CancellationToken,
    mgmt: &ManagementClient,
    connector: &dyn GuestConnector,
    handle: &ClusterHandle,
    timeouts: &HarnessTimeouts,
    timeout: Duration,
) -> Result<GuestClient> {
    let start = Instant::now();
    let deadline = start + timeout;
    let kubeconfig = wait_for_guest_kubeconfig(cancel, mgmt, handle, timeouts, timeout).await?;
    let guest = connector
        .connect(&kubeconfig, &GuestCredentials::Embedded)
        .await?;

    let nodes = &guest.nodes;
    poll_until(
        cancel,
        timeouts.poll_interval,
        deadline.saturating_duration_since(Instant::now()),
        format!("guest API of {handle} to answer"),
        || async move { nodes.list(None, None).await.map(|_| true) },
    )
    .await?;
    let elapsed = start.elapsed();
    info!(cluster = %handle, elapsed_ms = elapsed.as_millis() as u64, "Guest API reachable");
    Ok(guest)
}

/// Wait for the break-glass certificate and return a client authenticated
/// only by it.
///
/// A missing or half-populated secret keeps the wait going; material that is
/// present but unusable fails with an authentication error.
pub async fn wait_for_break_glass_client(
    cancel: &CancellationToken,
    mgmt: &ManagementClient,
    connector: &dyn GuestConnector,
    handle: &ClusterHandle,
    timeouts: &HarnessTimeouts,
) -> Result<GuestClient> {
    let kubeconfig =
        wait_for_guest_kubeconfig(cancel, mgmt, handle, timeouts, timeouts.guest_client).await?;

    let cert_key = &ObjectKey::namespaced(
        handle.control_plane_namespace(),
        BREAK_GLASS_CERT_SECRET,
    );
    let (cert_pem, key_pem) = poll_for_value(
        cancel,
        timeouts.credential_poll_interval,
        timeouts.credential,
        format!("break-glass certificate secret {cert_key}"),
        || async move {
            let Some(secret) = mgmt.secrets.get(cert_key).await? else {
                debug!(secret = %cert_key, "Break-glass certificate secret not found yet");
                return Ok(None);
            };
            Ok(secret_value(&secret, TLS_CERT_KEY).zip(secret_value(&secret, TLS_KEY_KEY)))
        },
    )
    .await?;

    connector
        .connect(
            &kubeconfig,
            &GuestCredentials::ClientCertificate { cert_pem, key_pem },
        )
        .await
}

/// Check that a client is authenticated as a break-glass identity.
///
/// A wrong identity is an assertion failure, never retried.
pub async fn verify_break_glass_identity(client: &GuestClient) -> Result<UserIdentity> {
    let identity = client.identity.review().await?;

    if !identity.groups.iter().any(|g| g == BREAK_GLASS_GROUP) {
        return Err(Error::assertion(format!(
            "break-glass user {} is not in group {BREAK_GLASS_GROUP} (groups: {:?})",
            identity.username, identity.groups
        )));
    }
    if !identity.username.starts_with(BREAK_GLASS_USER_PREFIX) {
        return Err(Error::assertion(format!(
            "break-glass username {:?} lacks prefix {BREAK_GLASS_USER_PREFIX}",
            identity.username
        )));
    }

    info!(username = %identity.username, "Break-glass identity verified");
    Ok(identity)
}
