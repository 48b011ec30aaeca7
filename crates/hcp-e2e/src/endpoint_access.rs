//! Endpoint-access transitions of a running cluster
//!
//! Both directions mutate the HostedCluster through [`update_object`] and
//! then wait for the operator: the cluster must report Available for the
//! generation carrying the change, and for a switch to private the control
//! plane must serve with the new exposure. Nothing is provisioned or torn
//! down here.

use tracing::info;

use hcp_e2e_common::crd::{EndpointAccess, HostedCluster, CONDITION_KUBE_APISERVER_AVAILABLE};
use hcp_e2e_common::kube_utils::CONDITION_AVAILABLE;
use hcp_e2e_common::{Error, Result};

use crate::context::StepContext;
use crate::mutate::update_object;

/// Move a `Private` cluster to `PublicAndPrivate` and check that the guest
/// API becomes reachable from the test runner.
pub async fn switch_to_public(t: &StepContext) -> Result<()> {
    let previous = set_endpoint_access(t, EndpointAccess::PublicAndPrivate, |current| {
        *current == EndpointAccess::Private
    })
    .await?;

    // The cached client, if any, was built for the old endpoint.
    t.forget_guest_client().await;
    t.guest_client().await?;

    info!(cluster = %t.handle(), from = %previous, "Guest API reachable over public endpoint");
    Ok(())
}

/// Move a publicly reachable cluster back to `Private`.
///
/// The guest API is no longer reachable from the test runner afterwards, so
/// only management-side state is checked and the cached guest client is
/// dropped.
pub async fn switch_to_private(t: &StepContext) -> Result<()> {
    let previous = set_endpoint_access(t, EndpointAccess::Private, |current| {
        current.is_publicly_reachable()
    })
    .await?;

    let key = &t.handle().control_plane_key();
    let control_planes = &t.management().control_planes;
    let elapsed = t
        .wait_for(
            format!("{key} to serve {CONDITION_KUBE_APISERVER_AVAILABLE} as Private"),
            t.timeouts().provision,
            || async move {
                Ok(control_planes.get(key).await?.is_some_and(|hcp| {
                    hcp.endpoint_access() == Some(EndpointAccess::Private)
                        && hcp.condition_current(CONDITION_KUBE_APISERVER_AVAILABLE)
                }))
            },
        )
        .await?;

    t.forget_guest_client().await;

    info!(
        cluster = %t.handle(),
        from = %previous,
        elapsed_ms = elapsed.as_millis() as u64,
        "Guest API restricted to private endpoint"
    );
    Ok(())
}

/// Set the endpoint access to `target` and wait until the cluster is
/// Available at the generation carrying the change. Returns the previous
/// value.
async fn set_endpoint_access(
    t: &StepContext,
    target: EndpointAccess,
    allowed_from: impl Fn(&EndpointAccess) -> bool,
) -> Result<EndpointAccess> {
    let hc = t.hosted_cluster().await?;
    if hc.spec.platform.aws.is_none() {
        return Err(Error::validation(format!(
            "HostedCluster {} has no AWS platform settings; endpoint access cannot change",
            t.handle()
        )));
    }
    let current = hc.endpoint_access();
    if !allowed_from(&current) {
        return Err(Error::validation(format!(
            "HostedCluster {} has endpoint access {current}, cannot switch to {target}",
            t.handle()
        )));
    }

    let clusters = &t.management().hosted_clusters;
    let set_target = |hc: &mut HostedCluster| {
        if let Some(aws) = hc.spec.platform.aws.as_mut() {
            aws.endpoint_access = target.clone();
        }
    };
    let updated = update_object(t.cancel_token(), clusters.as_ref(), &hc, set_target).await?;
    let generation = updated.metadata.generation.ok_or_else(|| {
        Error::internal_with_context(
            "endpoint_access",
            format!("HostedCluster {} has no generation", t.handle()),
        )
    })?;
    info!(
        cluster = %t.handle(),
        from = %current,
        to = %target,
        generation,
        "Endpoint access updated"
    );

    let key = &t.handle().key();
    let target = &target;
    let elapsed = t
        .wait_for(
            format!("HostedCluster {key} to be Available at generation {generation}"),
            t.timeouts().provision,
            || async move {
                Ok(clusters.get(key).await?.is_some_and(|hc| {
                    hc.endpoint_access() == *target
                        && hc.condition_holds_for(CONDITION_AVAILABLE, generation)
                }))
            },
        )
        .await?;
    info!(cluster = %key, elapsed_ms = elapsed.as_millis() as u64, "Endpoint access converged");

    Ok(current)
}
