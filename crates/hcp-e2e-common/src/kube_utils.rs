//! Shared Kubernetes utilities using kube-rs
//!
//! The convergence poller lives here together with the condition helpers and
//! kubeconfig handling it is usually paired with.

use std::future::Future;
use std::time::Duration;

use base64::Engine;
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::crd::Condition;
use crate::Error;

/// The "Ready" condition type for nodes
pub const CONDITION_READY: &str = "Ready";
/// The "Available" condition type for hosted clusters
pub const CONDITION_AVAILABLE: &str = "Available";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for Condition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Check if a condition of the given type has status "True"
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Check if a node has the Ready condition set to True.
pub fn is_node_ready(node: &Node) -> bool {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    has_condition(conditions, CONDITION_READY)
}

/// Poll a predicate until it reports done, the timeout elapses, or the
/// token is cancelled.
///
/// The predicate is evaluated immediately and then once per `poll_interval`.
/// It returns `Ok(true)` when done and `Ok(false)` to keep waiting; "not
/// found yet" must be reported as `Ok(false)`. Errors for which
/// [`Error::is_terminal`] holds abort the poll and are returned as-is; any
/// other error is logged, remembered, and polling continues.
///
/// The wait never outlasts `timeout`: a predicate evaluation still in flight
/// at the deadline is abandoned. Cancellation is observed both while sleeping
/// and while a predicate is running.
///
/// Returns the elapsed time on success, [`Error::Timeout`] (carrying the
/// last transient error) or [`Error::Cancelled`] otherwise.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    poll_interval: Duration,
    timeout: Duration,
    condition: impl Into<String>,
    mut check_fn: F,
) -> Result<Duration, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let condition = condition.into();
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_error: Option<String> = None;
    let mut attempts = 0u32;

    let cancelled = |condition: &str| Error::Cancelled {
        condition: condition.to_string(),
        elapsed: start.elapsed(),
    };
    let timed_out = |condition: &str, last_error: Option<String>| Error::Timeout {
        condition: condition.to_string(),
        elapsed: start.elapsed(),
        last_error,
    };

    loop {
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(&condition)),
            result = check_fn() => result,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(timed_out(&condition, last_error));
            }
        };

        match outcome {
            Ok(true) => {
                let elapsed = start.elapsed();
                debug!(
                    condition = %condition,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Condition met"
                );
                return Ok(elapsed);
            }
            Ok(false) => {
                trace!(condition = %condition, attempts, "Condition not yet met");
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                debug!(condition = %condition, attempts, error = %e, "Poll check failed, retrying");
                last_error = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(timed_out(&condition, last_error));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(&condition)),
            _ = tokio::time::sleep_until((now + poll_interval).min(deadline)) => {}
        }
    }
}

/// Poll until `fetch` yields a value, with the semantics of [`poll_until`].
///
/// `Ok(None)` means "not there yet" and keeps polling.
pub async fn poll_for_value<T, F, Fut>(
    cancel: &CancellationToken,
    poll_interval: Duration,
    timeout: Duration,
    condition: impl Into<String>,
    mut fetch: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let condition = condition.into();
    let slot: std::sync::Mutex<Option<T>> = std::sync::Mutex::new(None);
    let slot_ref = &slot;

    poll_until(cancel, poll_interval, timeout, condition.clone(), || {
        let fut = fetch();
        async move {
            match fut.await? {
                Some(value) => {
                    *slot_ref.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    })
    .await?;

    slot.into_inner()
        .unwrap_or_else(|e| e.into_inner())
        .ok_or_else(|| {
            Error::internal_with_context(
                "poll_for_value",
                format!("{condition} reported done without a value"),
            )
        })
}

/// Parse a kubeconfig payload (as stored in a kubeconfig secret)
pub fn parse_kubeconfig(data: &[u8]) -> Result<Kubeconfig, Error> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig UTF-8: {e}")))?;
    serde_yaml::from_str(text)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig YAML: {e}")))
}

/// Rewrite a kubeconfig so every user authenticates with the given client
/// certificate and nothing else.
///
/// Tokens, exec plugins, and embedded certificates of the original users are
/// discarded, so the resulting identity is exactly the certificate's. Empty
/// or non-PEM material is rejected as an authentication failure.
pub fn with_client_certificate(
    kubeconfig_data: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Kubeconfig, Error> {
    if !looks_like_pem(cert_pem) {
        return Err(Error::authentication("client certificate is empty or not PEM"));
    }
    if !looks_like_pem(key_pem) {
        return Err(Error::authentication("client key is empty or not PEM"));
    }

    let text = std::str::from_utf8(kubeconfig_data)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig UTF-8: {e}")))?;
    let mut doc: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig YAML: {e}")))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let mut identity = serde_yaml::Mapping::new();
    identity.insert(
        "client-certificate-data".into(),
        b64.encode(cert_pem).into(),
    );
    identity.insert("client-key-data".into(), b64.encode(key_pem).into());

    let users = doc
        .get_mut("users")
        .and_then(|u| u.as_sequence_mut())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::kubeconfig("kubeconfig has no users"))?;
    for user in users.iter_mut() {
        if let Some(entry) = user.as_mapping_mut() {
            entry.insert("user".into(), serde_yaml::Value::Mapping(identity.clone()));
        }
    }

    serde_yaml::from_value(doc)
        .map_err(|e| Error::kubeconfig(format!("failed to rebuild kubeconfig: {e}")))
}

fn looks_like_pem(data: &[u8]) -> bool {
    std::str::from_utf8(data)
        .map(|s| s.trim_start().starts_with("-----BEGIN "))
        .unwrap_or(false)
}

/// Build a kube client from an in-memory kubeconfig using its current context
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    crate::install_crypto_provider();

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(format!("failed to build config: {e}")))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| Error::authentication(format!("failed to create client: {e}")))
}
