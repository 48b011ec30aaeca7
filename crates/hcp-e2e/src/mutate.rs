//! Read-modify-write updates with optimistic concurrency
//!
//! [`update_object`] never writes a copy it did not just read: every attempt
//! fetches the latest version, applies the mutation, and replaces it. A
//! conflict means someone wrote in between, so the cycle starts over with
//! that write included.

use kube::{Resource, ResourceExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use hcp_e2e_common::object::{ObjectClient, ObjectKey};
use hcp_e2e_common::retry::{retry_with_backoff_if, RetryConfig};
use hcp_e2e_common::{Error, Result};

/// Attempts before a persistently conflicting update gives up
pub const MAX_CONFLICT_ATTEMPTS: u32 = 10;

/// Apply `mutate` to the latest copy of `obj` and write it back.
///
/// Retries the whole fetch-mutate-write cycle on conflicts only; any other
/// error, or the object disappearing, is returned at once. `mutate` may run
/// several times and must only set fields. Returns the stored result.
pub async fn update_object<K, F>(
    cancel: &CancellationToken,
    client: &dyn ObjectClient<K>,
    obj: &K,
    mutate: F,
) -> Result<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    F: Fn(&mut K) + Send + Sync,
{
    let key = ObjectKey::of(obj);
    let kind = K::kind(&());
    let operation = format!("update {kind} {key}");
    let start = Instant::now();

    let retry = RetryConfig::conflicts(MAX_CONFLICT_ATTEMPTS);
    let attempt = retry_with_backoff_if(&retry, &operation, Error::is_conflict, || {
        let key = &key;
        let mutate = &mutate;
        let kind = &kind;
        async move {
            let mut latest = client.get(key).await?.ok_or_else(|| {
                Error::internal_with_context(
                    "update_object",
                    format!("{kind} {key} no longer exists"),
                )
            })?;
            mutate(&mut latest);
            let stored = client.replace(&latest).await?;
            debug!(
                object = %key,
                resource_version = %stored.resource_version().unwrap_or_default(),
                "Updated object"
            );
            Ok(stored)
        }
    });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled {
            condition: operation.clone(),
            elapsed: start.elapsed(),
        }),
        result = attempt => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use hcp_e2e_common::testing::FakeStore;

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::new()),
            ..Default::default()
        }
    }

    fn set(key: &'static str, value: &'static str) -> impl Fn(&mut ConfigMap) + Send + Sync {
        move |cm| {
            cm.data
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
        }
    }

    /// Store wrapper that lets another writer in right before the first
    /// `rivals` replaces.
    struct RacingStore {
        inner: Arc<FakeStore<ConfigMap>>,
        rivals: AtomicU32,
        replaces: AtomicU32,
    }

    #[async_trait]
    impl ObjectClient<ConfigMap> for RacingStore {
        async fn get(&self, key: &ObjectKey) -> Result<Option<ConfigMap>> {
            self.inner.get(key).await
        }

        async fn list(
            &self,
            namespace: Option<&str>,
            label_selector: Option<&str>,
        ) -> Result<Vec<ConfigMap>> {
            self.inner.list(namespace, label_selector).await
        }

        async fn create(&self, obj: &ConfigMap) -> Result<ConfigMap> {
            self.inner.create(obj).await
        }

        async fn replace(&self, obj: &ConfigMap) -> Result<ConfigMap> {
            let n = self.replaces.fetch_add(1, Ordering::SeqCst);
            if n < self.rivals.load(Ordering::SeqCst) {
                let rival_key = format!("rival-{n}");
                self.inner.modify(&ObjectKey::of(obj), |cm| {
                    cm.data
                        .get_or_insert_with(BTreeMap::new)
                        .insert(rival_key, "set".to_string());
                });
            }
            self.inner.replace(obj).await
        }

        async fn delete(&self, key: &ObjectKey) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    fn racing(rivals: u32) -> (Arc<FakeStore<ConfigMap>>, RacingStore, ConfigMap) {
        let inner = Arc::new(FakeStore::new());
        let stored = inner.insert(config_map());
        let store = RacingStore {
            inner: inner.clone(),
            rivals: AtomicU32::new(rivals),
            replaces: AtomicU32::new(0),
        };
        (inner, store, stored)
    }

    #[tokio::test(start_paused = true)]
    async fn competing_write_is_retried_and_both_changes_survive() {
        let (inner, store, stale) = racing(1);
        let cancel = CancellationToken::new();

        let updated = update_object(&cancel, &store, &stale, set("mine", "yes"))
            .await
            .unwrap();

        let data = updated.data.unwrap();
        assert_eq!(data["mine"], "yes");
        assert_eq!(data["rival-0"], "set");
        assert_eq!(store.replaces.load(Ordering::SeqCst), 2);
        assert_eq!(
            inner.snapshot(&ObjectKey::of(&stale)).unwrap().data.unwrap()["mine"],
            "yes"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_input_copy_is_never_written() {
        let (inner, store, stale) = racing(0);
        let key = ObjectKey::of(&stale);
        inner.modify(&key, set("earlier", "kept"));

        let cancel = CancellationToken::new();
        update_object(&cancel, &store, &stale, set("mine", "yes"))
            .await
            .unwrap();

        let data = inner.snapshot(&key).unwrap().data.unwrap();
        assert_eq!(data["earlier"], "kept");
        assert_eq!(data["mine"], "yes");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_conflicts_exhaust_the_budget() {
        let (_inner, store, stale) = racing(u32::MAX);
        let cancel = CancellationToken::new();

        let err = update_object(&cancel, &store, &stale, set("mine", "yes"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.replaces.load(Ordering::SeqCst), MAX_CONFLICT_ATTEMPTS);
    }

    #[tokio::test]
    async fn missing_object_fails_without_retry() {
        let store = FakeStore::<ConfigMap>::new();
        let cancel = CancellationToken::new();

        let err = update_object(&cancel, &store, &config_map(), set("mine", "yes"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn cancelled_update_reports_cancellation() {
        let (_inner, store, stale) = racing(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = update_object(&cancel, &store, &stale, set("mine", "yes"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
