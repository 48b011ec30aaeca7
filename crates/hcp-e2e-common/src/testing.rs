//! In-memory object store for tests
//!
//! [`FakeStore`] implements [`ObjectClient`] with the optimistic concurrency
//! rules of the API server: every write bumps `metadata.resourceVersion`, and
//! a replace carrying a stale version fails with a conflict. Tests play the
//! part of the operator by mutating objects directly with [`FakeStore::modify`].
//!
//! `metadata.generation` starts at 1 and moves only on [`ObjectClient::replace`]:
//! harness writes count as spec changes, operator writes through `modify` as
//! status updates.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};

use crate::object::{ObjectClient, ObjectKey};
use crate::Error;

/// What a delete request does to the stored object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeleteBehavior {
    /// Object disappears at once
    #[default]
    Immediate,
    /// Request is recorded but the object stays (stuck finalizer)
    Ignore,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    deletes: Vec<ObjectKey>,
    creates: Vec<ObjectKey>,
    fail_creates: Option<String>,
    delete_behavior: DeleteBehavior,
}

/// Thread-safe in-memory [`ObjectClient`]
pub struct FakeStore<K> {
    state: Mutex<State<K>>,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                deletes: Vec::new(),
                creates: Vec::new(),
                fail_creates: None,
                delete_behavior: DeleteBehavior::Immediate,
            }),
        }
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        }),
    }
}

fn matches_selector<K: Resource>(obj: &K, selector: &str) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

impl<K> FakeStore<K>
where
    K: Resource + Clone,
{
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        // A panicking test thread must not hide the store from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stamp(state: &mut State<K>, obj: &mut K) {
        state.version += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
    }

    fn first_generation(obj: &mut K) {
        obj.meta_mut().generation.get_or_insert(1);
    }

    /// Store an object as-is, overwriting any existing copy
    pub fn insert(&self, mut obj: K) -> K {
        let mut state = self.lock();
        Self::first_generation(&mut obj);
        Self::stamp(&mut state, &mut obj);
        state.objects.insert(ObjectKey::of(&obj), obj.clone());
        obj
    }

    /// Mutate a stored object in place, as another writer would
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> Option<K> {
        let mut state = self.lock();
        let mut obj = state.objects.get(key)?.clone();
        f(&mut obj);
        Self::stamp(&mut state, &mut obj);
        state.objects.insert(key.clone(), obj.clone());
        Some(obj)
    }

    /// Current copy of an object
    pub fn snapshot(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// Keys of all stored objects
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Every delete request received, in order
    pub fn deletes(&self) -> Vec<ObjectKey> {
        self.lock().deletes.clone()
    }

    /// Every successful create, in order
    pub fn creates(&self) -> Vec<ObjectKey> {
        self.lock().creates.clone()
    }

    /// Make every subsequent create fail with the given message
    pub fn fail_creates(&self, message: impl Into<String>) {
        self.lock().fail_creates = Some(message.into());
    }

    /// Choose what delete requests do
    pub fn set_delete_behavior(&self, behavior: DeleteBehavior) {
        self.lock().delete_behavior = behavior;
    }
}

#[async_trait]
impl<K> ObjectClient<K> for FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        Ok(self.snapshot(key))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, Error> {
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .filter(|(_, obj)| label_selector.map_or(true, |sel| matches_selector(*obj, sel)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let mut state = self.lock();
        let key = ObjectKey::of(obj);
        if let Some(message) = state.fail_creates.clone() {
            return Err(api_error(403, "Forbidden", message));
        }
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(K::kind(&()), key.to_string(), "already exists"));
        }
        let mut stored = obj.clone();
        Self::first_generation(&mut stored);
        Self::stamp(&mut state, &mut stored);
        state.objects.insert(key.clone(), stored.clone());
        state.creates.push(key);
        Ok(stored)
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let mut state = self.lock();
        let key = ObjectKey::of(obj);
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| api_error(404, "NotFound", format!("{key} not found")))?;
        if current.resource_version() != obj.resource_version() {
            return Err(Error::conflict(
                K::kind(&()),
                key.to_string(),
                "the object has been modified; please apply your changes to the latest version",
            ));
        }
        let generation = current.meta().generation.unwrap_or(0) + 1;
        let mut stored = obj.clone();
        stored.meta_mut().generation = Some(generation);
        Self::stamp(&mut state, &mut stored);
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let mut state = self.lock();
        state.deletes.push(key.clone());
        if state.delete_behavior == DeleteBehavior::Immediate {
            state.objects.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    fn secret(name: &str, labels: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let store = FakeStore::new();
        let created = store.create(&secret("a", &[])).await.unwrap();
        store.modify(&ObjectKey::of(&created), |_| {});

        let err = store.replace(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn generation_moves_on_replace_only() {
        let store = FakeStore::new();
        let created = store.create(&secret("a", &[])).await.unwrap();
        assert_eq!(created.meta().generation, Some(1));

        let key = ObjectKey::of(&created);
        let modified = store.modify(&key, |_| {}).unwrap();
        assert_eq!(modified.meta().generation, Some(1));

        let replaced = store.replace(&modified).await.unwrap();
        assert_eq!(replaced.meta().generation, Some(2));
        assert_ne!(replaced.resource_version(), modified.resource_version());
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let store = FakeStore::new();
        store.insert(secret("a", &[("role", "serving")]));
        store.insert(secret("b", &[("role", "other")]));

        let found = store.list(Some("ns"), Some("role=serving")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");
        assert!(store.list(Some("elsewhere"), None).await.unwrap().is_empty());
    }
}
