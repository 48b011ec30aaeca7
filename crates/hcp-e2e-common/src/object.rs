//! Typed object clients
//!
//! The harness talks to both the management cluster and the guest cluster
//! through [`ObjectClient`], a small get/list/create/replace/delete surface
//! over one resource kind. Production code wraps a kube [`Api`]; tests use
//! the in-memory store from [`crate::testing`].

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Error;

/// Stable identity of an object: namespace (empty for cluster-scoped) and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, or empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Typed CRUD access to one resource kind
#[async_trait]
pub trait ObjectClient<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error>;

    /// List objects in a namespace (`None` = all namespaces or cluster scope),
    /// optionally filtered by a label selector
    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, Error>;

    /// Create an object and return the stored copy
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Write a full object back; fails with a conflict when the object's
    /// resourceVersion is stale
    async fn replace(&self, obj: &K) -> Result<K, Error>;

    /// Request deletion; deleting a missing object is not an error
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;
}

fn map_write_error<K: Resource<DynamicType = ()>>(key: &ObjectKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(K::kind(&()), key.to_string(), ae.message)
        }
        other => other.into(),
    }
}

/// [`ObjectClient`] for a namespaced resource kind backed by the API server
pub struct KubeObjects<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeObjects<K> {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> ObjectClient<K> for KubeObjects<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, Error> {
        let api: Api<K> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&key, e))
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`ObjectClient`] for a cluster-scoped resource kind (nodes, namespaces)
pub struct KubeClusterObjects<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeClusterObjects<K> {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> ObjectClient<K> for KubeClusterObjects<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, Error> {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        _namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, Error> {
        let api: Api<K> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let api: Api<K> = Api::all(self.client.clone());
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&key, e))
    }

    async fn replace(&self, obj: &K) -> Result<K, Error> {
        let key = ObjectKey::of(obj);
        let api: Api<K> = Api::all(self.client.clone());
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error::<K>(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        let api: Api<K> = Api::all(self.client.clone());
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
