//! Kubernetes API store
//!
//! Talks to the API server directly; every call is a bounded network request.

use crate::domain::{ManagedObject, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

/// Object store backed by the cluster API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Translate API status codes into the operator's error taxonomy
fn map_error<K: ManagedObject>(err: kube::Error, name: &str) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: K::kind(&()).to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(|e| map_error::<K>(e, name))
    }

    async fn list<K: ManagedObject>(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }

        match api.list(&params).await {
            Ok(list) => Ok(list.items),
            // The API server has no mapping for this kind at all
            Err(err) if is_not_found(&err) => Err(Error::KindNotRegistered {
                kind: K::kind(&()).to_string(),
            }),
            Err(err) => Err(Error::Kube(err)),
        }
    }

    async fn create<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let namespace = obj.namespace().unwrap_or_default();
        let api = K::api(self.client.clone(), &namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &obj.name_any()))
    }

    async fn update<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();
        let api = K::api(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn update_status<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();
        let api = K::api(self.client.clone(), &namespace);
        let data = serde_json::to_vec(obj)?;
        api.replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| map_error::<K>(e, &name))
    }

    async fn delete<K: ManagedObject>(&self, namespace: &str, name: &str) -> Result<bool> {
        let api = K::api(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => {
                debug!(kind = %K::kind(&()), name, "Already deleted");
                Ok(false)
            }
            Err(err) => Err(map_error::<K>(err, name)),
        }
    }
}
