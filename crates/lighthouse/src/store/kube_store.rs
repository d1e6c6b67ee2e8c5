//! [`Store`] backed by the Kubernetes API server.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::{selector_string, Object, Store};
use crate::error::{Error, Result};

pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K: Object> KubeStore<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

fn describe<K: Object>(namespace: &str, name: &str) -> String {
    format!("{} {namespace}/{name}", K::kind(&()))
}

/// Map API status codes onto the store's error vocabulary.
fn classify(err: kube::Error, what: String) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::AlreadyExists(what)
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(what),
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what),
        kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => Error::Rejected {
            name: what,
            reason: resp.message.clone(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl<K: Object> Store<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, name)))
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, "*")))?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .or_else(|| obj.meta().generate_name.clone())
            .unwrap_or_default();
        debug!(kind = %K::kind(&()), namespace, name = %name, "Creating resource");
        self.api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, &name)))
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, &name)))
    }

    async fn replace_status(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        self.api(namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, &name)))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, describe::<K>(namespace, name)))?;
        Ok(())
    }
}
