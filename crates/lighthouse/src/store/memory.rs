//! In-memory [`Store`] with API-server write semantics.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use super::{matches_selector, Object, Store};
use crate::error::{Error, Result};

/// Write calls whose failure can be scheduled with [`MemoryStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteOp {
    Create,
    Replace,
    ReplaceStatus,
    Delete,
}

struct Inner {
    objects: BTreeMap<(String, String), Value>,
    resource_version: u64,
    uid: u64,
    writes: u64,
    failures: BTreeMap<WriteOp, u32>,
}

impl Inner {
    /// Consume one scheduled failure of `op`.
    fn injected(&mut self, op: WriteOp, what: &str) -> Result<()> {
        match self.failures.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(Error::Kube(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("{op:?} of {what} failed"),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                })))
            }
            _ => Ok(()),
        }
    }
}

/// Objects are stored as JSON so that spec and status can be replaced independently.
pub struct MemoryStore<K> {
    inner: Mutex<Inner>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                resource_version: 0,
                uid: 0,
                writes: 0,
                failures: BTreeMap::new(),
            }),
            _kind: std::marker::PhantomData,
        }
    }
}

impl<K: Object> MemoryStore<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite `obj` including its status, bypassing admission.
    pub fn insert(&self, obj: K) -> Result<K> {
        let mut inner = self.lock();
        let mut obj = obj;
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        inner.resource_version += 1;
        obj.meta_mut().resource_version = Some(inner.resource_version.to_string());
        if obj.meta().uid.is_none() {
            inner.uid += 1;
            obj.meta_mut().uid = Some(format!("uid-{}", inner.uid));
        }
        inner
            .objects
            .insert((namespace, name), serde_json::to_value(&obj)?);
        Ok(obj)
    }

    /// Every stored object, ordered by namespace and name.
    pub fn all(&self) -> Vec<K> {
        self.lock()
            .objects
            .values()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Number of successful create, replace, status and delete calls.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Make the next `count` calls of `op` fail without touching the stored objects.
    pub fn fail_next(&self, op: WriteOp, count: u32) {
        self.lock().failures.insert(op, count);
    }

    fn check_version(stored: &Value, obj: &K, what: &str) -> Result<()> {
        let stored_rv = stored
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        match obj.meta().resource_version.as_deref() {
            Some(rv) if Some(rv) != stored_rv => Err(Error::Conflict(what.to_string())),
            _ => Ok(()),
        }
    }

    fn write(
        &self,
        op: WriteOp,
        namespace: &str,
        obj: &K,
        merge: impl FnOnce(&mut Value, Value),
    ) -> Result<K> {
        let name = obj.name_any();
        let what = format!("{} {namespace}/{name}", K::kind(&()));
        let mut inner = self.lock();
        inner.injected(op, &what)?;
        let key = (namespace.to_string(), name);
        let Some(stored) = inner.objects.get(&key) else {
            return Err(Error::NotFound(what));
        };
        Self::check_version(stored, obj, &what)?;
        let mut next = stored.clone();
        merge(&mut next, serde_json::to_value(obj)?);
        inner.resource_version += 1;
        next["metadata"]["resourceVersion"] = Value::String(inner.resource_version.to_string());
        let out: K = serde_json::from_value(next.clone())?;
        inner.objects.insert(key, next);
        inner.writes += 1;
        Ok(out)
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[async_trait]
impl<K: Object> Store<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = self.lock();
        inner
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>> {
        let inner = self.lock();
        let mut out = Vec::new();
        for ((ns, _), value) in &inner.objects {
            if !namespace.is_empty() && ns != namespace {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if matches_selector(obj.labels(), selector) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let name = match (&obj.meta().name, &obj.meta().generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => format!("{prefix}{}", random_suffix()),
            _ => {
                return Err(Error::Rejected {
                    name: K::kind(&()).to_string(),
                    reason: "name or generateName is required".to_string(),
                })
            }
        };
        let mut inner = self.lock();
        inner.injected(WriteOp::Create, &format!("{} {namespace}/{name}", K::kind(&())))?;
        let key = (namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "{} {namespace}/{name}",
                K::kind(&())
            )));
        }
        inner.resource_version += 1;
        inner.uid += 1;
        let meta = obj.meta_mut();
        meta.name = Some(name);
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("uid-{}", inner.uid));
        meta.resource_version = Some(inner.resource_version.to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        let mut value = serde_json::to_value(&obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        let out: K = serde_json::from_value(value.clone())?;
        inner.objects.insert(key, value);
        inner.writes += 1;
        Ok(out)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        self.write(WriteOp::Replace, namespace, obj, |stored, incoming| {
            let status = stored.get("status").cloned();
            let uid = stored.pointer("/metadata/uid").cloned();
            let created = stored.pointer("/metadata/creationTimestamp").cloned();
            *stored = incoming;
            if let Some(map) = stored.as_object_mut() {
                match status {
                    Some(status) => map.insert("status".to_string(), status),
                    None => map.remove("status"),
                };
            }
            if let Some(uid) = uid {
                stored["metadata"]["uid"] = uid;
            }
            if let Some(created) = created {
                stored["metadata"]["creationTimestamp"] = created;
            }
        })
    }

    async fn replace_status(&self, namespace: &str, obj: &K) -> Result<K> {
        self.write(WriteOp::ReplaceStatus, namespace, obj, |stored, incoming| {
            if let Some(map) = stored.as_object_mut() {
                match incoming.get("status") {
                    Some(status) => map.insert("status".to_string(), status.clone()),
                    None => map.remove("status"),
                };
            }
        })
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.injected(WriteOp::Delete, &format!("{} {namespace}/{name}", K::kind(&())))?;
        match inner
            .objects
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => {
                inner.writes += 1;
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "{} {namespace}/{name}",
                K::kind(&())
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthouseJob, LighthouseJobSpec, LighthouseJobStatus, PipelineState};

    fn job(name: &str) -> LighthouseJob {
        let mut job = LighthouseJob::new(name, LighthouseJobSpec::default());
        job.metadata.namespace = Some("jx".to_string());
        job
    }

    #[tokio::test]
    async fn test_create_drops_status_and_rejects_duplicates() {
        let store = MemoryStore::<LighthouseJob>::new();
        let mut obj = job("a");
        obj.status = Some(LighthouseJobStatus::default());
        let created = store.create("jx", &obj).await.unwrap();
        assert!(created.status.is_none());
        assert!(created.metadata.uid.is_some());

        let err = store.create("jx", &obj).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MemoryStore::<LighthouseJob>::new();
        let created = store.create("jx", &job("a")).await.unwrap();

        let mut first = created.clone();
        first.status = Some(LighthouseJobStatus {
            state: PipelineState::Pending,
            ..LighthouseJobStatus::default()
        });
        store.replace_status("jx", &first).await.unwrap();

        let mut second = created;
        second.status = Some(LighthouseJobStatus {
            state: PipelineState::Error,
            ..LighthouseJobStatus::default()
        });
        let err = store.replace_status("jx", &second).await.unwrap_err();
        assert!(err.is_conflict());

        let stored = store.get("jx", "a").await.unwrap().unwrap();
        assert_eq!(stored.state(), Some(PipelineState::Pending));
    }

    #[tokio::test]
    async fn test_replace_keeps_status_and_status_keeps_labels() {
        let store = MemoryStore::<LighthouseJob>::new();
        let mut obj = job("a");
        obj.status = Some(LighthouseJobStatus {
            state: PipelineState::Running,
            ..LighthouseJobStatus::default()
        });
        let stored = store.insert(obj).unwrap();

        let mut relabel = stored.clone();
        relabel.labels_mut().insert("k".into(), "v".into());
        relabel.status = None;
        let relabelled = store.replace("jx", &relabel).await.unwrap();
        assert_eq!(relabelled.state(), Some(PipelineState::Running));
        assert_eq!(relabelled.labels()["k"], "v");

        let mut status_write = relabelled.clone();
        status_write.labels_mut().clear();
        status_write.status.as_mut().unwrap().state = PipelineState::Success;
        let written = store.replace_status("jx", &status_write).await.unwrap();
        assert_eq!(written.labels()["k"], "v");
        assert_eq!(written.state(), Some(PipelineState::Success));
    }

    #[tokio::test]
    async fn test_generate_name_and_selector_list() {
        let store = MemoryStore::<LighthouseJob>::new();
        let mut obj = LighthouseJob::new("", LighthouseJobSpec::default());
        obj.metadata.name = None;
        obj.metadata.generate_name = Some("build-".to_string());
        obj.labels_mut().insert("team".into(), "web".into());
        let created = store.create("jx", &obj).await.unwrap();
        assert!(created.name_any().starts_with("build-"));
        assert_eq!(created.name_any().len(), "build-".len() + 5);

        let selector = BTreeMap::from([("team".to_string(), "web".to_string())]);
        assert_eq!(store.list("jx", &selector).await.unwrap().len(), 1);
        assert_eq!(store.list("other", &selector).await.unwrap().len(), 0);
        assert_eq!(store.list("", &BTreeMap::new()).await.unwrap().len(), 1);
    }
}
