//! Cluster store seam.
//!
//! Reconcilers never talk to `kube::Api` directly; they go through [`Store`],
//! which is backed by the API server in production ([`KubeStore`]) and by an
//! in-memory map in tests ([`MemoryStore`]). Both implementations share the
//! same optimistic-concurrency and status-subresource semantics.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, WriteOp};

/// Namespaced resources the store can hold.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// CRUD over one resource kind.
///
/// Writes carry the object's `resourceVersion`; a stale version fails with
/// [`crate::Error::Conflict`]. `replace` ignores status and `replace_status`
/// ignores everything but status, as the API server does for resources with
/// a status subresource.
#[async_trait]
pub trait Store<K: Object>: Send + Sync {
    /// Fetch by name; `None` when absent.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects carrying every label in `selector`. An empty namespace lists all namespaces.
    async fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>>;

    /// Create; the status is ignored. Fails with `AlreadyExists` on a name clash.
    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace metadata and spec.
    async fn replace(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace the status subresource.
    async fn replace_status(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Delete by name; `NotFound` when absent.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Render a label selector map as `k=v,k2=v2`.
#[must_use]
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` contains every entry of `selector`.
#[must_use]
pub fn matches_selector(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
