//! Hot reload of ConfigMap-backed configuration.

use std::sync::{Arc, Mutex, PoisonError};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::ConfigKind;
use crate::error::{Error, Result};

/// Publishes the latest valid configuration of kind `T`.
///
/// Readers take one snapshot per handler invocation with [`ConfigAgent::config`].
pub struct ConfigAgent<T> {
    tx: watch::Sender<Arc<T>>,
    raw: Mutex<Option<String>>,
}

impl<T: ConfigKind> ConfigAgent<T> {
    #[must_use]
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self {
            tx,
            raw: Mutex::new(None),
        }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<T> {
        Arc::clone(&self.tx.borrow())
    }

    /// Receiver notified on every published change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }

    /// Parse `raw` and publish it. Returns `false` when the text is unchanged.
    /// On error the previous configuration stays in place.
    pub fn apply_raw(&self, raw: &str) -> Result<bool> {
        let mut last = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == Some(raw) {
            return Ok(false);
        }
        let parsed = T::parse(raw)?;
        self.tx.send_replace(Arc::new(parsed));
        *last = Some(raw.to_string());
        Ok(true)
    }

    /// Apply the document stored under [`ConfigKind::KEY`] of `cm`.
    pub fn apply(&self, cm: &ConfigMap) -> Result<bool> {
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(T::KEY))
            .ok_or_else(|| {
                Error::Config(format!("ConfigMap {} has no key {}", cm.name_any(), T::KEY))
            })?;
        self.apply_raw(raw)
    }

    /// Follow ConfigMap `name` until `shutdown` fires.
    #[instrument(skip(self, client, shutdown), fields(key = T::KEY))]
    pub async fn watch(
        self: Arc<Self>,
        client: Client,
        namespace: String,
        name: String,
        shutdown: CancellationToken,
    ) {
        let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let mut stream = watcher(api, config).applied_objects().boxed();
        info!(configmap = %name, "Watching configuration");
        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = stream.try_next() => next,
            };
            match next {
                Ok(Some(cm)) => match self.apply(&cm) {
                    Ok(true) => info!(configmap = %name, "Configuration reloaded"),
                    Ok(false) => {}
                    Err(e) => {
                        error!(configmap = %name, error = %e, "Keeping previous configuration");
                    }
                },
                Ok(None) => break,
                Err(e) => warn!(configmap = %name, error = %e, "Configuration watch error"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::BTreeMap;

    fn config_map(raw: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(Config::KEY.to_string(), raw.to_string())])),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn test_bad_document_keeps_previous_config() {
        let agent = ConfigAgent::new(Config::default());
        assert!(agent.apply(&config_map("jenkins: {max_goroutines: 3}")).unwrap());
        assert_eq!(agent.config().jenkins.max_goroutines, 3);

        assert!(agent.apply(&config_map("jenkins: [")).is_err());
        assert_eq!(agent.config().jenkins.max_goroutines, 3);

        assert!(agent.apply(&ConfigMap::default()).is_err());
        assert_eq!(agent.config().jenkins.max_goroutines, 3);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes_once() {
        let agent = ConfigAgent::new(Config::default());
        let mut rx = agent.subscribe();
        assert!(agent.apply_raw("git_kind: gitlab").unwrap());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().git_kind, "gitlab");

        assert!(!agent.apply_raw("git_kind: gitlab").unwrap());
        assert!(!rx.has_changed().unwrap());
    }
}
