//! Reconcilers and the worker plumbing they share.
//!
//! Informers only enqueue keys. Workers pop keys from a [`WorkQueue`],
//! re-fetch the object and reconcile it, so a handler never trusts the
//! payload of the event that woke it.

use std::fmt::Display;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, StreamExt, TryStreamExt};
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crds::{LighthouseJob, PipelineState};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::store::{Object, Store};

pub mod jenkins;
pub mod rerun;
pub mod tekton;

pub use self::jenkins::JenkinsController;
pub use rerun::RerunReconciler;
pub use tekton::TektonReconciler;

/// Status writes retried after losing an optimistic-concurrency race
const STATUS_WRITE_ATTEMPTS: u32 = 5;
const MAX_DESCRIPTION_LENGTH: usize = 256;

/// Handler invoked by a worker for one key.
#[async_trait]
pub trait Reconcile<K>: Send + Sync {
    async fn reconcile(&self, key: &K) -> Result<()>;
}

/// Run `workers` workers over `queue` until it is shut down and drained.
pub async fn run_workers<K, R>(
    controller: &'static str,
    queue: Arc<WorkQueue<K>>,
    reconciler: Arc<R>,
    workers: usize,
) where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    R: Reconcile<K> + ?Sized + 'static,
{
    info!(controller, workers, "Starting workers");
    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { worker(controller, &queue, reconciler.as_ref()).await })
        })
        .collect();
    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            error!(controller, error = %e, "Worker task failed");
        }
    }
    info!(controller, "Workers stopped");
}

async fn worker<K, R>(controller: &'static str, queue: &Arc<WorkQueue<K>>, reconciler: &R)
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    R: Reconcile<K> + ?Sized,
{
    while let Some(key) = queue.get().await {
        let outcome = AssertUnwindSafe(reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => queue.forget(&key),
            Ok(Err(e)) if e.is_malformed() => {
                warn!(controller, key = %key, error = %e, "Dropping key");
                queue.forget(&key);
            }
            Ok(Err(e)) => {
                warn!(
                    controller,
                    key = %key,
                    error = %e,
                    requeues = queue.num_requeues(&key),
                    "Reconcile failed, requeueing"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(_) => {
                error!(controller, key = %key, "Reconcile panicked, requeueing");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
}

/// Feed keys for every applied `K` into `queue` until `shutdown` fires.
///
/// With `resync` set, every object is listed and enqueued again on that period.
pub async fn feed<K, Q, F>(
    api: Api<K>,
    config: watcher::Config,
    queue: Arc<WorkQueue<Q>>,
    to_key: F,
    resync: Option<Duration>,
    shutdown: CancellationToken,
) where
    K: Object,
    Q: Clone + Eq + Hash + Send + Sync + 'static,
    F: Fn(&K) -> Option<Q> + Send + Sync,
{
    let mut events = watcher(api.clone(), config.clone())
        .default_backoff()
        .applied_objects()
        .boxed();
    let mut ticker = tokio::time::interval(resync.unwrap_or(Duration::from_secs(3600)));
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick(), if resync.is_some() => {
                let params = ListParams {
                    label_selector: config.label_selector.clone(),
                    field_selector: config.field_selector.clone(),
                    ..ListParams::default()
                };
                match api.list(&params).await {
                    Ok(list) => list.items.iter().filter_map(&to_key).for_each(|k| queue.add(k)),
                    Err(e) => warn!(kind = %K::kind(&()), error = %e, "Resync list failed"),
                }
            }
            next = events.try_next() => match next {
                Ok(Some(obj)) => {
                    if let Some(key) = to_key(&obj) {
                        queue.add(key);
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(kind = %K::kind(&()), error = %e, "Watch error"),
            },
        }
    }
    debug!(kind = %K::kind(&()), "Informer stopped");
}

/// Re-fetch a job, let `mutate` change it and write its status.
///
/// `mutate` returns whether it changed anything; nothing is written otherwise.
/// Conflicts re-run the whole cycle against a fresh copy. Returns the stored
/// job, or `None` if it no longer exists.
pub async fn update_job_status<F>(
    jobs: &dyn Store<LighthouseJob>,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<LighthouseJob>>
where
    F: FnMut(&mut LighthouseJob) -> bool + Send,
{
    for _ in 0..STATUS_WRITE_ATTEMPTS {
        let Some(mut job) = jobs.get(namespace, name).await? else {
            return Ok(None);
        };
        if !mutate(&mut job) {
            return Ok(Some(job));
        }
        match jobs.replace_status(namespace, &job).await {
            Ok(written) => return Ok(Some(written)),
            Err(e) if e.is_conflict() => {
                debug!(job = %name, "Status write conflicted, retrying");
            }
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!("LighthouseJob {namespace}/{name}")))
}

/// Move an admitted, non-terminal job to `state` with `description`.
pub async fn finish_job(
    jobs: &dyn Store<LighthouseJob>,
    job: &LighthouseJob,
    state: PipelineState,
    description: &str,
) -> Result<Option<LighthouseJob>> {
    let namespace = job.namespace().unwrap_or_default();
    let description = truncate(description, MAX_DESCRIPTION_LENGTH);
    let now = Utc::now();
    update_job_status(jobs, &namespace, &job.name_any(), |j| {
        let Some(status) = j.status.as_mut() else {
            return false;
        };
        if status.state.is_terminal() {
            return false;
        }
        status.transition(state, now);
        status.description.clone_from(&description);
        if let Some(activity) = status.activity.as_mut() {
            activity.status = state;
            activity.completion_time.get_or_insert(now);
        }
        true
    })
    .await
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        value.to_string()
    } else {
        value.chars().take(limit).collect()
    }
}

/// Namespace a job's pipeline runs live in.
#[must_use]
pub fn run_namespace(job: &LighthouseJob) -> String {
    if job.spec.namespace.is_empty() {
        job.namespace().unwrap_or_default()
    } else {
        job.spec.namespace.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{LighthouseJobSpec, LighthouseJobStatus};
    use crate::queue::QueueKey;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        calls: AtomicU32,
        seen: Mutex<Vec<QueueKey>>,
    }

    #[async_trait]
    impl Reconcile<QueueKey> for Scripted {
        async fn reconcile(&self, key: &QueueKey) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(key.clone());
            match n {
                0 => panic!("first attempt blows up"),
                1 => Err(Error::Conflict("job".into())),
                2 => Err(Error::EmptyBuildId),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panics_and_transient_errors_requeue() {
        let queue = WorkQueue::new();
        let reconciler = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let key = QueueKey::job("jx", "a");
        queue.add(key.clone());

        let runner = tokio::spawn(run_workers("test", Arc::clone(&queue), Arc::clone(&reconciler), 1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.shut_down();
        runner.await.unwrap();

        // panic, conflict, then a malformed error that is not retried
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    fn admitted(name: &str) -> LighthouseJob {
        let mut job = LighthouseJob::new(name, LighthouseJobSpec::default());
        job.metadata.namespace = Some("jx".into());
        job.status = Some(LighthouseJobStatus::default());
        job
    }

    #[tokio::test]
    async fn test_update_status_skips_unchanged_and_missing() {
        let store = MemoryStore::new();
        store.insert(admitted("a")).unwrap();
        let before = store.writes();

        let out = update_job_status(&store, "jx", "a", |_| false).await.unwrap();
        assert!(out.is_some());
        assert_eq!(store.writes(), before);

        let out = update_job_status(&store, "jx", "gone", |_| true).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_finish_job_never_leaves_terminal_state() {
        let store = MemoryStore::new();
        let job = store.insert(admitted("a")).unwrap();

        let done = finish_job(&store, &job, PipelineState::Aborted, "superseded")
            .await
            .unwrap()
            .unwrap();
        let status = done.status.unwrap();
        assert_eq!(status.state, PipelineState::Aborted);
        assert!(status.completion_time.is_some());

        finish_job(&store, &job, PipelineState::Error, "late")
            .await
            .unwrap();
        let stored = store.get("jx", "a").await.unwrap().unwrap();
        assert_eq!(stored.state(), Some(PipelineState::Aborted));
        assert_eq!(stored.status.unwrap().description, "superseded");
    }
}
