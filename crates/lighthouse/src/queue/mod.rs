//! Deduplicating work queue shared by a controller's workers.
//!
//! A key is held at most once in the queue. A key added while a worker is
//! processing it is parked as dirty and queued again when the worker calls
//! [`WorkQueue::done`], so no change is lost and no key is processed twice
//! at the same time.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

pub mod rate_limiter;

pub use rate_limiter::RateLimiter;

/// Work item: which kind of object changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Job { namespace: String, name: String },
    PipelineRun { namespace: String, name: String },
}

impl QueueKey {
    pub fn job(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        QueueKey::Job {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn pipeline_run(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        QueueKey::PipelineRun {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKey::Job { namespace, name } => write!(f, "job:::{namespace}/{name}"),
            QueueKey::PipelineRun { namespace, name } => write!(f, "pr:::{namespace}/{name}"),
        }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: RateLimiter<K>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_rate_limiter(RateLimiter::default())
    }

    #[must_use]
    pub fn with_rate_limiter(limiter: RateLimiter<K>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already queued. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after its backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Next key to process; `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys; workers drain what is queued and then see `None`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
