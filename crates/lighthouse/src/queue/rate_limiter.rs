//! Requeue delays: per-key exponential backoff combined with a shared token bucket.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);
pub const DEFAULT_QPS: f64 = 1000.0;
pub const DEFAULT_BURST: u32 = 50_000;

struct TokenBucket {
    tokens: f64,
    last: Instant,
    qps: f64,
    burst: f64,
}

impl TokenBucket {
    /// Take one token, returning how long the caller must wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Delay is `max(base * 2^failures capped at max, token bucket wait)`.
pub struct RateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
    bucket: Mutex<TokenBucket>,
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    #[must_use]
    pub fn new(base: Duration, max: Duration, qps: f64, burst: u32) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket {
                tokens: f64::from(burst),
                last: Instant::now(),
                qps,
                burst: f64::from(burst),
            }),
        }
    }

    /// Delay before `key` is retried; counts one more failure for it.
    pub fn when(&self, key: &K) -> Duration {
        let backoff = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(key.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            self.backoff(exp)
        };
        let wait = lock(&self.bucket).reserve(Instant::now());
        backoff.max(wait)
    }

    fn backoff(&self, exp: u32) -> Duration {
        if exp >= 32 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_is_capped() {
        let limiter = RateLimiter::<&str>::default();
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&"a"), 3);

        for _ in 0..40 {
            limiter.when(&"c");
        }
        assert_eq!(limiter.when(&"c"), DEFAULT_MAX_DELAY);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_delays_once_burst_is_spent() {
        let limiter = RateLimiter::new(Duration::ZERO, Duration::from_secs(1), 10.0, 2);
        assert_eq!(limiter.when(&1), Duration::ZERO);
        assert_eq!(limiter.when(&2), Duration::ZERO);
        assert_eq!(limiter.when(&3), Duration::from_millis(100));
        assert_eq!(limiter.when(&4), Duration::from_millis(200));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.when(&5), Duration::ZERO);
    }
}
