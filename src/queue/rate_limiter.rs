//! Rate limiting primitives for the controller loop.
//!
//! Two independent mechanisms live here:
//!
//! - [`TokenBucket`]: a global ceiling on attempts per unit time (steady rate
//!   plus burst). Controllers await a token before every sync.
//! - [`ItemExponentialBackoff`]: per-key failure backoff used by
//!   [`WorkQueue::add_rate_limited`](super::WorkQueue::add_rate_limited).
//!
//! [`QueueRateLimiter`] combines the per-key backoff with an overall bucket by
//! taking the larger of the two delays.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Steady rate for controller sync attempts: one every 20 seconds.
pub const DEFAULT_SYNC_QPS: f64 = 0.05;
/// Burst allowance on top of the steady sync rate.
pub const DEFAULT_SYNC_BURST: u32 = 4;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1000);
const DEFAULT_QUEUE_QPS: f64 = 10.0;
const DEFAULT_QUEUE_BURST: u32 = 100;

/// Token bucket with a steady refill rate and a burst capacity.
///
/// Tokens may go negative: each reservation takes a token immediately and
/// reports how long the caller has to wait before it is really available.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Take a token and return the delay until it may be used.
    pub fn reserve(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst as f64);
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }

    /// Take a token without waiting, failing if none is available right now.
    #[cfg(test)]
    fn try_accept(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst as f64);
        state.last = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available.
    pub async fn accept(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Computes requeue delays for failed keys.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before the key should be retried; records a failure.
    fn when(&self, key: &K) -> Duration;
    /// Clear the failure history of a key.
    fn forget(&self, key: &K);
    /// Number of failures recorded for a key since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let factor = 2f64.powi(exp.min(63) as i32);
        let backoff = self.base.as_secs_f64() * factor;
        if !backoff.is_finite() || backoff > self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Overall bucket limiter: every retry, whatever the key, takes a token.
#[derive(Debug)]
pub struct BucketRateLimiter {
    bucket: TokenBucket,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: TokenBucket::new(qps, burst),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        self.bucket.reserve()
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Default work queue limiter: the larger of per-key exponential backoff and
/// an overall 10 qps / 100 burst bucket.
pub struct QueueRateLimiter<K> {
    item: ItemExponentialBackoff<K>,
    overall: BucketRateLimiter,
}

impl<K: Eq + Hash + Clone> QueueRateLimiter<K> {
    pub fn new(item: ItemExponentialBackoff<K>, overall: BucketRateLimiter) -> Self {
        Self { item, overall }
    }
}

impl<K: Eq + Hash + Clone> Default for QueueRateLimiter<K> {
    fn default() -> Self {
        Self::new(
            ItemExponentialBackoff::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX),
            BucketRateLimiter::new(DEFAULT_QUEUE_QPS, DEFAULT_QUEUE_BURST),
        )
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for QueueRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let item = self.item.when(key);
        let overall = RateLimiter::<K>::when(&self.overall, key);
        item.max(overall)
    }

    fn forget(&self, key: &K) {
        self.item.forget(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.item.num_requeues(key)
    }
}
