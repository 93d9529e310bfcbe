//! Deduplicating, rate-limited FIFO of work keys.

use super::rate_limiter::{QueueRateLimiter, RateLimiter};
use super::WorkKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A work queue in the style of the Kubernetes controller queues.
///
/// - A key is held at most once while pending (`dirty`).
/// - A key being processed is never handed out again until [`done`](Self::done);
///   re-adding it meanwhile marks it dirty and it is re-queued on `done`.
/// - Delayed adds are deduplicated per key, keeping the earliest ready time.
pub struct WorkQueue<K: WorkKey> {
    name: String,
    inner: Mutex<Inner<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    shutdown: CancellationToken,
}

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: WorkKey> WorkQueue<K> {
    /// Create a queue with the default controller rate limiter.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_rate_limiter(name, QueueRateLimiter::default())
    }

    pub fn with_rate_limiter(
        name: impl Into<String>,
        limiter: impl RateLimiter<K> + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a key as needing processing.
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&key) {
            return;
        }
        inner.dirty.insert(key.clone());
        if inner.processing.contains(&key) {
            return;
        }
        trace!(queue = %self.name, ?key, "Queued key");
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Add the key after `delay`. Multiple waiting adds for one key collapse
    /// into the earliest.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            match inner.waiting.get(&key) {
                Some(existing) if *existing <= ready_at => return,
                _ => {
                    inner.waiting.insert(key.clone(), ready_at);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => {}
                _ = queue.shutdown.cancelled() => return,
            }
            let fire = {
                let mut inner = queue.lock();
                // A later add_after with an earlier ready time supersedes us.
                if inner.waiting.get(&key) == Some(&ready_at) {
                    inner.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(key);
            }
        });
    }

    /// Re-add the key once the rate limiter says it is allowed.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        trace!(queue = %self.name, ?key, ?delay, "Rate limited requeue");
        self.add_after(key, delay);
    }

    /// Stop tracking failures for the key.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// How many times the key has been requeued through the rate limiter.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// empty. The caller must call [`done`](Self::done) with the key.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark processing of the key as finished.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting `get`.
    pub fn shut_down(&self) {
        {
            let mut inner = self.lock();
            inner.shutting_down = true;
            inner.waiting.clear();
        }
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys pending (not counting keys in processing).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
