//! Work queue substrate shared by all controllers.
//!
//! Controllers never pass a queue around directly. The watch layer gets an
//! [`Enqueuer`], which can only push the controller's constant key, and a
//! reconciler gets a [`QueueHandle`] for the few cases where `sync` needs to
//! schedule an extra rate-limited retry.

mod rate_limiter;
mod work_queue;

pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialBackoff, QueueRateLimiter, RateLimiter, TokenBucket,
    DEFAULT_SYNC_BURST, DEFAULT_SYNC_QPS,
};
pub use work_queue::WorkQueue;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Anything usable as a queue key.
pub trait WorkKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> WorkKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Capability to enqueue one fixed key. Handed to watch subscriptions.
#[derive(Clone)]
pub struct Enqueuer<K: WorkKey> {
    queue: Arc<WorkQueue<K>>,
    key: K,
}

impl<K: WorkKey> Enqueuer<K> {
    pub fn new(queue: Arc<WorkQueue<K>>, key: K) -> Self {
        Self { queue, key }
    }

    pub fn enqueue(&self) {
        self.queue.add(self.key.clone());
    }
}

/// Capability to schedule a rate-limited retry. Handed to `sync`.
#[derive(Clone)]
pub struct QueueHandle<K: WorkKey> {
    queue: Arc<WorkQueue<K>>,
}

impl<K: WorkKey> QueueHandle<K> {
    pub fn new(queue: Arc<WorkQueue<K>>) -> Self {
        Self { queue }
    }

    pub fn add_rate_limited(&self, key: K) {
        self.queue.add_rate_limited(key);
    }
}
