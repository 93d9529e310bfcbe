//! The controller loop shared by every reconciler.
//!
//! One queue, one token bucket, one worker:
//! `get → wait for token → sync → forget or requeue with backoff → done`.

use super::Reconciler;
use crate::error::{OperatorError, Result};
use crate::queue::{Enqueuer, QueueHandle, TokenBucket, WorkQueue};
use crate::watch::CacheSync;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs one reconciler off its own work queue.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    limiter: TokenBucket,
    cache_syncs: Vec<CacheSync>,
    initial_keys: Vec<R::Key>,
    cache_sync_timeout: Duration,
}

impl<R: Reconciler> Controller<R> {
    /// Create a controller over an existing queue. `qps`/`burst` bound how
    /// often `sync` may run, whatever the queue holds.
    pub fn new(reconciler: R, queue: Arc<WorkQueue<R::Key>>, qps: f64, burst: u32) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue,
            limiter: TokenBucket::new(qps, burst),
            cache_syncs: Vec::new(),
            initial_keys: Vec::new(),
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
        }
    }

    /// Caches that must finish their first listing before the first sync.
    pub fn with_cache_syncs(mut self, cache_syncs: Vec<CacheSync>) -> Self {
        self.cache_syncs.extend(cache_syncs);
        self
    }

    /// Keys enqueued once, right after the caches have synced.
    pub fn with_initial_key(mut self, key: R::Key) -> Self {
        self.initial_keys.push(key);
        self
    }

    pub fn with_cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    pub fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    pub fn queue(&self) -> &Arc<WorkQueue<R::Key>> {
        &self.queue
    }

    pub fn enqueuer(&self, key: R::Key) -> Enqueuer<R::Key> {
        Enqueuer::new(Arc::clone(&self.queue), key)
    }

    /// Run until `shutdown` fires. `workers` is accepted for interface
    /// compatibility; exactly one worker is started.
    ///
    /// Returns an error only if the caches never sync.
    pub async fn run(self, workers: usize, shutdown: CancellationToken) -> Result<()> {
        let name = self.name();
        info!(controller = name, "Starting controller");
        if workers != 1 {
            debug!(controller = name, workers, "Ignoring worker count, running a single worker");
        }

        if let Err(e) = self.wait_for_cache_sync(&shutdown).await {
            error!(controller = name, error = %e, "Caches did not sync");
            self.queue.shut_down();
            return Err(e);
        }

        for key in &self.initial_keys {
            self.queue.add(key.clone());
        }

        let worker = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while self.process_next_work_item(&shutdown).await {}
                self
            })
        };

        shutdown.cancelled().await;
        info!(controller = name, "Shutting down controller");

        match worker.await {
            Ok(controller) => controller.queue.shut_down(),
            Err(e) => error!(controller = name, error = %e, "Worker task failed"),
        }
        Ok(())
    }

    async fn wait_for_cache_sync(&self, shutdown: &CancellationToken) -> Result<()> {
        if self.cache_syncs.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self.cache_syncs.iter().map(|c| c.name()).collect();
        debug!(controller = self.name(), caches = ?names, "Waiting for caches to sync");

        let all_synced = try_join_all(self.cache_syncs.iter().cloned().map(CacheSync::wait));
        tokio::select! {
            result = tokio::time::timeout(self.cache_sync_timeout, all_synced) => match result {
                Ok(synced) => synced.map(|_| ()),
                Err(_) => Err(OperatorError::CacheSync(format!(
                    "timed out after {:?} waiting for {}",
                    self.cache_sync_timeout,
                    names.join(", ")
                ))),
            },
            _ = shutdown.cancelled() => Err(OperatorError::CacheSync(
                "shutdown requested before caches synced".to_string(),
            )),
        }
    }

    /// Handle one key. Returns `false` when the worker should exit.
    async fn process_next_work_item(&self, shutdown: &CancellationToken) -> bool {
        let key = tokio::select! {
            key = self.queue.get() => match key {
                Some(key) => key,
                None => return false,
            },
            _ = shutdown.cancelled() => return false,
        };

        // wait for a token before every sync so a flood of events cannot hot loop
        tokio::select! {
            _ = self.limiter.accept() => {}
            _ = shutdown.cancelled() => {
                self.queue.done(&key);
                return false;
            }
        }

        let handle = QueueHandle::new(Arc::clone(&self.queue));
        match self.reconciler.sync(&key, &handle).await {
            Ok(()) => {
                debug!(controller = self.name(), ?key, "Sync succeeded");
                self.queue.forget(&key);
            }
            Err(e) => {
                error!(controller = self.name(), ?key, error = %e, "Sync failed");
                if self.queue.is_shutting_down() {
                    warn!(controller = self.name(), ?key, "Not requeueing, queue is shutting down");
                } else {
                    self.queue.add_rate_limited(key.clone());
                }
            }
        }
        self.queue.done(&key);
        true
    }
}
