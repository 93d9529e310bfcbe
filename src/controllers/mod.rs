//! Controllers for the service catalog API server operator
//!
//! Each controller pairs a [`Reconciler`] with the shared [`Controller`]
//! loop. Controllers are level-triggered: the queue only says "something
//! changed", and `sync` re-derives every decision from the cluster store.

mod config_observer;
mod finalizer;
mod runner;
mod workload;

pub use config_observer::{ConfigObserverReconciler, ObserverKey};
pub use finalizer::{remove_finalizer, FinalizerKey, FinalizerReconciler};
pub use runner::Controller;
pub use workload::{WorkloadKey, WorkloadReconciler};

use crate::error::Result;
use crate::queue::{QueueHandle, WorkKey};

/// A component with one idempotent `sync` operation.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Queue key type. The reconcilers in this crate use zero-size keys.
    type Key: WorkKey;

    /// Controller name for logging
    fn name(&self) -> &'static str;

    /// Compare declared and observed state and take the minimal corrective
    /// action. Errors are retried with backoff by the controller loop.
    async fn sync(&self, key: &Self::Key, queue: &QueueHandle<Self::Key>) -> Result<()>;
}
