//! Watch subscriptions feeding the controllers.
//!
//! Every subscription mirrors one kind (optionally scoped to a namespace)
//! into a read-only [`Informer`] store and enqueues the owning controller's
//! key on any add, update or delete that passes its filter. The subscription
//! can only enqueue; it never calls into the reconciler.

use crate::error::{OperatorError, Result};
use crate::queue::{Enqueuer, WorkKey};
use futures::{future, StreamExt};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read-only view over mirrored objects of one kind.
pub trait Lister<K: Resource>: Send + Sync {
    /// Every mirrored object.
    fn list(&self) -> Vec<Arc<K>>;

    /// Whether the initial listing has been mirrored.
    fn has_synced(&self) -> bool;

    /// Objects in the given namespace.
    fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>> {
        self.list()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .collect()
    }

    /// Object with the given name (cluster-scoped kinds).
    fn get(&self, name: &str) -> Option<Arc<K>> {
        self.list().into_iter().find(|obj| obj.name_any() == name)
    }
}

/// Barrier resolving once a watch cache has completed its first listing.
#[derive(Clone, Debug)]
pub struct CacheSync {
    name: String,
    synced: watch::Receiver<bool>,
}

impl CacheSync {
    pub fn new(name: impl Into<String>, synced: watch::Receiver<bool>) -> Self {
        Self {
            name: name.into(),
            synced,
        }
    }

    /// A barrier that is already passed.
    pub fn ready(name: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(true);
        Self::new(name, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the initial listing. Fails if the watch stops first.
    pub async fn wait(mut self) -> Result<()> {
        if self.is_synced() {
            return Ok(());
        }
        self.synced
            .wait_for(|synced| *synced)
            .await
            .map(|_| ())
            .map_err(|_| OperatorError::CacheSync(format!("{} watch stopped before syncing", self.name)))
    }
}

/// Mirrored store of one kind, plus its sync state.
#[derive(Clone)]
pub struct Informer<K: Resource + Clone + 'static>
where
    K::DynamicType: Eq + Hash + Clone,
{
    store: Store<K>,
    cache_sync: CacheSync,
}

impl<K> Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    pub fn cache_sync(&self) -> CacheSync {
        self.cache_sync.clone()
    }
}

impl<K> Lister<K> for Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    fn has_synced(&self) -> bool {
        self.cache_sync.is_synced()
    }
}

/// Filter accepting only the object called `name`.
pub fn named_only<K>(name: impl Into<String>) -> impl Fn(&K) -> bool + Send + 'static
where
    K: Resource + 'static,
{
    let name = name.into();
    move |obj: &K| obj.meta().name.as_deref() == Some(name.as_str())
}

/// Enqueue for any object change accepted by `filter`, and mark the cache
/// synced once the initial listing is done.
fn route_event<K, Key, F>(
    event: watcher::Event<K>,
    filter: &F,
    enqueuer: &Enqueuer<Key>,
    synced: &watch::Sender<bool>,
) where
    Key: WorkKey,
    F: Fn(&K) -> bool,
{
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) | watcher::Event::Delete(obj) => {
            if filter(&obj) {
                enqueuer.enqueue();
            }
        }
        watcher::Event::InitDone => {
            synced.send_replace(true);
        }
        watcher::Event::Init => {}
    }
}

/// Fans watch events from several kinds into one controller's queue.
pub struct EventRouter<Key: WorkKey> {
    enqueuer: Enqueuer<Key>,
    shutdown: CancellationToken,
    cache_syncs: Vec<CacheSync>,
}

impl<Key: WorkKey> EventRouter<Key> {
    pub fn new(enqueuer: Enqueuer<Key>, shutdown: CancellationToken) -> Self {
        Self {
            enqueuer,
            shutdown,
            cache_syncs: Vec::new(),
        }
    }

    /// Watch every object the API returns.
    pub fn watch<K>(&mut self, api: Api<K>, config: watcher::Config) -> Informer<K>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    {
        self.watch_filtered(api, config, |_: &K| true)
    }

    /// Watch the API, enqueueing only for objects accepted by `filter`. The
    /// store still mirrors everything the API returns.
    pub fn watch_filtered<K, F>(
        &mut self,
        api: Api<K>,
        config: watcher::Config,
        filter: F,
    ) -> Informer<K>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
        F: Fn(&K) -> bool + Send + 'static,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let (store, writer) = reflector::store();
        let (synced_tx, synced_rx) = watch::channel(false);
        let cache_sync = CacheSync::new(kind.clone(), synced_rx);
        self.cache_syncs.push(cache_sync.clone());

        let enqueuer = self.enqueuer.clone();
        let shutdown = self.shutdown.clone();
        let stream = watcher(api, config).default_backoff().reflect(writer);

        tokio::spawn(async move {
            debug!(kind = %kind, "Starting watch");
            let log_kind = kind.clone();
            let events = stream.for_each(move |event| {
                match event {
                    Ok(event) => route_event(event, &filter, &enqueuer, &synced_tx),
                    Err(e) => warn!(kind = %kind, error = %e, "Watch error"),
                }
                future::ready(())
            });

            tokio::select! {
                _ = events => {}
                _ = shutdown.cancelled() => {}
            }
            debug!(kind = %log_kind, "Watch stopped");
        });

        Informer { store, cache_sync }
    }

    /// Barriers for every subscription created through this router.
    pub fn cache_syncs(&self) -> Vec<CacheSync> {
        self.cache_syncs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use crate::testing::{namespace, pod};
    use k8s_openapi::api::core::v1::{Namespace, Pod};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct Singleton;

    fn enqueuer() -> (Arc<WorkQueue<Singleton>>, Enqueuer<Singleton>) {
        let queue = WorkQueue::new("watch");
        let enqueuer = Enqueuer::new(Arc::clone(&queue), Singleton);
        (queue, enqueuer)
    }

    #[tokio::test]
    async fn test_object_events_enqueue_the_key() {
        let (queue, enqueuer) = enqueuer();
        let (tx, _rx) = watch::channel(false);
        let accept_all = |_: &Pod| true;

        route_event(watcher::Event::InitApply(pod("ns", "a")), &accept_all, &enqueuer, &tx);
        route_event(watcher::Event::Apply(pod("ns", "a")), &accept_all, &enqueuer, &tx);
        route_event(watcher::Event::Delete(pod("ns", "a")), &accept_all, &enqueuer, &tx);
        assert_eq!(queue.len(), 1);
        assert!(!*tx.borrow());
    }

    #[tokio::test]
    async fn test_filtered_out_objects_do_not_enqueue() {
        let (queue, enqueuer) = enqueuer();
        let (tx, _rx) = watch::channel(false);
        let target = "openshift-service-catalog-apiserver";
        let only_target = named_only::<Namespace>(target);

        for event in [
            watcher::Event::Apply(namespace("kube-system", false, &[])),
            watcher::Event::InitApply(namespace("default", false, &[])),
            watcher::Event::Delete(namespace("openshift-config", true, &[])),
        ] {
            route_event(event, &only_target, &enqueuer, &tx);
        }
        assert_eq!(queue.len(), 0);

        route_event(
            watcher::Event::Delete(namespace(target, true, &["kubernetes"])),
            &only_target,
            &enqueuer,
            &tx,
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_init_done_passes_the_barrier() {
        let (queue, enqueuer) = enqueuer();
        let (tx, rx) = watch::channel(false);
        let sync = CacheSync::new("pods", rx);
        let accept_all = |_: &Pod| true;

        route_event(watcher::Event::Init, &accept_all, &enqueuer, &tx);
        assert!(!sync.is_synced());

        route_event(watcher::Event::InitDone, &accept_all, &enqueuer, &tx);
        assert!(sync.is_synced());
        assert!(sync.wait().await.is_ok());
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_ready_barrier_passes_immediately() {
        let sync = CacheSync::ready("pods");
        assert!(sync.is_synced());
        assert!(sync.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_barrier_waits_for_initial_listing() {
        let (tx, rx) = watch::channel(false);
        let sync = CacheSync::new("pods", rx);
        assert!(!sync.is_synced());

        let waiter = tokio::spawn(sync.wait());
        tokio::task::yield_now().await;
        tx.send_replace(true);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_barrier_fails_when_watch_stops() {
        let (tx, rx) = watch::channel(false);
        let sync = CacheSync::new("daemonsets", rx);
        drop(tx);
        let err = sync.wait().await.unwrap_err();
        assert!(matches!(err, OperatorError::CacheSync(_)));
    }
}
