//! Namespace finalizer controller
//!
//! When the target namespace is being deleted, the `kubernetes` finalizer
//! can hold it in Terminating after the API server workload is gone. Once no
//! Pod and no DaemonSet is left in the namespace, this controller removes
//! that one finalizer and leaves any others in place.

use super::Reconciler;
use crate::cluster::ClusterApi;
use crate::conditions::NAMESPACE_FINALIZER;
use crate::error::Result;
use crate::events::{reasons, EventRecorder};
use crate::queue::QueueHandle;
use crate::watch::Lister;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, info};

/// The finalizer controller's only key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FinalizerKey;

pub struct FinalizerReconciler {
    target_namespace: String,
    cluster: Arc<dyn ClusterApi>,
    recorder: Arc<dyn EventRecorder>,
    pods: Arc<dyn Lister<Pod>>,
    daemonsets: Arc<dyn Lister<DaemonSet>>,
}

impl FinalizerReconciler {
    pub fn new(
        target_namespace: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        recorder: Arc<dyn EventRecorder>,
        pods: Arc<dyn Lister<Pod>>,
        daemonsets: Arc<dyn Lister<DaemonSet>>,
    ) -> Self {
        Self {
            target_namespace: target_namespace.into(),
            cluster,
            recorder,
            pods,
            daemonsets,
        }
    }
}

/// `finalizers` without any `name` entry, order preserved.
pub fn remove_finalizer(finalizers: &[String], name: &str) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != name)
        .cloned()
        .collect()
}

#[async_trait]
impl Reconciler for FinalizerReconciler {
    type Key = FinalizerKey;

    fn name(&self) -> &'static str {
        "FinalizerController"
    }

    async fn sync(&self, _key: &FinalizerKey, _queue: &QueueHandle<FinalizerKey>) -> Result<()> {
        let ns_name = &self.target_namespace;
        let Some(mut namespace) = self.cluster.get_namespace(ns_name).await? else {
            return Ok(());
        };

        if namespace.metadata.deletion_timestamp.is_none() {
            return Ok(());
        }

        // wait until the namespace has drained
        if !self.pods.list_namespaced(ns_name).is_empty() {
            debug!(namespace = %ns_name, "Pods remain, keeping finalizer");
            return Ok(());
        }
        if !self.daemonsets.list_namespaced(ns_name).is_empty() {
            debug!(namespace = %ns_name, "DaemonSets remain, keeping finalizer");
            return Ok(());
        }

        let finalizers = namespace
            .spec
            .as_ref()
            .and_then(|spec| spec.finalizers.clone())
            .unwrap_or_default();
        let new_finalizers = remove_finalizer(&finalizers, NAMESPACE_FINALIZER);
        if new_finalizers == finalizers {
            return Ok(());
        }

        info!(namespace = %ns_name, remaining = ?new_finalizers, "Clearing namespace finalizer");
        self.recorder
            .event(
                reasons::NAMESPACE_FINALIZATION,
                format!("clearing namespace finalizer on {:?}", ns_name),
            )
            .await;

        namespace.spec.get_or_insert_with(Default::default).finalizers = Some(new_finalizers);
        self.cluster.finalize_namespace(&namespace).await?;
        Ok(())
    }
}
