//! Workload controller
//!
//! Gates convergence of the API server workload on the declared management
//! state and on the health of the prerequisite operator:
//!
//! - `Unmanaged`: hands off, nothing is touched
//! - `Removed`: the target namespace is deleted
//! - `Managed`: once the prerequisite is Available and the observed config
//!   is populated, the workload is applied

use super::Reconciler;
use crate::cluster::ClusterApi;
use crate::conditions::{is_status_condition_true, CONDITION_AVAILABLE};
use crate::config::OperatorSettings;
use crate::convergence::Convergence;
use crate::crd::{ClusterOperator, ManagementState};
use crate::error::{OperatorError, Result};
use crate::events::{reasons, EventRecorder};
use crate::queue::QueueHandle;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// The workload controller's only key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WorkloadKey;

pub struct WorkloadReconciler {
    settings: OperatorSettings,
    cluster: Arc<dyn ClusterApi>,
    recorder: Arc<dyn EventRecorder>,
    convergence: Arc<dyn Convergence>,
}

impl WorkloadReconciler {
    pub fn new(
        settings: OperatorSettings,
        cluster: Arc<dyn ClusterApi>,
        recorder: Arc<dyn EventRecorder>,
        convergence: Arc<dyn Convergence>,
    ) -> Self {
        Self {
            settings,
            cluster,
            recorder,
            convergence,
        }
    }

    async fn remove_workload(&self) -> Result<()> {
        let namespace = &self.settings.target_namespace;
        match self.cluster.delete_namespace(namespace).await {
            Ok(()) => {
                info!(namespace = %namespace, "Deleted target namespace, workload is Removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(namespace = %namespace, "Target namespace already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Find the prerequisite under its primary name, then its fallback.
    async fn find_prerequisite(&self) -> Result<Option<ClusterOperator>> {
        for name in self.settings.prerequisite_names() {
            if let Some(operator) = self.cluster.get_cluster_operator(name).await? {
                return Ok(Some(operator));
            }
        }
        Ok(None)
    }

    async fn check_prerequisite(&self) -> Result<()> {
        let message = match self.find_prerequisite().await? {
            None => format!("clusteroperator/{} not found", self.settings.prerequisite_operator),
            Some(operator) if !is_status_condition_true(operator.conditions(), CONDITION_AVAILABLE) => {
                format!("clusteroperator/{} is not Available", operator.name_any())
            }
            Some(_) => return Ok(()),
        };
        self.recorder
            .warning(reasons::PREREQ_NOT_READY, message.clone())
            .await;
        Err(OperatorError::PrerequisiteNotReady(message))
    }
}

#[async_trait]
impl Reconciler for WorkloadReconciler {
    type Key = WorkloadKey;

    fn name(&self) -> &'static str {
        "WorkloadController"
    }

    async fn sync(&self, key: &WorkloadKey, queue: &QueueHandle<WorkloadKey>) -> Result<()> {
        let name = &self.settings.operator_config_name;
        let config = self
            .cluster
            .get_operator_config(name)
            .await?
            .ok_or_else(|| OperatorError::not_found("ServiceCatalogAPIServer", name))?;

        match config.spec.management_state {
            ManagementState::Unmanaged => {
                debug!(config = %name, "Workload is Unmanaged, skipping");
                return Ok(());
            }
            ManagementState::Removed => return self.remove_workload().await,
            ManagementState::Managed => {}
        }

        self.check_prerequisite().await?;

        if config.spec.observed_config_is_empty() {
            info!(config = %name, "Waiting for observed configuration to be available");
            return Ok(());
        }

        let outcome = self.convergence.apply(&config).await;
        if outcome.force_requeue && outcome.result.is_err() {
            queue.add_rate_limited(*key);
        }
        outcome.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::Controller;
    use crate::queue::WorkQueue;
    use crate::testing::{
        cluster_operator, namespace, operator_config, FakeCall, FakeCluster, FakeConvergence,
        RecordingEvents,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        cluster: Arc<FakeCluster>,
        events: Arc<RecordingEvents>,
        convergence: Arc<FakeConvergence>,
        reconciler: WorkloadReconciler,
        queue: Arc<WorkQueue<WorkloadKey>>,
    }

    impl Harness {
        fn new(cluster: FakeCluster, convergence: FakeConvergence) -> Self {
            let cluster = Arc::new(cluster);
            let events = Arc::new(RecordingEvents::default());
            let convergence = Arc::new(convergence);
            let reconciler = WorkloadReconciler::new(
                OperatorSettings::default(),
                cluster.clone(),
                events.clone(),
                convergence.clone(),
            );
            Self {
                cluster,
                events,
                convergence,
                reconciler,
                queue: WorkQueue::new("workload"),
            }
        }

        async fn sync(&self) -> Result<()> {
            let handle = QueueHandle::new(Arc::clone(&self.queue));
            self.reconciler.sync(&WorkloadKey, &handle).await
        }
    }

    fn observed() -> Option<serde_json::Value> {
        Some(json!({"imagePolicyConfig": {"internalRegistryHostname": "registry.svc:5000"}}))
    }

    fn managed_cluster() -> FakeCluster {
        FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Managed, observed()))
            .with_cluster_operator(cluster_operator("kube-apiserver", true))
    }

    #[tokio::test]
    async fn test_missing_operator_config_is_error() {
        let h = Harness::new(FakeCluster::new(), FakeConvergence::succeeding());
        let err = h.sync().await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.convergence.calls(), 0);
    }

    #[tokio::test]
    async fn test_unmanaged_makes_no_writes() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Unmanaged, observed()))
            .with_namespace(namespace("openshift-service-catalog-apiserver", false, &[]));
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        assert!(h.sync().await.is_ok());
        assert_eq!(h.cluster.writes(), 0);
        assert_eq!(h.convergence.calls(), 0);
        assert!(h.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_removed_deletes_namespace_once() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Removed, observed()))
            .with_namespace(namespace("openshift-service-catalog-apiserver", false, &[]));
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        assert!(h.sync().await.is_ok());
        assert_eq!(
            h.cluster.state().deleted_namespaces,
            vec!["openshift-service-catalog-apiserver".to_string()]
        );
        assert_eq!(h.convergence.calls(), 0);
        assert!(h.events.events().is_empty());

        // already gone on the next pass
        assert!(h.sync().await.is_ok());
        assert_eq!(h.cluster.state().deleted_namespaces.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_with_absent_namespace_succeeds() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Removed, None));
        let h = Harness::new(cluster, FakeConvergence::succeeding());
        assert!(h.sync().await.is_ok());
        assert_eq!(h.cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_removed_delete_failure_is_returned() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Removed, observed()))
            .with_namespace(namespace("openshift-service-catalog-apiserver", false, &[]))
            .failing(FakeCall::DeleteNamespace);
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        let err = h.sync().await.unwrap_err();
        assert!(matches!(err, OperatorError::KubeApi(_)));
        assert!(!err.is_not_found());
        assert_eq!(h.cluster.writes(), 0);
        assert_eq!(h.convergence.calls(), 0);
    }

    #[tokio::test]
    async fn test_prerequisite_lookup_error_skips_fallback_and_warning() {
        let cluster = managed_cluster().failing(FakeCall::GetClusterOperator);
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        let err = h.sync().await.unwrap_err();
        assert!(matches!(err, OperatorError::KubeApi(_)));
        assert_eq!(
            h.cluster.state().cluster_operator_lookups,
            vec!["kube-apiserver".to_string()]
        );
        assert!(h.events.events().is_empty());
        assert_eq!(h.convergence.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_prerequisite_warns_and_fails() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Managed, observed()));
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        let err = h.sync().await.unwrap_err();
        assert!(matches!(err, OperatorError::PrerequisiteNotReady(_)));
        let warnings = h.events.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].reason, reasons::PREREQ_NOT_READY);
        assert_eq!(warnings[0].note, "clusteroperator/kube-apiserver not found");
        assert_eq!(
            h.cluster.state().cluster_operator_lookups,
            vec![
                "kube-apiserver".to_string(),
                "openshift-kube-apiserver-operator".to_string()
            ]
        );
        assert_eq!(h.convergence.calls(), 0);
    }

    #[tokio::test]
    async fn test_prerequisite_not_available_blocks_apply() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Managed, observed()))
            .with_cluster_operator(cluster_operator("kube-apiserver", false));
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        assert!(h.sync().await.is_err());
        let warnings = h.events.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].note, "clusteroperator/kube-apiserver is not Available");
        assert_eq!(h.convergence.calls(), 0);
    }

    #[tokio::test]
    async fn test_prerequisite_found_under_fallback_name() {
        let cluster = FakeCluster::new()
            .with_operator_config(operator_config(ManagementState::Managed, observed()))
            .with_cluster_operator(cluster_operator("openshift-kube-apiserver-operator", true));
        let h = Harness::new(cluster, FakeConvergence::succeeding());

        assert!(h.sync().await.is_ok());
        assert_eq!(h.convergence.calls(), 1);
        assert!(h.events.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_empty_observed_config_skips_apply() {
        for empty in [None, Some(json!({})), Some(serde_json::Value::Null)] {
            let cluster = FakeCluster::new()
                .with_operator_config(operator_config(ManagementState::Managed, empty))
                .with_cluster_operator(cluster_operator("kube-apiserver", true));
            let h = Harness::new(cluster, FakeConvergence::succeeding());

            assert!(h.sync().await.is_ok());
            assert_eq!(h.convergence.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_successful_apply() {
        let h = Harness::new(managed_cluster(), FakeConvergence::succeeding());
        assert!(h.sync().await.is_ok());
        assert_eq!(h.convergence.calls(), 1);
        assert_eq!(h.queue.num_requeues(&WorkloadKey), 0);
    }

    #[tokio::test]
    async fn test_forced_requeue_on_apply_error() {
        let h = Harness::new(managed_cluster(), FakeConvergence::failing(true));
        assert!(h.sync().await.is_err());
        assert_eq!(h.convergence.calls(), 1);
        assert_eq!(h.queue.num_requeues(&WorkloadKey), 1);
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn run_controller(h: Harness) -> (tokio::task::JoinHandle<Result<()>>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let controller = Controller::new(h.reconciler, Arc::clone(&h.queue), 100.0, 10);
        let handle = tokio::spawn(controller.run(1, shutdown.clone()));
        (handle, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_forgets_key_after_successful_apply() {
        let h = Harness::new(managed_cluster(), FakeConvergence::succeeding());
        let (queue, convergence) = (Arc::clone(&h.queue), Arc::clone(&h.convergence));
        let (run, shutdown) = run_controller(h);

        queue.add(WorkloadKey);
        settle().await;
        assert_eq!(convergence.calls(), 1);
        assert_eq!(queue.num_requeues(&WorkloadKey), 0);

        shutdown.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_collapses_forced_and_error_requeues() {
        let h = Harness::new(managed_cluster(), FakeConvergence::failing(true));
        let (queue, convergence) = (Arc::clone(&h.queue), Arc::clone(&h.convergence));
        let (run, shutdown) = run_controller(h);

        queue.add(WorkloadKey);
        settle().await;
        assert_eq!(convergence.calls(), 1);
        // one requeue from sync, one from the loop
        assert_eq!(queue.num_requeues(&WorkloadKey), 2);

        // both requeues land as a single retry at the earliest delay (5ms)
        tokio::time::advance(Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(convergence.calls(), 2);

        // the next retry is 20ms out
        tokio::time::advance(Duration::from_millis(9)).await;
        settle().await;
        assert_eq!(convergence.calls(), 2);

        shutdown.cancel();
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_apply_error_without_forced_requeue() {
        let h = Harness::new(managed_cluster(), FakeConvergence::failing(false));
        assert!(h.sync().await.is_err());
        assert_eq!(h.queue.num_requeues(&WorkloadKey), 0);
    }
}
