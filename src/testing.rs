//! In-memory fakes for reconciler tests.

use crate::cluster::ClusterApi;
use crate::conditions::{CONDITION_AVAILABLE, CONDITION_FALSE, CONDITION_TRUE};
use crate::convergence::{ApplyOutcome, Convergence};
use crate::crd::{
    ClusterOperator, ClusterOperatorCondition, ClusterOperatorSpec, ClusterOperatorStatus,
    ManagementState, OperatorSpec, ServiceCatalogAPIServer,
};
use crate::error::{OperatorError, Result};
use crate::events::EventRecorder;
use crate::watch::Lister;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Namespace, NamespaceSpec, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Calls that can be made to fail with a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FakeCall {
    GetClusterOperator,
    GetNamespace,
    DeleteNamespace,
    FinalizeNamespace,
}

fn server_error(call: FakeCall) -> OperatorError {
    OperatorError::KubeApi(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{:?}: etcdserver: request timed out", call),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

#[derive(Default)]
pub(crate) struct FakeState {
    pub failing: HashSet<FakeCall>,
    pub cluster_operator_lookups: Vec<String>,
    pub operator_config: Option<ServiceCatalogAPIServer>,
    pub cluster_operators: HashMap<String, ClusterOperator>,
    pub namespace: Option<Namespace>,
    pub deleted_namespaces: Vec<String>,
    pub finalized: Vec<Namespace>,
    pub observed_config_writes: Vec<serde_json::Value>,
}

/// Cluster store kept in memory, recording every write.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operator_config(self, config: ServiceCatalogAPIServer) -> Self {
        self.state().operator_config = Some(config);
        self
    }

    pub fn with_cluster_operator(self, operator: ClusterOperator) -> Self {
        self.state()
            .cluster_operators
            .insert(operator.name_any(), operator);
        self
    }

    pub fn with_namespace(self, namespace: Namespace) -> Self {
        self.state().namespace = Some(namespace);
        self
    }

    /// Make every call of the given kind fail with a 500.
    pub fn failing(self, call: FakeCall) -> Self {
        self.state().failing.insert(call);
        self
    }

    fn check(&self, call: FakeCall) -> Result<()> {
        if self.state().failing.contains(&call) {
            return Err(server_error(call));
        }
        Ok(())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn writes(&self) -> usize {
        let state = self.state();
        state.deleted_namespaces.len() + state.finalized.len() + state.observed_config_writes.len()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_operator_config(&self, name: &str) -> Result<Option<ServiceCatalogAPIServer>> {
        Ok(self
            .state()
            .operator_config
            .clone()
            .filter(|config| config.name_any() == name))
    }

    async fn update_observed_config(
        &self,
        config: &ServiceCatalogAPIServer,
        observed: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state();
        let mut updated = config.clone();
        updated.spec.observed_config = Some(observed.clone());
        state.operator_config = Some(updated);
        state.observed_config_writes.push(observed);
        Ok(())
    }

    async fn get_cluster_operator(&self, name: &str) -> Result<Option<ClusterOperator>> {
        self.state().cluster_operator_lookups.push(name.to_string());
        self.check(FakeCall::GetClusterOperator)?;
        Ok(self.state().cluster_operators.get(name).cloned())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        self.check(FakeCall::GetNamespace)?;
        Ok(self
            .state()
            .namespace
            .clone()
            .filter(|ns| ns.name_any() == name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.check(FakeCall::DeleteNamespace)?;
        let mut state = self.state();
        let present = state
            .namespace
            .as_ref()
            .is_some_and(|ns| ns.name_any() == name);
        if !present {
            return Err(OperatorError::not_found("Namespace", name));
        }
        state.namespace = None;
        state.deleted_namespaces.push(name.to_string());
        Ok(())
    }

    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.check(FakeCall::FinalizeNamespace)?;
        let mut state = self.state();
        state.namespace = Some(namespace.clone());
        state.finalized.push(namespace.clone());
        Ok(namespace.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.warning).collect()
    }

    fn record(&self, warning: bool, reason: &str, note: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning,
            reason: reason.to_string(),
            note,
        });
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn event(&self, reason: &str, note: String) {
        self.record(false, reason, note);
    }

    async fn warning(&self, reason: &str, note: String) {
        self.record(true, reason, note);
    }
}

/// Lister over a fixed set of objects.
pub(crate) struct StaticLister<K> {
    items: Vec<Arc<K>>,
    synced: bool,
}

impl<K> StaticLister<K> {
    pub fn new(items: Vec<K>) -> Self {
        Self {
            items: items.into_iter().map(Arc::new).collect(),
            synced: true,
        }
    }

    pub fn unsynced(items: Vec<K>) -> Self {
        Self {
            synced: false,
            ..Self::new(items)
        }
    }
}

impl<K: Resource + Send + Sync> Lister<K> for StaticLister<K> {
    fn list(&self) -> Vec<Arc<K>> {
        self.items.clone()
    }

    fn has_synced(&self) -> bool {
        self.synced
    }
}

/// Convergence returning a canned outcome and counting calls.
#[derive(Default)]
pub(crate) struct FakeConvergence {
    fail: bool,
    force_requeue: bool,
    calls: AtomicUsize,
}

impl FakeConvergence {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(force_requeue: bool) -> Self {
        Self {
            fail: true,
            force_requeue,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Convergence for FakeConvergence {
    async fn apply(&self, _config: &ServiceCatalogAPIServer) -> ApplyOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            ApplyOutcome::failed(
                OperatorError::Reconciliation("apply failed".to_string()),
                self.force_requeue,
            )
        } else {
            ApplyOutcome {
                force_requeue: self.force_requeue,
                result: Ok(()),
            }
        }
    }
}

pub(crate) fn operator_config(
    state: ManagementState,
    observed: Option<serde_json::Value>,
) -> ServiceCatalogAPIServer {
    ServiceCatalogAPIServer::new(
        "cluster",
        OperatorSpec {
            management_state: state,
            observed_config: observed,
            ..Default::default()
        },
    )
}

pub(crate) fn cluster_operator(name: &str, available: bool) -> ClusterOperator {
    let mut operator = ClusterOperator::new(name, ClusterOperatorSpec::default());
    operator.status = Some(ClusterOperatorStatus {
        conditions: vec![ClusterOperatorCondition {
            r#type: CONDITION_AVAILABLE.to_string(),
            status: if available { CONDITION_TRUE } else { CONDITION_FALSE }.to_string(),
            last_transition_time: None,
            reason: None,
            message: None,
        }],
    });
    operator
}

pub(crate) fn namespace(name: &str, terminating: bool, finalizers: &[&str]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            deletion_timestamp: terminating.then(|| Time(chrono::Utc::now())),
            ..Default::default()
        },
        spec: Some(NamespaceSpec {
            finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
        }),
        ..Default::default()
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

pub(crate) fn pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: meta(namespace, name),
        ..Default::default()
    }
}

pub(crate) fn daemonset(namespace: &str, name: &str) -> DaemonSet {
    DaemonSet {
        metadata: meta(namespace, name),
        ..Default::default()
    }
}
