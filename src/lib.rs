//! Service catalog API server operator
//!
//! Drives the service catalog aggregated API server toward the state declared
//! on the cluster-scoped `ServiceCatalogAPIServer` object named `cluster`.
//!
//! ## Controllers
//!
//! - `WorkloadController`: gates and applies the API server workload based on
//!   the management state and the health of the kube-apiserver operator
//! - `FinalizerController`: clears the `kubernetes` finalizer from the target
//!   namespace once it has drained
//! - `ConfigObserver`: copies cluster image registry settings into
//!   `spec.observedConfig`
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: operator.openshift.io/v1
//! kind: ServiceCatalogAPIServer
//! metadata:
//!   name: cluster
//! spec:
//!   managementState: Managed
//!   logLevel: Normal
//! ```

pub mod cluster;
pub mod conditions;
pub mod config;
pub mod config_observation;
pub mod controllers;
pub mod convergence;
pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod queue;
pub mod resources;
pub mod watch;

#[cfg(test)]
mod testing;

pub use controllers::{
    ConfigObserverReconciler, Controller, FinalizerKey, FinalizerReconciler, ObserverKey,
    Reconciler, WorkloadKey, WorkloadReconciler,
};
pub use crd::{ClusterOperator, Image, ManagementState, ServiceCatalogAPIServer};
pub use error::{OperatorError, Result};
