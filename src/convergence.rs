//! Convergence of the managed API server workload.
//!
//! [`ApiServerWorkload`] renders the target namespace, the server
//! configuration and the API server DaemonSet, applies them with server-side
//! apply, and reports the outcome on the operator's status.

use crate::conditions::{
    build_condition, set_condition, CONDITION_AVAILABLE, CONDITION_FALSE, CONDITION_PROGRESSING,
    CONDITION_TRUE, CONDITION_WORKLOAD_FAILING,
};
use crate::config::OperatorSettings;
use crate::crd::{OperatorStatus, ServiceCatalogAPIServer};
use crate::error::{OperatorError, Result};
use crate::resources::{self, FIELD_MANAGER};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

/// Result of one convergence attempt.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Ask for an extra rate-limited retry on top of the error-driven one
    pub force_requeue: bool,
    pub result: Result<()>,
}

impl ApplyOutcome {
    pub fn ok() -> Self {
        Self {
            force_requeue: false,
            result: Ok(()),
        }
    }

    pub fn failed(error: OperatorError, force_requeue: bool) -> Self {
        Self {
            force_requeue,
            result: Err(error),
        }
    }
}

/// Applies the desired workload for an operator configuration.
#[async_trait]
pub trait Convergence: Send + Sync {
    async fn apply(&self, config: &ServiceCatalogAPIServer) -> ApplyOutcome;
}

/// Default [`Convergence`] writing the API server manifests.
pub struct ApiServerWorkload {
    client: Client,
    settings: OperatorSettings,
}

impl ApiServerWorkload {
    pub fn new(client: Client, settings: OperatorSettings) -> Self {
        Self { client, settings }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }

    async fn apply_manifests(&self, config: &ServiceCatalogAPIServer) -> Result<DaemonSet> {
        let namespace = &self.settings.target_namespace;

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let ns = resources::build_namespace(namespace);
        namespaces
            .patch(namespace, &Self::apply_params(), &Patch::Apply(&ns))
            .await?;

        let server_config = resources::render_server_config(config.spec.observed_config.as_ref());
        let configmaps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = resources::build_config_map(namespace, &server_config)?;
        let applied_cm = configmaps
            .patch(resources::CONFIG_MAP_NAME, &Self::apply_params(), &Patch::Apply(&cm))
            .await?;
        let config_version = applied_cm.resource_version().unwrap_or_default();
        debug!(namespace = %namespace, config_version = %config_version, "Applied server config");

        let daemonsets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let ds = resources::build_daemonset(&self.settings, config.spec.log_level, &config_version);
        let applied = daemonsets
            .patch(resources::DAEMONSET_NAME, &Self::apply_params(), &Patch::Apply(&ds))
            .await?;

        Ok(applied)
    }

    async fn update_status(&self, config: &ServiceCatalogAPIServer, status: OperatorStatus) -> Result<()> {
        let api: Api<ServiceCatalogAPIServer> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&config.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Status after a successful apply, derived from the DaemonSet's rollout.
pub fn workload_status(config: &ServiceCatalogAPIServer, daemonset: &DaemonSet) -> OperatorStatus {
    let mut status = config.status.clone().unwrap_or_default();
    let ds_status = daemonset.status.clone().unwrap_or_default();
    let available = ds_status.number_available.unwrap_or(0);
    let updated = ds_status.updated_number_scheduled.unwrap_or(0);
    let desired = ds_status.desired_number_scheduled;

    status.observed_generation = config.metadata.generation;
    status.ready_replicas = available;

    set_condition(
        &mut status.conditions,
        build_condition(CONDITION_WORKLOAD_FAILING, CONDITION_FALSE, "AsExpected", "Workload applied"),
    );

    if available > 0 {
        set_condition(
            &mut status.conditions,
            build_condition(
                CONDITION_AVAILABLE,
                CONDITION_TRUE,
                "AsExpected",
                &format!("{} of {} API server pods available", available, desired),
            ),
        );
    } else {
        set_condition(
            &mut status.conditions,
            build_condition(CONDITION_AVAILABLE, CONDITION_FALSE, "NoAPIServerPod", "No API server pods available"),
        );
    }

    if updated < desired || available < desired {
        set_condition(
            &mut status.conditions,
            build_condition(
                CONDITION_PROGRESSING,
                CONDITION_TRUE,
                "RollingOut",
                &format!("{} of {} API server pods updated", updated, desired),
            ),
        );
    } else {
        set_condition(
            &mut status.conditions,
            build_condition(CONDITION_PROGRESSING, CONDITION_FALSE, "AsExpected", "Rollout complete"),
        );
    }

    status
}

/// Status after a failed apply: only `WorkloadFailing` changes.
pub fn failing_status(config: &ServiceCatalogAPIServer, error: &OperatorError) -> OperatorStatus {
    let mut status = config.status.clone().unwrap_or_default();
    set_condition(
        &mut status.conditions,
        build_condition(CONDITION_WORKLOAD_FAILING, CONDITION_TRUE, "SyncError", &error.to_string()),
    );
    status
}

#[async_trait]
impl Convergence for ApiServerWorkload {
    async fn apply(&self, config: &ServiceCatalogAPIServer) -> ApplyOutcome {
        match self.apply_manifests(config).await {
            Ok(daemonset) => {
                let status = workload_status(config, &daemonset);
                info!(
                    namespace = %self.settings.target_namespace,
                    ready = status.ready_replicas,
                    "API server workload applied"
                );
                match self.update_status(config, status).await {
                    Ok(()) => ApplyOutcome::ok(),
                    Err(e) => ApplyOutcome::failed(e, false),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply API server workload");
                if let Err(status_err) = self.update_status(config, failing_status(config, &e)).await {
                    warn!(error = %status_err, "Failed to report WorkloadFailing");
                }
                ApplyOutcome::failed(e, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::OperatorSpec;
    use k8s_openapi::api::apps::v1::DaemonSetStatus;

    fn config() -> ServiceCatalogAPIServer {
        let mut config = ServiceCatalogAPIServer::new("cluster", OperatorSpec::default());
        config.metadata.generation = Some(3);
        config
    }

    fn daemonset(desired: i32, updated: i32, available: i32) -> DaemonSet {
        DaemonSet {
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                updated_number_scheduled: Some(updated),
                number_available: Some(available),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition<'a>(status: &'a OperatorStatus, condition_type: &str) -> &'a str {
        status
            .conditions
            .iter()
            .find(|c| c.r#type == condition_type)
            .map(|c| c.status.as_str())
            .unwrap_or("missing")
    }

    #[test]
    fn test_workload_status_rolled_out() {
        let status = workload_status(&config(), &daemonset(3, 3, 3));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.ready_replicas, 3);
        assert_eq!(condition(&status, CONDITION_WORKLOAD_FAILING), CONDITION_FALSE);
        assert_eq!(condition(&status, CONDITION_AVAILABLE), CONDITION_TRUE);
        assert_eq!(condition(&status, CONDITION_PROGRESSING), CONDITION_FALSE);
    }

    #[test]
    fn test_workload_status_rolling_out() {
        let status = workload_status(&config(), &daemonset(3, 1, 0));
        assert_eq!(status.ready_replicas, 0);
        assert_eq!(condition(&status, CONDITION_AVAILABLE), CONDITION_FALSE);
        assert_eq!(condition(&status, CONDITION_PROGRESSING), CONDITION_TRUE);
    }

    #[test]
    fn test_failing_status_keeps_other_conditions() {
        let mut config = config();
        config.status = Some(workload_status(&config, &daemonset(1, 1, 1)));

        let status = failing_status(&config, &OperatorError::Reconciliation("boom".into()));
        assert_eq!(condition(&status, CONDITION_WORKLOAD_FAILING), CONDITION_TRUE);
        assert_eq!(condition(&status, CONDITION_AVAILABLE), CONDITION_TRUE);
        let failing = status
            .conditions
            .iter()
            .find(|c| c.r#type == CONDITION_WORKLOAD_FAILING)
            .unwrap();
        assert!(failing.message.as_deref().unwrap().contains("boom"));
    }

    #[test]
    fn test_apply_outcome_constructors() {
        let ok = ApplyOutcome::ok();
        assert!(!ok.force_requeue);
        assert!(ok.result.is_ok());

        let failed = ApplyOutcome::failed(OperatorError::Reconciliation("x".into()), true);
        assert!(failed.force_requeue);
        assert!(failed.result.is_err());
    }
}
