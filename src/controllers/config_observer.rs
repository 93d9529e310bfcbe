//! Config observer controller
//!
//! Runs every config observer over the current `spec.observedConfig`, merges
//! their fragments and writes the result back when it changed. The workload
//! controller waits for this field to be populated before applying anything.

use super::Reconciler;
use crate::cluster::ClusterApi;
use crate::config_observation::{merge_json, Listers, ObserveConfigFn};
use crate::error::{OperatorError, Result};
use crate::events::{reasons, EventRecorder};
use crate::queue::QueueHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The config observer's only key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObserverKey;

pub struct ConfigObserverReconciler {
    operator_config_name: String,
    cluster: Arc<dyn ClusterApi>,
    recorder: Arc<dyn EventRecorder>,
    listers: Listers,
    observers: Vec<ObserveConfigFn>,
}

impl ConfigObserverReconciler {
    pub fn new(
        operator_config_name: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        recorder: Arc<dyn EventRecorder>,
        listers: Listers,
        observers: Vec<ObserveConfigFn>,
    ) -> Self {
        Self {
            operator_config_name: operator_config_name.into(),
            cluster,
            recorder,
            listers,
            observers,
        }
    }

    fn observe(&self, existing: &Value) -> (Value, Vec<OperatorError>) {
        let mut merged = json!({});
        let mut errors = Vec::new();
        for observe in &self.observers {
            let (observed, errs) = observe(&self.listers, existing);
            merge_json(&mut merged, observed);
            errors.extend(errs);
        }
        (merged, errors)
    }
}

#[async_trait]
impl Reconciler for ConfigObserverReconciler {
    type Key = ObserverKey;

    fn name(&self) -> &'static str {
        "ConfigObserver"
    }

    async fn sync(&self, _key: &ObserverKey, _queue: &QueueHandle<ObserverKey>) -> Result<()> {
        let name = &self.operator_config_name;
        let config = self
            .cluster
            .get_operator_config(name)
            .await?
            .ok_or_else(|| OperatorError::not_found("ServiceCatalogAPIServer", name))?;

        let existing = match &config.spec.observed_config {
            Some(value) if !value.is_null() => value.clone(),
            _ => json!({}),
        };

        let (merged, errors) = self.observe(&existing);
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            warn!(config = %name, errors = ?messages, "Config observation failed");
            return Err(OperatorError::ConfigObservation(messages));
        }

        if merged == existing {
            debug!(config = %name, "Observed config unchanged");
            return Ok(());
        }

        info!(config = %name, observed = %merged, "Writing updated observed config");
        self.cluster
            .update_observed_config(&config, merged.clone())
            .await?;
        self.recorder
            .event(
                reasons::OBSERVED_CONFIG_CHANGED,
                format!("Writing updated observed config: {}", merged),
            )
            .await;
        Ok(())
    }
}
