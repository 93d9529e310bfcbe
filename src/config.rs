//! Operator settings
//!
//! Every setting can be given as a flag or through the environment; the
//! defaults match a standard installation.

use crate::error::{OperatorError, Result};
use crate::queue::{DEFAULT_SYNC_BURST, DEFAULT_SYNC_QPS};
use clap::Args;
use std::time::Duration;

fn default_target_namespace() -> String {
    "openshift-service-catalog-apiserver".to_string()
}

fn default_operator_config_name() -> String {
    "cluster".to_string()
}

fn default_prerequisite_operator() -> String {
    "kube-apiserver".to_string()
}

fn default_prerequisite_operator_fallback() -> String {
    "openshift-kube-apiserver-operator".to_string()
}

fn default_image() -> String {
    "quay.io/openshift/origin-service-catalog:latest".to_string()
}

/// Settings shared by the controllers.
#[derive(Args, Debug, Clone)]
pub struct OperatorSettings {
    /// Namespace hosting the managed API server
    #[arg(long, env = "TARGET_NAMESPACE", default_value_t = default_target_namespace())]
    pub target_namespace: String,

    /// Name of the ServiceCatalogAPIServer object to reconcile
    #[arg(long, env = "OPERATOR_CONFIG_NAME", default_value_t = default_operator_config_name())]
    pub operator_config_name: String,

    /// ClusterOperator that must be Available before the workload is applied
    #[arg(long, env = "PREREQUISITE_OPERATOR", default_value_t = default_prerequisite_operator())]
    pub prerequisite_operator: String,

    /// Name tried when the prerequisite is not found under its primary name
    #[arg(
        long,
        env = "PREREQUISITE_OPERATOR_FALLBACK",
        default_value_t = default_prerequisite_operator_fallback()
    )]
    pub prerequisite_operator_fallback: String,

    /// Name of the cluster-wide Image configuration
    #[arg(long, env = "IMAGE_CONFIG_NAME", default_value = "cluster")]
    pub image_config_name: String,

    /// Image of the managed API server
    #[arg(long, env = "IMAGE", default_value_t = default_image())]
    pub image: String,

    /// Namespaces holding shared configuration the workload depends on
    #[arg(
        long = "config-namespace",
        env = "CONFIG_NAMESPACES",
        value_delimiter = ',',
        default_value = "openshift-config"
    )]
    pub config_namespaces: Vec<String>,

    /// Steady rate of sync attempts per controller, per second
    #[arg(long, env = "SYNC_RATE", default_value_t = DEFAULT_SYNC_QPS)]
    pub sync_rate: f64,

    /// Burst of sync attempts allowed above the steady rate
    #[arg(long, env = "SYNC_BURST", default_value_t = DEFAULT_SYNC_BURST)]
    pub sync_burst: u32,

    /// Seconds to wait for the watch caches to fill before giving up
    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = 300)]
    pub cache_sync_timeout_secs: u64,
}

impl OperatorSettings {
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /// Reject settings that would leave a controller unpaced.
    pub fn validate(&self) -> Result<()> {
        if !self.sync_rate.is_finite() || self.sync_rate <= 0.0 {
            return Err(OperatorError::Configuration(format!(
                "sync rate must be a positive number, got {}",
                self.sync_rate
            )));
        }
        Ok(())
    }

    /// Prerequisite names in lookup order.
    pub fn prerequisite_names(&self) -> [&str; 2] {
        [
            self.prerequisite_operator.as_str(),
            self.prerequisite_operator_fallback.as_str(),
        ]
    }
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            target_namespace: default_target_namespace(),
            operator_config_name: default_operator_config_name(),
            prerequisite_operator: default_prerequisite_operator(),
            prerequisite_operator_fallback: default_prerequisite_operator_fallback(),
            image_config_name: "cluster".to_string(),
            image: default_image(),
            config_namespaces: vec!["openshift-config".to_string()],
            sync_rate: DEFAULT_SYNC_QPS,
            sync_burst: DEFAULT_SYNC_BURST,
            cache_sync_timeout_secs: 300,
        }
    }
}
