//! ServiceCatalogAPIServer operator configuration resource
//!
//! The cluster-scoped object declaring whether the operator manages the
//! service catalog API server, and carrying the configuration observed from
//! cluster-wide settings.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ServiceCatalogAPIServer is the operator configuration for the aggregated API server
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operator.openshift.io",
    version = "v1",
    kind = "ServiceCatalogAPIServer",
    plural = "servicecatalogapiservers",
    status = "OperatorStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    /// Whether and how the operator should manage the workload
    #[serde(default)]
    pub management_state: ManagementState,

    /// Verbosity of the managed API server
    #[serde(default)]
    pub log_level: LogLevel,

    /// Configuration observed from cluster-wide settings, written by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_config: Option<serde_json::Value>,
}

impl OperatorSpec {
    /// True while nothing has been observed yet (absent, null or an empty object).
    pub fn observed_config_is_empty(&self) -> bool {
        match &self.observed_config {
            None | Some(serde_json::Value::Null) => true,
            Some(serde_json::Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        }
    }
}

/// Administrator-declared intent for the managed workload.
///
/// Unrecognized values are read as `Managed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ManagementState {
    /// The operator leaves the workload alone
    Unmanaged,
    /// The operator tears the workload down
    Removed,
    /// The operator drives the workload toward the declared state
    #[default]
    #[serde(other)]
    Managed,
}

/// Log verbosity for the managed API server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    /// Value for the server's `-v` flag
    pub fn verbosity(&self) -> u8 {
        match self {
            LogLevel::Normal => 2,
            LogLevel::Debug => 4,
            LogLevel::Trace => 6,
            LogLevel::TraceAll => 8,
        }
    }
}

/// Status of the ServiceCatalogAPIServer
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    /// Generation of the spec last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Number of available API server pods
    #[serde(default)]
    pub ready_replicas: i32,

    /// Conditions representing the operator state
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,
}

/// Condition of the operator
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}
