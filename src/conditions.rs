//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for the operator's own status
//! conditions, and lookups over the conditions reported by other operators.

use crate::crd::{ClusterOperatorCondition, OperatorCondition};
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Operator condition types
pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_WORKLOAD_FAILING: &str = "WorkloadFailing";

/// Finalizer held by the namespace controller until every object is gone
pub const NAMESPACE_FINALIZER: &str = "kubernetes";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> OperatorCondition {
    OperatorCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<OperatorCondition>, new: OperatorCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// True when a condition of the given type is present with status `True`.
pub fn is_status_condition_true(conditions: &[ClusterOperatorCondition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.r#type == condition_type && c.status == CONDITION_TRUE)
}
