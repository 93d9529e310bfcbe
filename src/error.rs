//! Error types for the service catalog API server operator

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    /// An upstream dependency is missing or unhealthy
    #[error("Prerequisite not ready: {0}")]
    PrerequisiteNotReady(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One or more config observers failed
    #[error("Config observation failed: {}", .0.join("; "))]
    ConfigObservation(Vec<String>),

    /// Watch caches did not complete their initial listing
    #[error("Caches did not sync: {0}")]
    CacheSync(String),

    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
}

impl OperatorError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    /// True for both the local `NotFound` variant and a 404 from the API server.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeApi(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}
