//! Resource definitions consumed by the operator
//!
//! - ServiceCatalogAPIServer: the operator configuration (management state,
//!   observed config, status)
//! - ClusterOperator: health reported by prerequisite operators
//! - Image: cluster-wide image registry settings

mod cluster_operator;
mod image;
mod operator;

pub use cluster_operator::{
    ClusterOperator, ClusterOperatorCondition, ClusterOperatorSpec, ClusterOperatorStatus,
};
pub use image::{Image, ImageSpec, ImageStatus, RegistryLocation};
pub use operator::{
    LogLevel, ManagementState, OperatorCondition, OperatorSpec, OperatorStatus,
    ServiceCatalogAPIServer,
};
