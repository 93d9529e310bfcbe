//! Cluster-wide image configuration
//!
//! Source of the registry settings the config observers copy into the
//! operator's observed configuration.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Image holds cluster-wide information about how to handle images
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Image",
    plural = "images",
    status = "ImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Hostnames for the default external image registry, user provided
    #[serde(default)]
    pub external_registry_hostnames: Vec<String>,

    /// Registries that normal users may import images from
    #[serde(default)]
    pub allowed_registries_for_import: Vec<RegistryLocation>,
}

/// A registry users may import from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryLocation {
    /// Domain name of the registry, may include a wildcard prefix
    #[serde(default)]
    pub domain_name: String,

    /// Whether the registry is reachable without TLS
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
}

/// Status of the image configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Hostname of the internal registry, set by the registry operator
    #[serde(default)]
    pub internal_registry_hostname: String,

    /// Hostnames for the external registry, set by the registry operator
    #[serde(default)]
    pub external_registry_hostnames: Vec<String>,
}
