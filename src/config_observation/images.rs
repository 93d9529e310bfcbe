//! Image registry settings observed from the cluster Image configuration.

use super::{nested_slice, nested_string, nested_string_slice, set_nested_field, Listers};
use crate::crd::Image;
use crate::error::OperatorError;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

const INTERNAL_REGISTRY_HOSTNAME_PATH: [&str; 2] = ["imagePolicyConfig", "internalRegistryHostname"];
const EXTERNAL_REGISTRY_HOSTNAMES_PATH: [&str; 2] = ["imagePolicyConfig", "externalRegistryHostnames"];
const ALLOWED_REGISTRIES_FOR_IMPORT_PATH: [&str; 2] = ["imagePolicyConfig", "allowedRegistriesForImport"];

/// Where an observer stands once it has looked at the lister.
enum ImageLookup {
    /// Cache not filled yet, keep the previous values
    NotSynced,
    /// No Image object, the owned values are cleared
    Missing,
    Found(Arc<Image>),
}

fn lookup_image(listers: &Listers) -> ImageLookup {
    if !listers.image_config_synced() {
        warn!("images.config.openshift.io not synced");
        return ImageLookup::NotSynced;
    }
    match listers.image_config.get(&listers.image_config_name) {
        Some(image) => ImageLookup::Found(image),
        None => {
            warn!(name = %listers.image_config_name, "image.config.openshift.io not found");
            ImageLookup::Missing
        }
    }
}

/// Finish an observer: resolve the lookup and write `value` (if any) into a
/// fresh config at `path`.
fn observe_image_field(
    listers: &Listers,
    previous: Value,
    path: &[&str],
    extract: impl FnOnce(&Image) -> Result<Option<Value>, OperatorError>,
) -> (Value, Vec<OperatorError>) {
    let image = match lookup_image(listers) {
        ImageLookup::NotSynced => return (previous, Vec::new()),
        ImageLookup::Missing => return (json!({}), Vec::new()),
        ImageLookup::Found(image) => image,
    };

    let mut observed = json!({});
    let value = match extract(&image) {
        Ok(value) => value,
        Err(e) => return (previous, vec![e]),
    };
    if let Some(value) = value {
        if let Err(e) = set_nested_field(&mut observed, path, value) {
            return (previous, vec![e]);
        }
    }
    (observed, Vec::new())
}

/// Copy of `existing` restricted to `path`, or the read error.
fn previous_value(
    existing: &Value,
    path: &[&str],
    read: impl FnOnce(&Value, &[&str]) -> Result<Option<Value>, OperatorError>,
) -> Result<Value, OperatorError> {
    let mut previous = json!({});
    if let Some(value) = read(existing, path)? {
        set_nested_field(&mut previous, path, value)?;
    }
    Ok(previous)
}

/// `imagePolicyConfig.internalRegistryHostname` from the Image status.
pub fn observe_internal_registry_hostname(
    listers: &Listers,
    existing: &Value,
) -> (Value, Vec<OperatorError>) {
    let path = &INTERNAL_REGISTRY_HOSTNAME_PATH;
    let previous = match previous_value(existing, path, |config, path| {
        Ok(nested_string(config, path)?
            .filter(|s| !s.is_empty())
            .map(Value::String))
    }) {
        Ok(previous) => previous,
        Err(e) => return (json!({}), vec![e]),
    };

    observe_image_field(listers, previous, path, |image| {
        let hostname = image
            .status
            .as_ref()
            .map(|s| s.internal_registry_hostname.clone())
            .unwrap_or_default();
        Ok((!hostname.is_empty()).then_some(Value::String(hostname)))
    })
}

/// `imagePolicyConfig.externalRegistryHostnames`: user supplied hostnames
/// from the Image spec first, then the ones reported in its status.
pub fn observe_external_registry_hostnames(
    listers: &Listers,
    existing: &Value,
) -> (Value, Vec<OperatorError>) {
    let path = &EXTERNAL_REGISTRY_HOSTNAMES_PATH;
    let previous = match previous_value(existing, path, |config, path| {
        Ok(nested_string_slice(config, path)?
            .filter(|hostnames| !hostnames.is_empty())
            .map(|hostnames| json!(hostnames)))
    }) {
        Ok(previous) => previous,
        Err(e) => return (json!({}), vec![e]),
    };

    observe_image_field(listers, previous, path, |image| {
        let mut hostnames = image.spec.external_registry_hostnames.clone();
        if let Some(status) = &image.status {
            hostnames.extend(status.external_registry_hostnames.iter().cloned());
        }
        Ok((!hostnames.is_empty()).then(|| json!(hostnames)))
    })
}

/// `imagePolicyConfig.allowedRegistriesForImport` from the Image spec.
pub fn observe_allowed_registries_for_import(
    listers: &Listers,
    existing: &Value,
) -> (Value, Vec<OperatorError>) {
    let path = &ALLOWED_REGISTRIES_FOR_IMPORT_PATH;
    let previous = match previous_value(existing, path, |config, path| {
        Ok(nested_slice(config, path)?
            .filter(|registries| !registries.is_empty())
            .map(Value::Array))
    }) {
        Ok(previous) => previous,
        Err(e) => return (json!({}), vec![e]),
    };

    observe_image_field(listers, previous, path, |image| {
        let allowed = &image.spec.allowed_registries_for_import;
        if allowed.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_value(allowed)?))
    })
}
