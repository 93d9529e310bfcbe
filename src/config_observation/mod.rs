//! Config observation
//!
//! Observers read cluster-wide configuration and translate it into the
//! fragment of `spec.observedConfig` they own. An observer never fails
//! outright: on error it returns what it could salvage from the existing
//! config together with the errors, so one broken source does not wipe the
//! values owned by the others.

mod images;

pub use images::{
    observe_allowed_registries_for_import, observe_external_registry_hostnames,
    observe_internal_registry_hostname,
};

use crate::crd::Image;
use crate::error::{OperatorError, Result};
use crate::watch::Lister;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Read access shared by every observer.
#[derive(Clone)]
pub struct Listers {
    pub image_config: Arc<dyn Lister<Image>>,
    /// Name of the Image object to read
    pub image_config_name: String,
}

impl Listers {
    pub fn image_config_synced(&self) -> bool {
        self.image_config.has_synced()
    }
}

/// `(listers, existing observed config) -> (observed fragment, errors)`
pub type ObserveConfigFn = fn(&Listers, &Value) -> (Value, Vec<OperatorError>);

/// The observers run by the config observer controller, in merge order.
pub fn default_observers() -> Vec<ObserveConfigFn> {
    vec![
        observe_internal_registry_hostname,
        observe_external_registry_hostnames,
        observe_allowed_registries_for_import,
    ]
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn accessor_error(path: &[&str], value: &Value, expected: &str) -> OperatorError {
    OperatorError::Configuration(format!(
        "{} accessor error: {} is of type {}, expected {}",
        path.join("."),
        value,
        type_name(value),
        expected
    ))
}

/// Value at `path`. Absent fields are `Ok(None)`; walking through a
/// non-object is an error.
pub fn nested_field<'a>(config: &'a Value, path: &[&str]) -> Result<Option<&'a Value>> {
    let mut current = config;
    for (depth, field) in path.iter().enumerate() {
        match current {
            Value::Object(map) => match map.get(*field) {
                Some(next) => current = next,
                None => return Ok(None),
            },
            Value::Null if depth == 0 => return Ok(None),
            other => return Err(accessor_error(&path[..depth], other, "object")),
        }
    }
    Ok(Some(current))
}

pub fn nested_string(config: &Value, path: &[&str]) -> Result<Option<String>> {
    match nested_field(config, path)? {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(accessor_error(path, other, "string")),
    }
}

pub fn nested_slice(config: &Value, path: &[&str]) -> Result<Option<Vec<Value>>> {
    match nested_field(config, path)? {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(other) => Err(accessor_error(path, other, "array")),
    }
}

pub fn nested_string_slice(config: &Value, path: &[&str]) -> Result<Option<Vec<String>>> {
    let Some(items) = nested_slice(config, path)? else {
        return Ok(None);
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            other => Err(accessor_error(path, other, "string")),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Set `path` to `value`, creating intermediate objects as needed.
pub fn set_nested_field(config: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *config = value;
        return Ok(());
    };
    if config.is_null() {
        *config = Value::Object(Map::new());
    }
    let mut current = config;
    for (depth, field) in parents.iter().enumerate() {
        current = match current {
            Value::Object(map) => map
                .entry(field.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            other => return Err(accessor_error(&path[..depth], other, "object")),
        };
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        other => Err(accessor_error(parents, other, "object")),
    }
}

/// Deep merge `src` into `dst`. Objects merge key by key; anything else in
/// `src` replaces what `dst` holds.
pub fn merge_json(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dst_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        dst_map.insert(key, value);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}
