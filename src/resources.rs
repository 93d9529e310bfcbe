//! Manifests of the managed API server workload.
//!
//! Pure builders; [`crate::convergence::ApiServerWorkload`] applies them.

use crate::config::OperatorSettings;
use crate::config_observation::merge_json;
use crate::crd::LogLevel;
use crate::error::Result;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, Namespace, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "svcat-apiserver-operator";

pub const CONFIG_MAP_NAME: &str = "config";
pub const CONFIG_KEY: &str = "config.yaml";
pub const DAEMONSET_NAME: &str = "apiserver";
pub const SERVING_CERT_SECRET: &str = "serving-cert";

/// Pod template annotation carrying the applied config map version, so a
/// config change rolls the pods.
pub const CONFIG_VERSION_ANNOTATION: &str = "operator.openshift.io/config-version";

const CONTAINER_PORT: i32 = 6443;
const CONFIG_MOUNT_PATH: &str = "/var/run/configmaps/config";
const SERVING_CERT_MOUNT_PATH: &str = "/var/serving-cert";

fn common_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "svcat-apiserver".to_string());
    labels.insert("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string());
    labels
}

fn pod_selector() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "openshift-service-catalog-apiserver".to_string());
    labels.insert("apiserver".to_string(), "true".to_string());
    labels
}

pub fn build_namespace(name: &str) -> Namespace {
    let mut labels = common_labels();
    labels.insert("openshift.io/run-level".to_string(), "1".to_string());
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Built-in server configuration the observed config is layered onto.
pub fn default_server_config() -> Value {
    json!({
        "servingInfo": {
            "bindAddress": format!("0.0.0.0:{}", CONTAINER_PORT),
            "certFile": format!("{}/tls.crt", SERVING_CERT_MOUNT_PATH),
            "keyFile": format!("{}/tls.key", SERVING_CERT_MOUNT_PATH),
        },
        "imagePolicyConfig": {}
    })
}

/// Default server config with the observed config merged over it.
pub fn render_server_config(observed: Option<&Value>) -> Value {
    let mut config = default_server_config();
    if let Some(observed) = observed.filter(|v| v.is_object()) {
        merge_json(&mut config, observed.clone());
    }
    config
}

pub fn build_config_map(namespace: &str, server_config: &Value) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_KEY.to_string(), serde_json::to_string(server_config)?);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(common_labels()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn healthz_probe(initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(CONTAINER_PORT),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

pub fn build_daemonset(settings: &OperatorSettings, log_level: LogLevel, config_version: &str) -> DaemonSet {
    let selector = pod_selector();
    let mut pod_labels = selector.clone();
    pod_labels.extend(common_labels());

    let mut annotations = BTreeMap::new();
    annotations.insert(CONFIG_VERSION_ANNOTATION.to_string(), config_version.to_string());

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity("100m".to_string()));
    requests.insert("memory".to_string(), Quantity("200Mi".to_string()));

    let container = Container {
        name: "apiserver".to_string(),
        image: Some(settings.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/usr/bin/service-catalog".to_string()]),
        args: Some(vec![
            "apiserver".to_string(),
            format!("--config={}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
            format!("-v={}", log_level.verbosity()),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: CONTAINER_PORT,
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "serving-cert".to_string(),
                mount_path: SERVING_CERT_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(healthz_probe(30)),
        readiness_probe: Some(healthz_probe(10)),
        ..Default::default()
    };

    let mut node_selector = BTreeMap::new();
    node_selector.insert("node-role.kubernetes.io/master".to_string(), String::new());

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            node_selector: Some(node_selector),
            priority_class_name: Some("system-cluster-critical".to_string()),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            volumes: Some(vec![
                Volume {
                    name: "config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: CONFIG_MAP_NAME.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "serving-cert".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(SERVING_CERT_SECRET.to_string()),
                        optional: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
    };

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(DAEMONSET_NAME.to_string()),
            namespace: Some(settings.target_namespace.clone()),
            labels: Some(common_labels()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template,
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDaemonSet {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
