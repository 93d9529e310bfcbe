//! Cluster store access used by the reconcilers.
//!
//! Reconcilers talk to the API server through [`ClusterApi`] so their
//! decision logic can run against an in-memory store in tests. Reads return
//! `Ok(None)` for objects that do not exist; deleting an absent object is a
//! `NotFound` error the caller decides how to treat.

use crate::crd::{ClusterOperator, ServiceCatalogAPIServer};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Read/write surface of the cluster store consumed by the reconcilers.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch the operator configuration by name.
    async fn get_operator_config(&self, name: &str) -> Result<Option<ServiceCatalogAPIServer>>;

    /// Replace `spec.observedConfig` on the given operator configuration.
    async fn update_observed_config(
        &self,
        config: &ServiceCatalogAPIServer,
        observed: serde_json::Value,
    ) -> Result<()>;

    /// Fetch a ClusterOperator by name.
    async fn get_cluster_operator(&self, name: &str) -> Result<Option<ClusterOperator>>;

    /// Fetch a namespace by name.
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Request deletion of a namespace.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Write `spec.finalizers` through the namespace `finalize` subresource.
    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<Namespace>;
}

/// [`ClusterApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_operator_config(&self, name: &str) -> Result<Option<ServiceCatalogAPIServer>> {
        let api: Api<ServiceCatalogAPIServer> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_observed_config(
        &self,
        config: &ServiceCatalogAPIServer,
        observed: serde_json::Value,
    ) -> Result<()> {
        let api: Api<ServiceCatalogAPIServer> = Api::all(self.client.clone());
        let mut updated = config.clone();
        updated.spec.observed_config = Some(observed);
        // resourceVersion is carried over, so a concurrent writer makes this fail and retry
        api.replace(&config.name_any(), &PostParams::default(), &updated)
            .await?;
        Ok(())
    }

    async fn get_cluster_operator(&self, name: &str) -> Result<Option<ClusterOperator>> {
        let api: Api<ClusterOperator> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(namespace = %name, "Namespace deletion requested");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(OperatorError::not_found("Namespace", name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let body = serde_json::to_vec(namespace)?;
        let finalized = api
            .replace_subresource("finalize", &namespace.name_any(), &PostParams::default(), body)
            .await?;
        Ok(finalized)
    }
}
