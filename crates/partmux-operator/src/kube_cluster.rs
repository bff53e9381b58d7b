//! [`ClusterApi`] backed by the Kubernetes API server

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::cluster::ClusterApi;
use crate::crd::{VirtualPartitionProxy, VirtualPartitionProxyStatus};
use crate::error::{Error, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "partmux-operator";

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

fn namespace_of<K: ResourceExt>(object: &K) -> Result<String> {
    object
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = namespace_of(deployment)?;
        let name = deployment.name_any();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        debug!(namespace = %namespace, name = %name, "Applying Deployment");
        Ok(api
            .patch(&name, &Self::apply_params(), &Patch::Apply(deployment))
            .await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_service(&self, service: &Service) -> Result<Service> {
        let namespace = namespace_of(service)?;
        let name = service.name_any();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        debug!(namespace = %namespace, name = %name, "Applying Service");
        Ok(api
            .patch(&name, &Self::apply_params(), &Patch::Apply(service))
            .await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualPartitionProxyStatus,
    ) -> Result<()> {
        let api: Api<VirtualPartitionProxy> = Api::namespaced(self.client.clone(), namespace);
        // Explicit nulls so a merge patch clears fields that became unset
        let patch = json!({
            "status": {
                "phase": status.phase,
                "readyReplicas": status.ready_replicas,
                "endpoint": status.endpoint,
                "message": status.message,
                "observedGeneration": status.observed_generation,
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
