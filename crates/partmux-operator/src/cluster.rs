//! Cluster access used by the reconciler
//!
//! [`ClusterApi`] is the only way the reconciler touches the cluster.
//! `KubeCluster` talks to the API server; [`MemoryCluster`] keeps objects in
//! memory and counts every mutation, which is what the idempotency tests
//! assert on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus,
};
use parking_lot::Mutex;

use crate::crd::VirtualPartitionProxyStatus;
use crate::error::{Error, Result};

/// Cluster operations needed to converge one proxy resource
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create or update `deployment`, returning the stored object
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Create or update `service`, returning the stored object
    async fn apply_service(&self, service: &Service) -> Result<Service>;

    /// Replace the status of the named proxy resource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualPartitionProxyStatus,
    ) -> Result<()>;
}

type ObjectKey = (String, String);

fn object_key(namespace: Option<&String>, name: Option<&String>) -> Result<ObjectKey> {
    let namespace = namespace.ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = name.ok_or(Error::MissingObjectKey("metadata.name"))?;
    Ok((namespace.clone(), name.clone()))
}

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

/// In-memory cluster
///
/// Applied objects replace stored ones but keep their status, which only the
/// `set_*` helpers change, the way controllers outside the operator would.
#[derive(Default)]
pub struct MemoryCluster {
    deployments: Mutex<HashMap<ObjectKey, Deployment>>,
    services: Mutex<HashMap<ObjectKey, Service>>,
    statuses: Mutex<HashMap<ObjectKey, VirtualPartitionProxyStatus>>,
    mutations: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of applies and status patches performed so far
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.deployments.lock().get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.services.lock().get(&key(namespace, name)).cloned()
    }

    pub fn status(&self, namespace: &str, name: &str) -> Option<VirtualPartitionProxyStatus> {
        self.statuses.lock().get(&key(namespace, name)).cloned()
    }

    /// Report `ready` pods for a stored Deployment
    pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: i32) {
        if let Some(deployment) = self.deployments.lock().get_mut(&key(namespace, name)) {
            deployment.status = Some(DeploymentStatus {
                ready_replicas: Some(ready),
                replicas: Some(ready),
                ..Default::default()
            });
        }
    }

    /// Report a load balancer address for a stored Service
    pub fn set_ingress_ip(&self, namespace: &str, name: &str, ip: &str) {
        if let Some(service) = self.services.lock().get_mut(&key(namespace, name)) {
            service.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            });
        }
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let key = object_key(
            deployment.metadata.namespace.as_ref(),
            deployment.metadata.name.as_ref(),
        )?;
        self.mutated();

        let mut deployments = self.deployments.lock();
        let status = deployments.get(&key).and_then(|d| d.status.clone());
        let stored = Deployment {
            status,
            ..deployment.clone()
        };
        deployments.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name))
    }

    async fn apply_service(&self, service: &Service) -> Result<Service> {
        let key = object_key(service.metadata.namespace.as_ref(), service.metadata.name.as_ref())?;
        self.mutated();

        let mut services = self.services.lock();
        let status = services.get(&key).and_then(|s| s.status.clone());
        let stored = Service {
            status,
            ..service.clone()
        };
        services.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualPartitionProxyStatus,
    ) -> Result<()> {
        self.mutated();
        self.statuses.lock().insert(key(namespace, name), status.clone());
        Ok(())
    }
}
