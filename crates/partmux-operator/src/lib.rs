//! # partmux operator
//!
//! Kubernetes controller that deploys partmux proxies from
//! `VirtualPartitionProxy` resources.
//!
//! For each resource the operator validates the partition counts, then
//! keeps a Deployment of proxy pods and a Service in front of them in line
//! with the spec. Status reports the lifecycle phase, conditions, ready
//! replicas, the endpoint clients bootstrap from and the metrics URL. Owned objects carry owner references, so
//! deleting the resource lets the cluster garbage-collect them.
//!
//! ## Modules
//!
//! - [`crd`]: resource types
//! - [`validation`]: spec checks run before anything is written
//! - [`resources`]: Deployment and Service builders
//! - [`cluster`]: the [`ClusterApi`] seam and its in-memory implementation
//! - [`kube_cluster`]: [`ClusterApi`] over the Kubernetes API
//! - [`reconciler`]: the per-resource state machine
//! - [`controller`]: kube runtime wiring

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod kube_cluster;
pub mod reconciler;
pub mod resources;
pub mod validation;

pub use cluster::{ClusterApi, MemoryCluster};
pub use config::OperatorConfig;
pub use crd::{
    Condition, ConditionStatus, Exposure, ExternalTrafficPolicy, KafkaConnectionSpec,
    LoggingSpec, Phase, PodTemplate, ServiceOptions, TopicOverride, VirtualPartitionProxy,
    VirtualPartitionProxySpec, VirtualPartitionProxyStatus,
};
pub use error::{Error, Result};
pub use kube_cluster::KubeCluster;
pub use reconciler::{ReconcileOutcome, Reconciler};
