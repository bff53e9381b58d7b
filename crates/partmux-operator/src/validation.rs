//! Spec validation run before any workload is written

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Affinity;
use partmux_core::PartitionMapping;

use crate::crd::{Exposure, PodTemplate, VirtualPartitionProxySpec};
use crate::error::{Error, Result};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Validate `spec`, returning the partition mapping it describes.
pub fn validate(spec: &VirtualPartitionProxySpec) -> Result<PartitionMapping> {
    if spec.bootstrap_servers.iter().all(|s| s.trim().is_empty()) {
        return Err(Error::Validation(
            "bootstrapServers must list at least one broker".to_string(),
        ));
    }

    if spec.physical_partitions < 1 {
        return Err(Error::Validation(format!(
            "physicalPartitions must be >= 1, got {}",
            spec.physical_partitions
        )));
    }

    if spec.virtual_partitions < spec.physical_partitions {
        return Err(Error::Validation(format!(
            "virtualPartitions ({}) must be >= physicalPartitions ({})",
            spec.virtual_partitions, spec.physical_partitions
        )));
    }

    let mapping = PartitionMapping::new(spec.virtual_partitions, spec.physical_partitions)?;

    if spec.replicas < 1 {
        return Err(Error::Validation(format!(
            "replicas must be >= 1, got {}",
            spec.replicas
        )));
    }

    for (field, port) in [
        ("listenPort", spec.listen_port),
        ("metricsPort", spec.metrics_port),
    ] {
        if !(1..=65535).contains(&port) {
            return Err(Error::Validation(format!(
                "{} must be in 1..=65535, got {}",
                field, port
            )));
        }
    }

    if spec.listen_port == spec.metrics_port {
        return Err(Error::Validation(format!(
            "listenPort and metricsPort must differ, both are {}",
            spec.listen_port
        )));
    }

    if spec.kafka.connection_timeout_ms == 0 || spec.kafka.request_timeout_ms == 0 {
        return Err(Error::Validation(
            "kafka.connectionTimeoutMs and kafka.requestTimeoutMs must be >= 1".to_string(),
        ));
    }

    if !LOG_LEVELS.contains(&spec.logging.level.as_str()) {
        return Err(Error::Validation(format!(
            "logging.level must be one of {}, got {:?}",
            LOG_LEVELS.join(", "),
            spec.logging.level
        )));
    }

    validate_topic_overrides(spec)?;

    if spec.exposure != Exposure::External
        && (spec.service.load_balancer_ip.is_some()
            || spec.service.external_traffic_policy.is_some())
    {
        return Err(Error::Validation(
            "service.loadBalancerIP and service.externalTrafficPolicy require External exposure"
                .to_string(),
        ));
    }

    if let Some(template) = &spec.pod_template {
        validate_pod_template(template)?;
    }

    Ok(mapping)
}

fn validate_topic_overrides(spec: &VirtualPartitionProxySpec) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in &spec.topic_overrides {
        let topic = entry.topic.trim();
        if topic.is_empty() || topic.contains(['=', ',']) {
            return Err(Error::Validation(format!(
                "topicOverrides: invalid topic name {:?}",
                entry.topic
            )));
        }
        if !seen.insert(topic) {
            return Err(Error::Validation(format!(
                "topicOverrides: topic {} listed twice",
                topic
            )));
        }

        let (virtual_partitions, physical_partitions) = entry.counts(spec);
        if virtual_partitions < physical_partitions {
            return Err(Error::Validation(format!(
                "topicOverrides[{}]: virtualPartitions ({}) must be >= physicalPartitions ({})",
                topic, virtual_partitions, physical_partitions
            )));
        }
        PartitionMapping::new(virtual_partitions, physical_partitions).map_err(|e| match e {
            partmux_core::Error::ConfigInvariantViolation(msg) => {
                Error::ConfigInvariantViolation(format!("topicOverrides[{}]: {}", topic, msg))
            }
            other => other.into(),
        })?;
    }
    Ok(())
}

/// Parse the free-form affinity into its Kubernetes type.
pub fn pod_affinity(template: &PodTemplate) -> Result<Option<Affinity>> {
    template
        .affinity
        .clone()
        .map(serde_json::from_value::<Affinity>)
        .transpose()
        .map_err(|e| Error::Validation(format!("podTemplate.affinity: {}", e)))
}

fn validate_pod_template(template: &PodTemplate) -> Result<()> {
    if let Some(policy) = &template.image_pull_policy {
        if !PULL_POLICIES.contains(&policy.as_str()) {
            return Err(Error::Validation(format!(
                "podTemplate.imagePullPolicy must be one of {}, got {:?}",
                PULL_POLICIES.join(", "),
                policy
            )));
        }
    }
    pod_affinity(template)?;
    Ok(())
}
