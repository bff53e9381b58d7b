//! Metadata API handler (API Key 3)
//!
//! The proxy presents itself as the only broker of a cluster in which every
//! topic has V partitions. Physical metadata is fetched from the backend and
//! rewritten: each physical partition becomes the R virtual partitions mapped
//! onto it, all led by the proxy node.

use tracing::warn;

use crate::config::ProxyConfig;
use crate::error::{ErrorCode, ProxyResult};
use crate::protocol::metadata::{MetadataBroker, MetadataPartition, MetadataTopic};
use crate::protocol::{MetadataRequest, MetadataResponse};
use crate::session::SessionContext;

/// Handle Metadata request
pub async fn handle_metadata(
    ctx: &SessionContext,
    request: &MetadataRequest,
) -> ProxyResult<MetadataResponse> {
    let config = &ctx.state.config;

    let backend_request = match request.topic_names() {
        Some(names) => MetadataRequest {
            allow_auto_topic_creation: request.allow_auto_topic_creation,
            ..MetadataRequest::for_topics(names)
        },
        None => MetadataRequest::default(),
    };
    let physical = ctx.backend.metadata(&backend_request).await?;

    let topics = physical
        .topics
        .iter()
        .map(|topic| virtualize_topic(ctx, topic))
        .collect();

    Ok(MetadataResponse {
        topics,
        ..proxy_cluster(config)
    })
}

/// Response reporting `error_code` for every requested topic
pub fn error_response(
    config: &ProxyConfig,
    request: &MetadataRequest,
    error_code: i16,
) -> MetadataResponse {
    let topics = request
        .topic_names()
        .unwrap_or_default()
        .into_iter()
        .map(|name| MetadataTopic {
            error_code,
            name: Some(name),
            topic_id: [0; 16],
            is_internal: false,
            partitions: Vec::new(),
            topic_authorized_operations: i32::MIN,
        })
        .collect();

    MetadataResponse {
        topics,
        ..proxy_cluster(config)
    }
}

/// Cluster description with the proxy as its single broker and controller
fn proxy_cluster(config: &ProxyConfig) -> MetadataResponse {
    MetadataResponse {
        throttle_time_ms: 0,
        brokers: vec![MetadataBroker {
            node_id: config.node_id,
            host: config.advertised_host.clone(),
            port: config.advertised_port,
            rack: None,
        }],
        cluster_id: Some(config.cluster_id.clone()),
        controller_id: config.node_id,
        topics: Vec::new(),
        cluster_authorized_operations: i32::MIN,
    }
}

fn virtualize_topic(ctx: &SessionContext, topic: &MetadataTopic) -> MetadataTopic {
    let mapping = ctx.state.mapping_for(topic.name.as_deref().unwrap_or_default());
    let node_id = ctx.state.config.node_id;

    let mut virtualized = MetadataTopic {
        error_code: topic.error_code,
        name: topic.name.clone(),
        topic_id: topic.topic_id,
        is_internal: topic.is_internal,
        partitions: Vec::new(),
        topic_authorized_operations: i32::MIN,
    };
    if topic.error_code != ErrorCode::None.as_i16() {
        return virtualized;
    }

    if topic.partitions.len() != mapping.physical_partitions() as usize {
        warn!(
            topic = ?topic.name,
            physical_partitions = topic.partitions.len(),
            expected = mapping.physical_partitions(),
            "Topic partition count does not match the mapping"
        );
        virtualized.error_code = ErrorCode::InvalidPartitions.as_i16();
        return virtualized;
    }

    let mut physical: Vec<&MetadataPartition> = topic.partitions.iter().collect();
    physical.sort_by_key(|p| p.partition_index);

    for partition in physical {
        let Ok(virtual_partitions) = mapping.virtual_partitions_for(partition.partition_index)
        else {
            virtualized.error_code = ErrorCode::InvalidPartitions.as_i16();
            virtualized.partitions.clear();
            return virtualized;
        };

        let led = partition.leader_id >= 0;
        for virtual_partition in virtual_partitions {
            virtualized.partitions.push(MetadataPartition {
                error_code: partition.error_code,
                partition_index: virtual_partition,
                leader_id: if led { node_id } else { -1 },
                leader_epoch: partition.leader_epoch,
                replica_nodes: vec![node_id],
                isr_nodes: if led { vec![node_id] } else { Vec::new() },
                offline_replicas: Vec::new(),
            });
        }
    }

    virtualized
}
