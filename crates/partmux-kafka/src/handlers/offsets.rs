//! OffsetCommit (API Key 8) and OffsetFetch (API Key 9) handlers
//!
//! Committed offsets are virtual offsets, so they cannot be stored against
//! the physical partition under the client's group: several virtual
//! partitions share it. Each virtual partition gets its own composite group
//! on the backend instead:
//!
//! ```text
//! commit(group "billing", topic "orders", virtual 42, offset 17)
//!   -> commit(group "billing.vp42", topic "orders", physical 4, offset 17)
//! ```
//!
//! Composite groups hold simple commits (generation -1), so they survive
//! proxy restarts and are shared by every proxy replica.

use std::collections::HashMap;

use futures::future::join_all;
use tracing::debug;

use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::protocol::offset_commit::{
    OffsetCommitPartition, OffsetCommitPartitionResponse, OffsetCommitTopic,
    OffsetCommitTopicResponse,
};
use crate::protocol::offset_fetch::{
    OffsetFetchPartitionResponse, OffsetFetchTopic, OffsetFetchTopicResponse,
};
use crate::protocol::{
    OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse,
};
use crate::session::SessionContext;
use crate::types::CoordinatorType;

/// Backend group holding commits of one virtual partition
pub fn composite_group(group_id: &str, virtual_partition: i32) -> String {
    format!("{}.vp{}", group_id, virtual_partition)
}

/// Position of a requested partition in the client's request
#[derive(Debug, Clone, Copy)]
struct Slot {
    topic: usize,
    partition: usize,
    physical: i32,
}

/// Error code for a failed composite group round-trip
fn coordinator_error(e: &ProxyError) -> i16 {
    match e {
        ProxyError::BackendUnavailable(_) => ErrorCode::CoordinatorNotAvailable.as_i16(),
        other => other.error_code(),
    }
}

/// Handle OffsetCommit request
pub async fn handle_offset_commit(
    ctx: &SessionContext,
    request: &OffsetCommitRequest,
) -> OffsetCommitResponse {
    let mut topics: Vec<OffsetCommitTopicResponse> = request
        .topics
        .iter()
        .map(|topic| OffsetCommitTopicResponse {
            name: topic.name.clone(),
            partitions: topic
                .partitions
                .iter()
                .map(|p| OffsetCommitPartitionResponse {
                    partition_index: p.partition_index,
                    error_code: ErrorCode::None.as_i16(),
                })
                .collect(),
        })
        .collect();

    let mut groups: HashMap<String, (Vec<OffsetCommitTopic>, Vec<Slot>)> = HashMap::new();
    for (topic_idx, topic) in request.topics.iter().enumerate() {
        for (partition_idx, partition) in topic.partitions.iter().enumerate() {
            let virtual_partition = partition.partition_index;
            let mapping = ctx.state.mapping_for(&topic.name);
            let physical = match mapping.physical_partition_for(virtual_partition) {
                Ok(physical) => physical,
                Err(e) => {
                    topics[topic_idx].partitions[partition_idx].error_code =
                        ProxyError::from(e).error_code();
                    continue;
                }
            };

            let (commits, slots) = groups
                .entry(composite_group(&request.group_id, virtual_partition))
                .or_default();
            commits.push(OffsetCommitTopic {
                name: topic.name.clone(),
                partitions: vec![OffsetCommitPartition {
                    partition_index: physical,
                    ..partition.clone()
                }],
            });
            slots.push(Slot {
                topic: topic_idx,
                partition: partition_idx,
                physical,
            });
        }
    }

    let commits = groups.into_iter().map(|(group, (commits, slots))| async move {
        let commit = OffsetCommitRequest::simple(group.clone(), commits);
        let result = ctx
            .backend
            .send_to_coordinator(&group, CoordinatorType::Group, &commit)
            .await;
        (group, slots, result)
    });

    for (group, slots, result) in join_all(commits).await {
        for slot in slots {
            let name = &request.topics[slot.topic].name;
            let code = match &result {
                Ok(response) => response
                    .topics
                    .iter()
                    .filter(|t| &t.name == name)
                    .flat_map(|t| t.partitions.iter())
                    .find(|p| p.partition_index == slot.physical)
                    .map(|p| p.error_code)
                    .unwrap_or(ErrorCode::UnknownServerError.as_i16()),
                Err(e) => {
                    debug!(group = %group, error = %e, "Composite group commit failed");
                    coordinator_error(e)
                }
            };
            topics[slot.topic].partitions[slot.partition].error_code = code;
        }
    }

    OffsetCommitResponse {
        throttle_time_ms: 0,
        topics,
    }
}

/// OffsetCommit response carrying `error_code` for every partition
pub fn commit_error_response(
    request: &OffsetCommitRequest,
    error_code: i16,
) -> OffsetCommitResponse {
    OffsetCommitResponse {
        throttle_time_ms: 0,
        topics: request
            .topics
            .iter()
            .map(|topic| OffsetCommitTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| OffsetCommitPartitionResponse {
                        partition_index: p.partition_index,
                        error_code,
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Handle OffsetFetch request.
///
/// A null topic list would mean "every partition the group committed", which
/// cannot be enumerated across composite groups; it is answered with no
/// topics.
pub async fn handle_offset_fetch(
    ctx: &SessionContext,
    request: &OffsetFetchRequest,
) -> OffsetFetchResponse {
    let Some(requested) = &request.topics else {
        return OffsetFetchResponse::default();
    };

    let mut topics: Vec<OffsetFetchTopicResponse> = requested
        .iter()
        .map(|topic| OffsetFetchTopicResponse {
            name: topic.name.clone(),
            partitions: topic
                .partition_indexes
                .iter()
                .map(|&p| OffsetFetchPartitionResponse::error(p, ErrorCode::None.as_i16()))
                .collect(),
        })
        .collect();

    let mut groups: HashMap<String, (Vec<OffsetFetchTopic>, Vec<Slot>)> = HashMap::new();
    for (topic_idx, topic) in requested.iter().enumerate() {
        for (partition_idx, &virtual_partition) in topic.partition_indexes.iter().enumerate() {
            let mapping = ctx.state.mapping_for(&topic.name);
            let physical = match mapping.physical_partition_for(virtual_partition) {
                Ok(physical) => physical,
                Err(e) => {
                    topics[topic_idx].partitions[partition_idx].error_code =
                        ProxyError::from(e).error_code();
                    continue;
                }
            };

            let (lookups, slots) = groups
                .entry(composite_group(&request.group_id, virtual_partition))
                .or_default();
            lookups.push(OffsetFetchTopic {
                name: topic.name.clone(),
                partition_indexes: vec![physical],
            });
            slots.push(Slot {
                topic: topic_idx,
                partition: partition_idx,
                physical,
            });
        }
    }

    let lookups = groups.into_iter().map(|(group, (lookups, slots))| async move {
        let lookup = OffsetFetchRequest {
            group_id: group.clone(),
            topics: Some(lookups),
            require_stable: false,
        };
        let result = ctx
            .backend
            .send_to_coordinator(&group, CoordinatorType::Group, &lookup)
            .await;
        (group, slots, result)
    });

    for (group, slots, result) in join_all(lookups).await {
        for slot in slots {
            let name = &requested[slot.topic].name;
            let entry = &mut topics[slot.topic].partitions[slot.partition];
            match committed(&result, name, slot.physical) {
                Ok(Some(found)) => {
                    entry.committed_offset = found.committed_offset;
                    entry.metadata = found.metadata.clone();
                    entry.error_code = found.error_code;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(group = %group, error = %e, "Composite group offset fetch failed");
                    entry.error_code = coordinator_error(e);
                }
            }
        }
    }

    OffsetFetchResponse {
        throttle_time_ms: 0,
        topics,
        error_code: ErrorCode::None.as_i16(),
    }
}

fn committed<'a>(
    result: &'a ProxyResult<OffsetFetchResponse>,
    topic: &str,
    physical: i32,
) -> Result<Option<&'a OffsetFetchPartitionResponse>, &'a ProxyError> {
    let response = result.as_ref()?;
    Ok(response
        .topics
        .iter()
        .filter(|t| t.name == topic)
        .flat_map(|t| t.partitions.iter())
        .find(|p| p.partition_index == physical))
}

/// OffsetFetch response carrying `error_code` for every partition
pub fn fetch_error_response(request: &OffsetFetchRequest, error_code: i16) -> OffsetFetchResponse {
    let topics = request
        .topics
        .iter()
        .flatten()
        .map(|topic| OffsetFetchTopicResponse {
            name: topic.name.clone(),
            partitions: topic
                .partition_indexes
                .iter()
                .map(|&p| OffsetFetchPartitionResponse::error(p, error_code))
                .collect(),
        })
        .collect();

    OffsetFetchResponse {
        throttle_time_ms: 0,
        topics,
        error_code,
    }
}
