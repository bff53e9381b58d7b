//! ListOffsets API handler (API Key 2)
//!
//! - earliest (-2): virtual partitions start at 0 from the index origin
//! - latest (-1): the index catches up to the physical log end, then the
//!   virtual partition's record count is its log end
//! - timestamp: the physical offset of the first record at or after the
//!   timestamp is located on the broker, then records of the virtual
//!   partition before it are counted

use futures::future::join_all;
use tracing::debug;

use partmux_core::PartitionKey;

use super::scan::{
    catch_up, ensure_index, fetch_physical, list_physical_offset, record_read, SCAN_FETCH_BYTES,
};
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::protocol::list_offsets::{
    ListOffsetsPartition, ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use crate::protocol::{ListOffsetsRequest, ListOffsetsResponse};
use crate::session::SessionContext;
use crate::types::{EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};

/// Handle ListOffsets request
pub async fn handle_list_offsets(
    ctx: &SessionContext,
    request: &ListOffsetsRequest,
) -> ListOffsetsResponse {
    let topics = request.topics.iter().map(|topic| async move {
        let partitions = topic.partitions.iter().map(|partition| async move {
            match list_virtual(ctx, &topic.name, partition).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(
                        topic = %topic.name,
                        virtual_partition = partition.partition_index,
                        timestamp = partition.timestamp,
                        error = %e,
                        "ListOffsets failed for virtual partition"
                    );
                    ListOffsetsPartitionResponse::error(partition.partition_index, e.error_code())
                }
            }
        });

        ListOffsetsTopicResponse {
            name: topic.name.clone(),
            partitions: join_all(partitions).await,
        }
    });

    ListOffsetsResponse {
        throttle_time_ms: 0,
        topics: join_all(topics).await,
    }
}

/// Response carrying `error_code` for every requested partition
pub fn error_response(request: &ListOffsetsRequest, error_code: i16) -> ListOffsetsResponse {
    ListOffsetsResponse {
        throttle_time_ms: 0,
        topics: request
            .topics
            .iter()
            .map(|topic| ListOffsetsTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| ListOffsetsPartitionResponse::error(p.partition_index, error_code))
                    .collect(),
            })
            .collect(),
    }
}

async fn list_virtual(
    ctx: &SessionContext,
    topic: &str,
    partition: &ListOffsetsPartition,
) -> ProxyResult<ListOffsetsPartitionResponse> {
    let virtual_partition = partition.partition_index;
    if !ctx.state.mapping_for(topic).contains_virtual(virtual_partition) {
        return Err(ProxyError::InvalidPartition {
            topic: topic.to_string(),
            partition: virtual_partition,
        });
    }

    let physical = ctx.state.mapping_for(topic).physical_partition_for(virtual_partition)?;
    let key = PartitionKey::new(topic, physical);

    let (timestamp, offset) = match partition.timestamp {
        EARLIEST_TIMESTAMP => (-1, 0),
        LATEST_TIMESTAMP => (-1, latest(ctx, &key, virtual_partition).await?),
        timestamp => by_timestamp(ctx, &key, virtual_partition, timestamp).await?,
    };

    Ok(ListOffsetsPartitionResponse {
        partition_index: virtual_partition,
        error_code: ErrorCode::None.as_i16(),
        timestamp,
        offset,
        leader_epoch: -1,
    })
}

async fn latest(
    ctx: &SessionContext,
    key: &PartitionKey,
    virtual_partition: i32,
) -> ProxyResult<i64> {
    let (_, log_end) = list_physical_offset(ctx, key, LATEST_TIMESTAMP).await?;
    ensure_index(ctx, key).await?;

    if !catch_up(ctx, key, log_end).await? {
        return Err(ProxyError::Backend(ErrorCode::OffsetNotAvailable.as_i16()));
    }
    Ok(ctx.state.index.count(key, virtual_partition).unwrap_or(0))
}

/// Virtual offset and timestamp of the first record of `virtual_partition`
/// stamped at or after `timestamp`, `(-1, -1)` if there is none.
async fn by_timestamp(
    ctx: &SessionContext,
    key: &PartitionKey,
    virtual_partition: i32,
    timestamp: i64,
) -> ProxyResult<(i64, i64)> {
    let (_, target) = list_physical_offset(ctx, key, timestamp).await?;
    if target < 0 {
        return Ok((-1, -1));
    }
    ensure_index(ctx, key).await?;

    let start = ctx
        .state
        .index
        .anchor_before(key, virtual_partition, target)
        .ok_or(ProxyError::Backend(ErrorCode::OffsetNotAvailable.as_i16()))?;

    let mut cursor = start.physical_offset;
    let mut next_virtual = start.virtual_offset;

    for _ in 0..ctx.state.config.fetch_max_rounds {
        let read = fetch_physical(ctx, key, cursor, SCAN_FETCH_BYTES, 0).await?;
        let Some(next) = read.next_offset() else {
            if cursor >= read.high_watermark {
                return Ok((-1, -1));
            }
            break;
        };
        record_read(ctx, key, cursor, &read);

        for batch in read.batches.iter().filter(|b| !b.is_control()) {
            for record in batch.records.iter().filter(|r| r.offset >= cursor) {
                if record.virtual_partition() != Some(virtual_partition) {
                    continue;
                }
                if record.offset >= target {
                    ctx.state
                        .index
                        .remember(key, virtual_partition, next_virtual, target);
                    return Ok((record.timestamp, next_virtual));
                }
                next_virtual += 1;
            }
        }
        cursor = next;
    }

    Err(ProxyError::Backend(ErrorCode::OffsetNotAvailable.as_i16()))
}
