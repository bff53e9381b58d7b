//! Physical reads that feed the offset index

use tracing::debug;

use partmux_core::{decode_batches, PartitionKey, RecordBatch, ScannedRecord};
use partmux_observability::metrics::VIRTUAL_PARTITIONS_ACTIVE;

use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::protocol::fetch::{FetchPartition, FetchPartitionResponse, FetchTopic};
use crate::protocol::{FetchRequest, ListOffsetsRequest};
use crate::session::SessionContext;
use crate::types::EARLIEST_TIMESTAMP;

/// Bytes requested per physical fetch while scanning
pub const SCAN_FETCH_BYTES: i32 = 1024 * 1024;

/// One physical fetch, decoded
pub struct PhysicalRead {
    pub batches: Vec<RecordBatch>,
    pub high_watermark: i64,
    pub log_start_offset: i64,
}

impl PhysicalRead {
    /// Offset following the last batch read, if any
    pub fn next_offset(&self) -> Option<i64> {
        self.batches.last().map(RecordBatch::next_offset)
    }

    /// Index view of the batches
    pub fn scanned(&self) -> Vec<Vec<ScannedRecord>> {
        self.batches
            .iter()
            .map(|batch| {
                batch
                    .records
                    .iter()
                    .map(|record| ScannedRecord {
                        offset: record.offset,
                        virtual_partition: if batch.is_control() {
                            None
                        } else {
                            record.virtual_partition()
                        },
                    })
                    .collect()
            })
            .collect()
    }
}

/// Physical ListOffsets for one partition, returning `(timestamp, offset)`
pub async fn list_physical_offset(
    ctx: &SessionContext,
    key: &PartitionKey,
    timestamp: i64,
) -> ProxyResult<(i64, i64)> {
    let request = ListOffsetsRequest::single(&key.topic, key.partition, timestamp);
    let response = ctx.backend.send_to_leader(key, &request).await?;
    let partition = response
        .first_partition()
        .ok_or_else(|| ProxyError::Protocol("ListOffsets response without partitions".into()))?;
    if partition.error_code != ErrorCode::None.as_i16() {
        return Err(ProxyError::Backend(partition.error_code));
    }
    Ok((partition.timestamp, partition.offset))
}

/// Start indexing `key` at its current log start if nothing has yet
pub async fn ensure_index(ctx: &SessionContext, key: &PartitionKey) -> ProxyResult<()> {
    if ctx.state.index.is_initialized(key) {
        return Ok(());
    }
    let (_, log_start) = list_physical_offset(ctx, key, EARLIEST_TIMESTAMP).await?;
    debug!(
        topic = %key.topic,
        partition = key.partition,
        log_start,
        "Initializing offset index"
    );
    ctx.state.index.initialize(key, log_start);
    Ok(())
}

/// Fetch one physical partition from `offset`
pub async fn fetch_physical(
    ctx: &SessionContext,
    key: &PartitionKey,
    offset: i64,
    max_bytes: i32,
    max_wait_ms: i32,
) -> ProxyResult<PhysicalRead> {
    let request = FetchRequest {
        max_wait_ms,
        min_bytes: 1,
        max_bytes,
        topics: vec![FetchTopic {
            topic: key.topic.clone(),
            partitions: vec![FetchPartition::new(key.partition, offset, max_bytes)],
        }],
        ..FetchRequest::default()
    };

    let response = ctx.backend.send_to_leader(key, &request).await?;
    let partition: FetchPartitionResponse = response
        .responses
        .into_iter()
        .flat_map(|t| t.partitions)
        .find(|p| p.partition_index == key.partition)
        .ok_or_else(|| ProxyError::Protocol("Fetch response without the partition".into()))?;

    if partition.error_code != ErrorCode::None.as_i16() {
        return Err(ProxyError::Backend(partition.error_code));
    }

    let batches = match partition.records {
        Some(records) => decode_batches(records)?,
        None => Vec::new(),
    };

    Ok(PhysicalRead {
        batches,
        high_watermark: partition.high_watermark,
        log_start_offset: partition.log_start_offset,
    })
}

/// Count a physical read into the index. Returns false if the read started
/// beyond the frontier and could not be counted.
pub fn record_read(
    ctx: &SessionContext,
    key: &PartitionKey,
    from: i64,
    read: &PhysicalRead,
) -> bool {
    match read.next_offset() {
        Some(next) => record_advance(ctx, key, from, &read.scanned(), next),
        None => true,
    }
}

/// Advance the index over scanned records, tracking newly seen virtual
/// partitions
pub fn record_advance(
    ctx: &SessionContext,
    key: &PartitionKey,
    from: i64,
    batches: &[Vec<ScannedRecord>],
    next: i64,
) -> bool {
    match ctx.state.index.advance(key, from, batches, next) {
        Some(discovered) => {
            if discovered > 0 {
                VIRTUAL_PARTITIONS_ACTIVE.add(discovered as i64);
            }
            true
        }
        None => false,
    }
}

/// Scan forward from the frontier until it reaches `target`, within the
/// configured number of rounds. Returns whether the target was reached.
pub async fn catch_up(ctx: &SessionContext, key: &PartitionKey, target: i64) -> ProxyResult<bool> {
    for _ in 0..ctx.state.config.fetch_max_rounds {
        let frontier = ctx.state.index.frontier(key).unwrap_or(i64::MAX);
        if frontier >= target {
            return Ok(true);
        }

        let read = fetch_physical(ctx, key, frontier, SCAN_FETCH_BYTES, 0).await?;
        if read.batches.is_empty() {
            break;
        }
        record_read(ctx, key, frontier, &read);
    }

    Ok(ctx.state.index.frontier(key).is_some_and(|f| f >= target))
}
