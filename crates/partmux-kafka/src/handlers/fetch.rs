//! Fetch API handler (API Key 1)
//!
//! Each requested virtual partition is served independently. The offset
//! index gives a physical position to start from, then physical fetches
//! walk the shared physical partition, counting records of the requested
//! virtual partition until the requested virtual offset is reached.
//! Records tagged for other virtual partitions only feed the index.
//!
//! Fetch sessions are not supported: every response carries session id 0,
//! so clients fall back to full fetch requests.

use bytes::BytesMut;
use futures::future::join_all;
use tracing::debug;

use partmux_core::record::BATCH_HEADER_SIZE;
use partmux_core::{PartitionKey, Record, RecordBatch, ScanSource};
use partmux_observability::metrics::{
    RECORDS_FETCHED_TOTAL, RECORDS_FILTERED_TOTAL, TRANSLATION_CACHE_HITS_TOTAL,
    TRANSLATION_CACHE_MISSES_TOTAL,
};

use super::scan::{ensure_index, fetch_physical, record_read, SCAN_FETCH_BYTES};
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::protocol::fetch::{FetchPartition, FetchPartitionResponse, FetchTopicResponse};
use crate::protocol::{FetchRequest, FetchResponse};
use crate::session::SessionContext;

/// Handle Fetch request
pub async fn handle_fetch(ctx: &SessionContext, request: &FetchRequest) -> FetchResponse {
    let topics = request.topics.iter().map(|topic| async move {
        let partitions = topic.partitions.iter().map(|partition| async move {
            match fetch_virtual(ctx, request, &topic.topic, partition).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(
                        topic = %topic.topic,
                        virtual_partition = partition.partition,
                        fetch_offset = partition.fetch_offset,
                        error = %e,
                        "Fetch failed for virtual partition"
                    );
                    FetchPartitionResponse::error(partition.partition, e.error_code())
                }
            }
        });

        FetchTopicResponse {
            topic: topic.topic.clone(),
            partitions: join_all(partitions).await,
        }
    });

    FetchResponse {
        throttle_time_ms: 0,
        error_code: ErrorCode::None.as_i16(),
        session_id: 0,
        responses: join_all(topics).await,
    }
}

/// Response carrying `error_code` for every requested partition
pub fn error_response(request: &FetchRequest, error_code: i16) -> FetchResponse {
    FetchResponse {
        throttle_time_ms: 0,
        error_code: ErrorCode::None.as_i16(),
        session_id: 0,
        responses: request
            .topics
            .iter()
            .map(|topic| FetchTopicResponse {
                topic: topic.topic.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| FetchPartitionResponse::error(p.partition, error_code))
                    .collect(),
            })
            .collect(),
    }
}

async fn fetch_virtual(
    ctx: &SessionContext,
    request: &FetchRequest,
    topic: &str,
    partition: &FetchPartition,
) -> ProxyResult<FetchPartitionResponse> {
    let virtual_partition = partition.partition;
    let offset = partition.fetch_offset;

    if !ctx.state.mapping_for(topic).contains_virtual(virtual_partition) {
        return Err(ProxyError::InvalidPartition {
            topic: topic.to_string(),
            partition: virtual_partition,
        });
    }
    if offset < 0 {
        return Err(out_of_range(topic, virtual_partition, offset));
    }

    let physical = ctx.state.mapping_for(topic).physical_partition_for(virtual_partition)?;
    let key = PartitionKey::new(topic, physical);
    ensure_index(ctx, &key).await?;

    let start = ctx
        .state
        .index
        .resolve(&key, virtual_partition, offset)
        .ok_or_else(|| out_of_range(topic, virtual_partition, offset))?;
    match start.source {
        ScanSource::Origin => TRANSLATION_CACHE_MISSES_TOTAL.inc(),
        ScanSource::Cache | ScanSource::Frontier => TRANSLATION_CACHE_HITS_TOTAL.inc(),
    }

    let max_bytes = partition.partition_max_bytes.max(SCAN_FETCH_BYTES);
    let mut cursor = start.physical_offset;
    let mut next_virtual = start.virtual_offset;
    let mut physical_hw: Option<i64> = None;
    let mut waited = false;
    let mut collected: Vec<Record> = Vec::new();
    let mut filtered: u64 = 0;

    for _ in 0..ctx.state.config.fetch_max_rounds {
        // Long-poll only once the physical log is exhausted and nothing matched
        let at_end = physical_hw.is_some_and(|hw| cursor >= hw);
        let max_wait_ms = if at_end && collected.is_empty() {
            waited = true;
            request.max_wait_ms
        } else {
            0
        };

        let read = fetch_physical(ctx, &key, cursor, max_bytes, max_wait_ms).await?;
        physical_hw = Some(read.high_watermark);

        let Some(next) = read.next_offset() else {
            if waited || !collected.is_empty() || read.high_watermark > cursor {
                break;
            }
            continue;
        };

        record_read(ctx, &key, cursor, &read);

        for batch in read.batches.iter().filter(|b| !b.is_control()) {
            for record in batch.records.iter().filter(|r| r.offset >= cursor) {
                if record.virtual_partition() != Some(virtual_partition) {
                    filtered += 1;
                    continue;
                }
                if next_virtual >= offset {
                    let mut record = record.clone();
                    record.offset = next_virtual;
                    record.strip_virtual_partition();
                    collected.push(record);
                }
                next_virtual += 1;
            }
        }
        cursor = next;

        if !collected.is_empty() || waited {
            break;
        }
    }

    if next_virtual > start.virtual_offset {
        ctx.state
            .index
            .remember(&key, virtual_partition, next_virtual, cursor);
    }

    let count = ctx.state.index.count(&key, virtual_partition).unwrap_or(0);
    let frontier = ctx.state.index.frontier(&key).unwrap_or(cursor);
    let physical_hw = physical_hw.unwrap_or(cursor);
    let (high_watermark, exact) = if frontier >= physical_hw {
        (count, true)
    } else if cursor >= physical_hw {
        (next_virtual.max(count), true)
    } else {
        (next_virtual.max(count), false)
    };

    if collected.is_empty() && exact && offset > high_watermark {
        return Err(out_of_range(topic, virtual_partition, offset));
    }

    let kept = records_within(&collected, partition.partition_max_bytes);
    collected.truncate(kept);

    RECORDS_FETCHED_TOTAL.inc_by(collected.len() as u64);
    RECORDS_FILTERED_TOTAL.inc_by(filtered);

    let mut records = BytesMut::new();
    if !collected.is_empty() {
        RecordBatch::new(collected).encode(&mut records)?;
    }

    Ok(FetchPartitionResponse {
        partition_index: virtual_partition,
        error_code: ErrorCode::None.as_i16(),
        high_watermark,
        last_stable_offset: high_watermark,
        log_start_offset: 0,
        aborted_transactions: None,
        preferred_read_replica: -1,
        records: Some(records.freeze()),
    })
}

/// Number of leading records that fit in one batch of at most `max_bytes`.
/// The first record is always kept so that a consumer can make progress.
fn records_within(records: &[Record], max_bytes: i32) -> usize {
    let limit = usize::try_from(max_bytes).unwrap_or(0);
    let mut size = BATCH_HEADER_SIZE;
    let mut kept = 0;
    for record in records {
        size += record.size_hint();
        if kept > 0 && size > limit {
            break;
        }
        kept += 1;
    }
    kept
}

fn out_of_range(topic: &str, partition: i32, offset: i64) -> ProxyError {
    ProxyError::OffsetTranslationFailure {
        topic: topic.to_string(),
        partition,
        offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(offset: i64, len: usize) -> Record {
        Record::new(offset, 0, None, Some(Bytes::from(vec![b'x'; len])))
    }

    #[test]
    fn test_records_within_limit() {
        let records: Vec<Record> = (0..5).map(|i| record(i, 1000)).collect();
        let one = BATCH_HEADER_SIZE + records[0].size_hint();

        assert_eq!(records_within(&records, i32::MAX), 5);
        assert_eq!(records_within(&records, (one + 2 * records[1].size_hint()) as i32), 3);
        assert_eq!(records_within(&records, (one + 10) as i32), 1);
    }

    #[test]
    fn test_first_record_always_kept() {
        let records = vec![record(0, 5000), record(1, 10)];
        assert_eq!(records_within(&records, 100), 1);
        assert_eq!(records_within(&records, 0), 1);
        assert_eq!(records_within(&[], 100), 0);
    }
}
