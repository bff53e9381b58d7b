//! Produce API handler (API Key 0)
//!
//! Records addressed to virtual partitions are tagged with their virtual
//! partition id, merged per physical partition into one uncompressed batch
//! and written to the physical leaders. Physical base offsets in the acks
//! are translated back to virtual offsets through the offset index.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tracing::{debug, warn};

use partmux_core::{decode_batches, PartitionKey, Record, RecordBatch, ScannedRecord};
use partmux_observability::metrics::RECORDS_PRODUCED_TOTAL;

use super::scan::{catch_up, ensure_index, record_advance};
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::protocol::produce::{
    ProducePartitionData, ProducePartitionResponse, ProduceTopicData, ProduceTopicResponse,
};
use crate::protocol::{ProduceRequest, ProduceResponse};
use crate::session::SessionContext;

/// Records of one virtual partition inside a merged physical batch
#[derive(Debug, Clone, Copy)]
struct Slot {
    topic: usize,
    partition: usize,
    virtual_partition: i32,
    /// Index of the slot's first record within the merged batch
    start: usize,
}

/// Everything written to one physical partition by a request
struct PhysicalWrite {
    key: PartitionKey,
    tags: Vec<i32>,
    payload: Bytes,
    slots: Vec<Slot>,
}

struct PendingWrite {
    key: PartitionKey,
    records: Vec<Record>,
    slots: Vec<Slot>,
}

/// Handle Produce request.
///
/// Returns `None` for `acks=0`, which the client expects no answer to.
pub async fn handle_produce(
    ctx: &SessionContext,
    request: &ProduceRequest,
) -> ProxyResult<Option<ProduceResponse>> {
    let mut responses: Vec<ProduceTopicResponse> = request
        .topics
        .iter()
        .map(|topic| ProduceTopicResponse {
            name: topic.name.clone(),
            partitions: topic
                .partitions
                .iter()
                .map(|p| ProducePartitionResponse::error(p.index, ErrorCode::None.as_i16()))
                .collect(),
        })
        .collect();

    if request.transactional_id.is_some() {
        warn!("Rejecting transactional produce");
        let code = ErrorCode::TransactionalIdAuthorizationFailed.as_i16();
        for partition in responses.iter_mut().flat_map(|t| t.partitions.iter_mut()) {
            partition.error_code = code;
        }
        return Ok(Some(ProduceResponse {
            responses,
            throttle_time_ms: 0,
        }));
    }

    let mut pending: Vec<PendingWrite> = Vec::new();
    let mut by_key: HashMap<PartitionKey, usize> = HashMap::new();

    for (topic_idx, topic) in request.topics.iter().enumerate() {
        for (partition_idx, data) in topic.partitions.iter().enumerate() {
            let records = match tagged_records(ctx, &topic.name, data) {
                Ok(records) => records,
                Err((code, e)) => {
                    debug!(
                        topic = %topic.name,
                        virtual_partition = data.index,
                        error = %e,
                        "Rejecting produce partition"
                    );
                    responses[topic_idx].partitions[partition_idx].error_code = code;
                    continue;
                }
            };

            let physical = ctx.state.mapping_for(&topic.name).physical_partition_for(data.index)?;
            let key = PartitionKey::new(topic.name.as_str(), physical);
            let write_idx = *by_key.entry(key.clone()).or_insert_with(|| {
                pending.push(PendingWrite {
                    key,
                    records: Vec::new(),
                    slots: Vec::new(),
                });
                pending.len() - 1
            });

            let write = &mut pending[write_idx];
            write.slots.push(Slot {
                topic: topic_idx,
                partition: partition_idx,
                virtual_partition: data.index,
                start: write.records.len(),
            });
            write.records.extend(records);
        }
    }

    let writes = pending
        .into_iter()
        .map(merge)
        .collect::<ProxyResult<Vec<PhysicalWrite>>>()?;

    if request.acks == 0 {
        write_without_acks(ctx, request, &writes).await;
        return Ok(None);
    }

    let results = write_physical(ctx, request, &writes).await;

    let acks = writes.iter().zip(results).map(|(write, result)| async move {
        match result {
            Ok(ack) => {
                RECORDS_PRODUCED_TOTAL.inc_by(write.tags.len() as u64);
                let offsets = translate_acks(ctx, write, ack.base_offset).await;
                (write, Ok((ack, offsets)))
            }
            Err(code) => (write, Err(code)),
        }
    });

    for (write, result) in join_all(acks).await {
        for (slot_idx, slot) in write.slots.iter().enumerate() {
            let entry = &mut responses[slot.topic].partitions[slot.partition];
            match &result {
                Ok((ack, offsets)) => {
                    entry.error_code = ErrorCode::None.as_i16();
                    entry.base_offset = offsets[slot_idx];
                    entry.log_append_time_ms = ack.log_append_time_ms;
                }
                Err(code) => entry.error_code = *code,
            }
        }
    }

    Ok(Some(ProduceResponse {
        responses,
        throttle_time_ms: 0,
    }))
}

/// Response carrying `error_code` for every partition, `None` for `acks=0`
pub fn error_response(request: &ProduceRequest, error_code: i16) -> Option<ProduceResponse> {
    if request.acks == 0 {
        return None;
    }
    Some(ProduceResponse {
        responses: request
            .topics
            .iter()
            .map(|topic| ProduceTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| ProducePartitionResponse::error(p.index, error_code))
                    .collect(),
            })
            .collect(),
        throttle_time_ms: 0,
    })
}

/// Decode one partition's records and tag them with its virtual partition
fn tagged_records(
    ctx: &SessionContext,
    topic: &str,
    data: &ProducePartitionData,
) -> Result<Vec<Record>, (i16, ProxyError)> {
    if !ctx.state.mapping_for(topic).contains_virtual(data.index) {
        let err = ProxyError::InvalidPartition {
            topic: topic.to_string(),
            partition: data.index,
        };
        return Err((err.error_code(), err));
    }

    let payload = data.records.clone().unwrap_or_default();
    let batches = decode_batches(payload).map_err(|e| {
        let err = ProxyError::from(e);
        (err.error_code(), err)
    })?;

    let records: Vec<Record> = batches
        .into_iter()
        .filter(|batch| !batch.is_control())
        .flat_map(|batch| batch.records)
        .map(|mut record| {
            record.set_virtual_partition(data.index);
            record
        })
        .collect();

    if records.is_empty() {
        let err = ProxyError::Protocol("produce partition without records".to_string());
        return Err((ErrorCode::CorruptMessage.as_i16(), err));
    }
    Ok(records)
}

/// Encode the merged records of one physical partition as a single batch
fn merge(pending: PendingWrite) -> ProxyResult<PhysicalWrite> {
    let PendingWrite {
        key,
        mut records,
        slots,
    } = pending;

    let mut tags = Vec::with_capacity(records.len());
    for (i, record) in records.iter_mut().enumerate() {
        record.offset = i as i64;
        tags.push(record.virtual_partition().unwrap_or(-1));
    }

    let mut batch = RecordBatch::new(records);
    batch.clear_producer_state();
    let mut buf = BytesMut::new();
    batch.encode(&mut buf)?;

    Ok(PhysicalWrite {
        key,
        tags,
        payload: buf.freeze(),
        slots,
    })
}

fn physical_request(request: &ProduceRequest, writes: &[&PhysicalWrite]) -> ProduceRequest {
    let mut topics: Vec<ProduceTopicData> = Vec::new();
    for write in writes {
        let data = ProducePartitionData {
            index: write.key.partition,
            records: Some(write.payload.clone()),
        };
        match topics.iter_mut().find(|t| t.name == write.key.topic) {
            Some(topic) => topic.partitions.push(data),
            None => topics.push(ProduceTopicData {
                name: write.key.topic.clone(),
                partitions: vec![data],
            }),
        }
    }

    ProduceRequest {
        transactional_id: None,
        acks: request.acks,
        timeout_ms: request.timeout_ms,
        topics,
    }
}

async fn group_by_leader(
    ctx: &SessionContext,
    writes: &[PhysicalWrite],
    indices: &[usize],
    failed: &mut Vec<(usize, i16)>,
) -> HashMap<String, Vec<usize>> {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for &i in indices {
        match ctx.backend.leader_for(&writes[i].key).await {
            Ok(addr) => groups.entry(addr).or_default().push(i),
            Err(e) => failed.push((i, e.error_code())),
        }
    }
    groups
}

/// Send each physical write to its leader, one request per leader. Writes
/// answered with a stale leader error are sent once more after a metadata
/// refresh.
async fn write_physical(
    ctx: &SessionContext,
    request: &ProduceRequest,
    writes: &[PhysicalWrite],
) -> Vec<Result<ProducePartitionResponse, i16>> {
    let mut results: Vec<Option<Result<ProducePartitionResponse, i16>>> =
        (0..writes.len()).map(|_| None).collect();
    let mut pending: Vec<usize> = (0..writes.len()).collect();

    for round in 0..2 {
        if pending.is_empty() {
            break;
        }
        let last_round = round == 1;

        let mut failed = Vec::new();
        let groups = group_by_leader(ctx, writes, &pending, &mut failed).await;
        for (i, code) in failed {
            results[i] = Some(Err(code));
        }
        pending.clear();

        let sends = groups.into_iter().map(|(addr, indices)| async move {
            let batch: Vec<&PhysicalWrite> = indices.iter().map(|&i| &writes[i]).collect();
            let physical = physical_request(request, &batch);
            let result = ctx.backend.send_to(&addr, &physical).await;
            (indices, result)
        });

        for (indices, result) in join_all(sends).await {
            match result {
                Ok(response) => {
                    for i in indices {
                        let key = &writes[i].key;
                        let ack = response
                            .responses
                            .iter()
                            .filter(|t| t.name == key.topic)
                            .flat_map(|t| t.partitions.iter())
                            .find(|p| p.index == key.partition);

                        match ack {
                            Some(ack)
                                if ErrorCode::is_stale_leader(ack.error_code) && !last_round =>
                            {
                                ctx.backend.invalidate_leader(key);
                                pending.push(i);
                            }
                            Some(ack) if ack.error_code == ErrorCode::None.as_i16() => {
                                results[i] = Some(Ok(ack.clone()));
                            }
                            Some(ack) => results[i] = Some(Err(ack.error_code)),
                            None => {
                                results[i] = Some(Err(ErrorCode::UnknownServerError.as_i16()))
                            }
                        }
                    }
                }
                Err(e) => {
                    for i in indices {
                        if e.is_retriable() && !last_round {
                            ctx.backend.invalidate_leader(&writes[i].key);
                            pending.push(i);
                        } else {
                            results[i] = Some(Err(e.error_code()));
                        }
                    }
                }
            }
        }
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or(Err(ErrorCode::LeaderNotAvailable.as_i16())))
        .collect()
}

async fn write_without_acks(
    ctx: &SessionContext,
    request: &ProduceRequest,
    writes: &[PhysicalWrite],
) {
    let indices: Vec<usize> = (0..writes.len()).collect();
    let mut failed = Vec::new();
    let groups = group_by_leader(ctx, writes, &indices, &mut failed).await;

    for (i, code) in failed {
        debug!(
            topic = %writes[i].key.topic,
            partition = writes[i].key.partition,
            code,
            "Dropping acks=0 write"
        );
    }

    for (addr, indices) in groups {
        let batch: Vec<&PhysicalWrite> = indices.iter().map(|&i| &writes[i]).collect();
        let physical = physical_request(request, &batch);
        match ctx.backend.send_oneway_to(&addr, &physical).await {
            Ok(()) => {
                RECORDS_PRODUCED_TOTAL.inc_by(batch.iter().map(|w| w.tags.len() as u64).sum())
            }
            Err(e) => debug!(broker = %addr, error = %e, "acks=0 write failed"),
        }
    }
}

/// Virtual base offset for every slot of an acknowledged write. Slots whose
/// offset cannot be derived get -1.
async fn translate_acks(
    ctx: &SessionContext,
    write: &PhysicalWrite,
    base_offset: i64,
) -> Vec<i64> {
    let unknown = vec![-1; write.slots.len()];
    if base_offset < 0 {
        return unknown;
    }

    let key = &write.key;
    if let Err(e) = ensure_index(ctx, key).await {
        debug!(
            topic = %key.topic,
            partition = key.partition,
            error = %e,
            "Cannot index partition"
        );
        return unknown;
    }

    match catch_up(ctx, key, base_offset).await {
        Ok(true) => {
            let own: Vec<ScannedRecord> = write
                .tags
                .iter()
                .enumerate()
                .map(|(i, &tag)| ScannedRecord {
                    offset: base_offset + i as i64,
                    virtual_partition: Some(tag),
                })
                .collect();
            let next = base_offset + own.len() as i64;
            record_advance(ctx, key, base_offset, &[own], next);
        }
        Ok(false) => {
            debug!(
                topic = %key.topic,
                partition = key.partition,
                base_offset,
                "Index did not reach the produced offset"
            );
        }
        Err(e) => {
            debug!(
                topic = %key.topic,
                partition = key.partition,
                error = %e,
                "Index catch-up failed"
            );
        }
    }

    slot_offsets(write, |i| {
        ctx.state.index.virtual_offset_at(key, base_offset + i)
    })
}

/// Virtual base offset of every slot, counted from the exact anchor of the
/// first record each virtual partition has in the write. Slots repeating a
/// virtual partition continue that partition's count.
fn slot_offsets(
    write: &PhysicalWrite,
    anchor_at: impl Fn(i64) -> Option<(i32, i64)>,
) -> Vec<i64> {
    let mut next: HashMap<i32, Option<i64>> = HashMap::new();
    let mut offsets = Vec::with_capacity(write.slots.len());
    let mut slots = write.slots.iter().peekable();

    for (i, &tag) in write.tags.iter().enumerate() {
        let counter = next.entry(tag).or_insert_with(|| match anchor_at(i as i64) {
            Some((anchored, offset)) if anchored == tag => Some(offset),
            _ => None,
        });
        while let Some(slot) = slots.next_if(|slot| slot.start == i) {
            offsets.push(match *counter {
                Some(offset) if slot.virtual_partition == tag => offset,
                _ => -1,
            });
        }
        if let Some(offset) = counter.as_mut() {
            *offset += 1;
        }
    }

    offsets.resize(write.slots.len(), -1);
    offsets
}
