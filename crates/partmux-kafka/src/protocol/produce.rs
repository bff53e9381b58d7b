//! Produce (API key 0), versions 3-9

use bytes::{BufMut, Bytes, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_nullable_bytes, encode_nullable_str, encode_str, encode_tags,
    parse_array, parse_nullable_bytes, parse_nullable_str, parse_str, parse_tags, read_i16,
    read_i32, read_i64,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartitionData {
    pub index: i32,
    /// Raw record batches
    pub records: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopicData {
    pub name: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

impl Message for ProduceRequest {
    const API_KEY: ApiKey = ApiKey::Produce;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let transactional_id = parse_nullable_str(buf, flexible)?;
        let acks = read_i16(buf)?;
        let timeout_ms = read_i32(buf)?;
        let topics = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let index = read_i32(p)?;
                let records = parse_nullable_bytes(p, flexible)?;
                parse_tags(p, flexible)?;
                Ok(ProducePartitionData { index, records })
            })?;
            parse_tags(b, flexible)?;
            Ok(ProduceTopicData { name, partitions })
        })?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            transactional_id,
            acks,
            timeout_ms,
            topics,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        encode_nullable_str(buf, self.transactional_id.as_deref(), flexible);
        buf.put_i16(self.acks);
        buf.put_i32(self.timeout_ms);
        encode_array(buf, &self.topics, flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.index);
                encode_nullable_bytes(p, partition.records.as_deref(), flexible);
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });
        encode_tags(buf, flexible);
    }
}

impl Request for ProduceRequest {
    type Response = ProduceResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub batch_index: i32,
    pub batch_index_error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartitionResponse {
    pub index: i32,
    pub error_code: i16,
    pub base_offset: i64,
    /// v2+
    pub log_append_time_ms: i64,
    /// v5+
    pub log_start_offset: i64,
    /// v8+
    pub record_errors: Vec<RecordError>,
    /// v8+
    pub error_message: Option<String>,
}

impl ProducePartitionResponse {
    pub fn error(index: i32, error_code: i16) -> Self {
        Self {
            index,
            error_code,
            base_offset: -1,
            log_append_time_ms: -1,
            log_start_offset: -1,
            record_errors: Vec::new(),
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceResponse {
    pub responses: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

impl Message for ProduceResponse {
    const API_KEY: ApiKey = ApiKey::Produce;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let responses = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let index = read_i32(p)?;
                let error_code = read_i16(p)?;
                let base_offset = read_i64(p)?;
                let log_append_time_ms = if version >= 2 { read_i64(p)? } else { -1 };
                let log_start_offset = if version >= 5 { read_i64(p)? } else { -1 };
                let (record_errors, error_message) = if version >= 8 {
                    let errors = parse_array(p, flexible, |e| {
                        let error = RecordError {
                            batch_index: read_i32(e)?,
                            batch_index_error_message: parse_nullable_str(e, flexible)?,
                        };
                        parse_tags(e, flexible)?;
                        Ok(error)
                    })?;
                    (errors, parse_nullable_str(p, flexible)?)
                } else {
                    (Vec::new(), None)
                };
                parse_tags(p, flexible)?;
                Ok(ProducePartitionResponse {
                    index,
                    error_code,
                    base_offset,
                    log_append_time_ms,
                    log_start_offset,
                    record_errors,
                    error_message,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(ProduceTopicResponse { name, partitions })
        })?;
        let throttle_time_ms = read_i32(buf)?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            responses,
            throttle_time_ms,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        encode_array(buf, &self.responses, flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.index);
                p.put_i16(partition.error_code);
                p.put_i64(partition.base_offset);
                if version >= 2 {
                    p.put_i64(partition.log_append_time_ms);
                }
                if version >= 5 {
                    p.put_i64(partition.log_start_offset);
                }
                if version >= 8 {
                    encode_array(p, &partition.record_errors, flexible, |e, error| {
                        e.put_i32(error.batch_index);
                        encode_nullable_str(e, error.batch_index_error_message.as_deref(), flexible);
                        encode_tags(e, flexible);
                    });
                    encode_nullable_str(p, partition.error_message.as_deref(), flexible);
                }
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });
        buf.put_i32(self.throttle_time_ms);
        encode_tags(buf, flexible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::reencode;

    #[test]
    fn test_request_keeps_records_intact() {
        let request = ProduceRequest {
            transactional_id: None,
            acks: -1,
            timeout_ms: 30_000,
            topics: vec![ProduceTopicData {
                name: "orders".to_string(),
                partitions: vec![
                    ProducePartitionData {
                        index: 42,
                        records: Some(Bytes::from_static(b"opaque batch bytes")),
                    },
                    ProducePartitionData {
                        index: 43,
                        records: None,
                    },
                ],
            }],
        };
        for version in [3, 8, 9] {
            assert_eq!(reencode(&request, version), request);
        }
    }

    #[test]
    fn test_response_versions() {
        let mut partition = ProducePartitionResponse::error(42, 0);
        partition.base_offset = 7;
        partition.log_append_time_ms = -1;
        partition.log_start_offset = -1;
        let response = ProduceResponse {
            responses: vec![ProduceTopicResponse {
                name: "orders".to_string(),
                partitions: vec![partition],
            }],
            throttle_time_ms: 0,
        };
        for version in [3, 5, 8, 9] {
            assert_eq!(reencode(&response, version), response);
        }
    }
}
