//! Fetch (API key 1), versions 4-12

use bytes::{BufMut, Bytes, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_nullable_array, encode_nullable_bytes, encode_str, encode_tags,
    parse_array, parse_nullable_array, parse_nullable_bytes, parse_str, parse_tags, read_i16,
    read_i32, read_i64, read_i8,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartition {
    pub partition: i32,
    /// v9+
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    /// v12+
    pub last_fetched_epoch: i32,
    /// v5+
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

impl FetchPartition {
    pub fn new(partition: i32, fetch_offset: i64, partition_max_bytes: i32) -> Self {
        Self {
            partition,
            current_leader_epoch: -1,
            fetch_offset,
            last_fetched_epoch: -1,
            log_start_offset: -1,
            partition_max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopic {
    pub topic: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgottenTopic {
    pub topic: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
    /// v7+
    pub session_id: i32,
    /// v7+
    pub session_epoch: i32,
    pub topics: Vec<FetchTopic>,
    /// v7+
    pub forgotten_topics: Vec<ForgottenTopic>,
    /// v11+
    pub rack_id: String,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            replica_id: -1,
            max_wait_ms: 500,
            min_bytes: 1,
            max_bytes: 50 * 1024 * 1024,
            isolation_level: 0,
            session_id: 0,
            session_epoch: -1,
            topics: Vec::new(),
            forgotten_topics: Vec::new(),
            rack_id: String::new(),
        }
    }
}

impl Message for FetchRequest {
    const API_KEY: ApiKey = ApiKey::Fetch;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let mut request = Self {
            replica_id: read_i32(buf)?,
            max_wait_ms: read_i32(buf)?,
            min_bytes: read_i32(buf)?,
            max_bytes: read_i32(buf)?,
            isolation_level: read_i8(buf)?,
            ..Self::default()
        };
        if version >= 7 {
            request.session_id = read_i32(buf)?;
            request.session_epoch = read_i32(buf)?;
        }

        request.topics = parse_array(buf, flexible, |b| {
            let topic = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition = read_i32(p)?;
                let current_leader_epoch = if version >= 9 { read_i32(p)? } else { -1 };
                let fetch_offset = read_i64(p)?;
                let last_fetched_epoch = if version >= 12 { read_i32(p)? } else { -1 };
                let log_start_offset = if version >= 5 { read_i64(p)? } else { -1 };
                let partition_max_bytes = read_i32(p)?;
                parse_tags(p, flexible)?;
                Ok(FetchPartition {
                    partition,
                    current_leader_epoch,
                    fetch_offset,
                    last_fetched_epoch,
                    log_start_offset,
                    partition_max_bytes,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(FetchTopic { topic, partitions })
        })?;

        if version >= 7 {
            request.forgotten_topics = parse_array(buf, flexible, |b| {
                let topic = parse_str(b, flexible)?;
                let partitions = parse_array(b, flexible, read_i32)?;
                parse_tags(b, flexible)?;
                Ok(ForgottenTopic { topic, partitions })
            })?;
        }
        if version >= 11 {
            request.rack_id = parse_str(buf, flexible)?;
        }
        parse_tags(buf, flexible)?;

        Ok(request)
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        buf.put_i32(self.replica_id);
        buf.put_i32(self.max_wait_ms);
        buf.put_i32(self.min_bytes);
        buf.put_i32(self.max_bytes);
        buf.put_i8(self.isolation_level);
        if version >= 7 {
            buf.put_i32(self.session_id);
            buf.put_i32(self.session_epoch);
        }

        encode_array(buf, &self.topics, flexible, |b, topic| {
            encode_str(b, &topic.topic, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.partition);
                if version >= 9 {
                    p.put_i32(partition.current_leader_epoch);
                }
                p.put_i64(partition.fetch_offset);
                if version >= 12 {
                    p.put_i32(partition.last_fetched_epoch);
                }
                if version >= 5 {
                    p.put_i64(partition.log_start_offset);
                }
                p.put_i32(partition.partition_max_bytes);
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });

        if version >= 7 {
            encode_array(buf, &self.forgotten_topics, flexible, |b, topic| {
                encode_str(b, &topic.topic, flexible);
                encode_array(b, &topic.partitions, flexible, |p, v| p.put_i32(*v));
                encode_tags(b, flexible);
            });
        }
        if version >= 11 {
            encode_str(buf, &self.rack_id, flexible);
        }
        encode_tags(buf, flexible);
    }
}

impl Request for FetchRequest {
    type Response = FetchResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartitionResponse {
    pub partition_index: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    /// v5+
    pub log_start_offset: i64,
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,
    /// v11+
    pub preferred_read_replica: i32,
    pub records: Option<Bytes>,
}

impl FetchPartitionResponse {
    pub fn error(partition_index: i32, error_code: i16) -> Self {
        Self {
            partition_index,
            error_code,
            high_watermark: -1,
            last_stable_offset: -1,
            log_start_offset: -1,
            aborted_transactions: None,
            preferred_read_replica: -1,
            records: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    /// v7+
    pub error_code: i16,
    /// v7+
    pub session_id: i32,
    pub responses: Vec<FetchTopicResponse>,
}

impl Message for FetchResponse {
    const API_KEY: ApiKey = ApiKey::Fetch;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let throttle_time_ms = read_i32(buf)?;
        let (error_code, session_id) = if version >= 7 {
            (read_i16(buf)?, read_i32(buf)?)
        } else {
            (0, 0)
        };

        let responses = parse_array(buf, flexible, |b| {
            let topic = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition_index = read_i32(p)?;
                let error_code = read_i16(p)?;
                let high_watermark = read_i64(p)?;
                let last_stable_offset = read_i64(p)?;
                let log_start_offset = if version >= 5 { read_i64(p)? } else { -1 };
                let aborted_transactions = parse_nullable_array(p, flexible, |a| {
                    let aborted = AbortedTransaction {
                        producer_id: read_i64(a)?,
                        first_offset: read_i64(a)?,
                    };
                    parse_tags(a, flexible)?;
                    Ok(aborted)
                })?;
                let preferred_read_replica = if version >= 11 { read_i32(p)? } else { -1 };
                let records = parse_nullable_bytes(p, flexible)?;
                parse_tags(p, flexible)?;
                Ok(FetchPartitionResponse {
                    partition_index,
                    error_code,
                    high_watermark,
                    last_stable_offset,
                    log_start_offset,
                    aborted_transactions,
                    preferred_read_replica,
                    records,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(FetchTopicResponse { topic, partitions })
        })?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            throttle_time_ms,
            error_code,
            session_id,
            responses,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        buf.put_i32(self.throttle_time_ms);
        if version >= 7 {
            buf.put_i16(self.error_code);
            buf.put_i32(self.session_id);
        }

        encode_array(buf, &self.responses, flexible, |b, topic| {
            encode_str(b, &topic.topic, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.partition_index);
                p.put_i16(partition.error_code);
                p.put_i64(partition.high_watermark);
                p.put_i64(partition.last_stable_offset);
                if version >= 5 {
                    p.put_i64(partition.log_start_offset);
                }
                encode_nullable_array(
                    p,
                    partition.aborted_transactions.as_deref(),
                    flexible,
                    |a, aborted| {
                        a.put_i64(aborted.producer_id);
                        a.put_i64(aborted.first_offset);
                        encode_tags(a, flexible);
                    },
                );
                if version >= 11 {
                    p.put_i32(partition.preferred_read_replica);
                }
                encode_nullable_bytes(p, partition.records.as_deref(), flexible);
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });
        encode_tags(buf, flexible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::reencode;

    #[test]
    fn test_request_versions() {
        let mut partition = FetchPartition::new(42, 7, 1024 * 1024);
        partition.current_leader_epoch = 3;
        partition.last_fetched_epoch = 2;
        partition.log_start_offset = 0;
        let request = FetchRequest {
            session_id: 0,
            session_epoch: -1,
            topics: vec![FetchTopic {
                topic: "orders".to_string(),
                partitions: vec![partition],
            }],
            rack_id: "rack-a".to_string(),
            ..FetchRequest::default()
        };

        assert_eq!(reencode(&request, 12), request);

        let v4 = reencode(&request, 4);
        assert_eq!(v4.topics[0].partitions[0].fetch_offset, 7);
        assert_eq!(v4.topics[0].partitions[0].current_leader_epoch, -1);
        assert_eq!(v4.rack_id, "");
    }

    #[test]
    fn test_response_versions() {
        let mut partition = FetchPartitionResponse::error(42, 0);
        partition.high_watermark = 3;
        partition.last_stable_offset = 3;
        partition.log_start_offset = 0;
        partition.records = Some(Bytes::from_static(b"batch"));
        let response = FetchResponse {
            throttle_time_ms: 0,
            error_code: 0,
            session_id: 0,
            responses: vec![FetchTopicResponse {
                topic: "orders".to_string(),
                partitions: vec![partition],
            }],
        };
        for version in [5, 7, 11, 12] {
            assert_eq!(reencode(&response, version), response);
        }
    }
}
