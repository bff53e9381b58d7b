//! OffsetFetch (API key 9), versions 1-7

use bytes::{BufMut, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_nullable_array, encode_nullable_str, encode_str, encode_tags,
    parse_array, parse_nullable_array, parse_nullable_str, parse_str, parse_tags, read_bool,
    read_i16, read_i32, read_i64,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchTopic {
    pub name: String,
    pub partition_indexes: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    /// `None` (v2+) asks for every committed partition
    pub topics: Option<Vec<OffsetFetchTopic>>,
    /// v7+
    pub require_stable: bool,
}

impl OffsetFetchRequest {
    pub fn single(group_id: String, topic: &str, partition: i32) -> Self {
        Self {
            group_id,
            topics: Some(vec![OffsetFetchTopic {
                name: topic.to_string(),
                partition_indexes: vec![partition],
            }]),
            require_stable: false,
        }
    }
}

impl Message for OffsetFetchRequest {
    const API_KEY: ApiKey = ApiKey::OffsetFetch;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let group_id = parse_str(buf, flexible)?;
        let topics = parse_nullable_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partition_indexes = parse_array(b, flexible, read_i32)?;
            parse_tags(b, flexible)?;
            Ok(OffsetFetchTopic {
                name,
                partition_indexes,
            })
        })?;
        let require_stable = if version >= 7 { read_bool(buf)? } else { false };
        parse_tags(buf, flexible)?;

        Ok(Self {
            group_id,
            topics,
            require_stable,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        encode_str(buf, &self.group_id, flexible);
        encode_nullable_array(buf, self.topics.as_deref(), flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partition_indexes, flexible, |p, v| p.put_i32(*v));
            encode_tags(b, flexible);
        });
        if version >= 7 {
            buf.put_i8(self.require_stable as i8);
        }
        encode_tags(buf, flexible);
    }
}

impl Request for OffsetFetchRequest {
    type Response = OffsetFetchResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchPartitionResponse {
    pub partition_index: i32,
    pub committed_offset: i64,
    /// v5+
    pub committed_leader_epoch: i32,
    pub metadata: Option<String>,
    pub error_code: i16,
}

impl OffsetFetchPartitionResponse {
    pub fn error(partition_index: i32, error_code: i16) -> Self {
        Self {
            partition_index,
            committed_offset: -1,
            committed_leader_epoch: -1,
            metadata: None,
            error_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetFetchTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetFetchPartitionResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetFetchResponse {
    /// v3+
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetFetchTopicResponse>,
    /// v2+
    pub error_code: i16,
}

impl OffsetFetchResponse {
    pub fn first_partition(&self) -> Option<&OffsetFetchPartitionResponse> {
        self.topics.first().and_then(|t| t.partitions.first())
    }
}

impl Message for OffsetFetchResponse {
    const API_KEY: ApiKey = ApiKey::OffsetFetch;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let throttle_time_ms = if version >= 3 { read_i32(buf)? } else { 0 };
        let topics = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition_index = read_i32(p)?;
                let committed_offset = read_i64(p)?;
                let committed_leader_epoch = if version >= 5 { read_i32(p)? } else { -1 };
                let metadata = parse_nullable_str(p, flexible)?;
                let error_code = read_i16(p)?;
                parse_tags(p, flexible)?;
                Ok(OffsetFetchPartitionResponse {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch,
                    metadata,
                    error_code,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(OffsetFetchTopicResponse { name, partitions })
        })?;
        let error_code = if version >= 2 { read_i16(buf)? } else { 0 };
        parse_tags(buf, flexible)?;

        Ok(Self {
            throttle_time_ms,
            topics,
            error_code,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        if version >= 3 {
            buf.put_i32(self.throttle_time_ms);
        }
        encode_array(buf, &self.topics, flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.partition_index);
                p.put_i64(partition.committed_offset);
                if version >= 5 {
                    p.put_i32(partition.committed_leader_epoch);
                }
                encode_nullable_str(p, partition.metadata.as_deref(), flexible);
                p.put_i16(partition.error_code);
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });
        if version >= 2 {
            buf.put_i16(self.error_code);
        }
        encode_tags(buf, flexible);
    }
}
