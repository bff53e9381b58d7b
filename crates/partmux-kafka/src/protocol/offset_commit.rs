//! OffsetCommit (API key 8), versions 2-8

use bytes::{BufMut, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_nullable_str, encode_str, encode_tags, parse_array, parse_nullable_str,
    parse_str, parse_tags, read_i16, read_i32, read_i64,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitPartition {
    pub partition_index: i32,
    pub committed_offset: i64,
    /// v6+
    pub committed_leader_epoch: i32,
    pub committed_metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    /// v7+
    pub group_instance_id: Option<String>,
    /// v2-4
    pub retention_time_ms: i64,
    pub topics: Vec<OffsetCommitTopic>,
}

impl OffsetCommitRequest {
    /// A commit outside any group generation
    pub fn simple(group_id: String, topics: Vec<OffsetCommitTopic>) -> Self {
        Self {
            group_id,
            generation_id: -1,
            member_id: String::new(),
            group_instance_id: None,
            retention_time_ms: -1,
            topics,
        }
    }
}

impl Message for OffsetCommitRequest {
    const API_KEY: ApiKey = ApiKey::OffsetCommit;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let group_id = parse_str(buf, flexible)?;
        let generation_id = read_i32(buf)?;
        let member_id = parse_str(buf, flexible)?;
        let group_instance_id = if version >= 7 {
            parse_nullable_str(buf, flexible)?
        } else {
            None
        };
        let retention_time_ms = if (2..=4).contains(&version) {
            read_i64(buf)?
        } else {
            -1
        };
        let topics = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition_index = read_i32(p)?;
                let committed_offset = read_i64(p)?;
                let committed_leader_epoch = if version >= 6 { read_i32(p)? } else { -1 };
                let committed_metadata = parse_nullable_str(p, flexible)?;
                parse_tags(p, flexible)?;
                Ok(OffsetCommitPartition {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch,
                    committed_metadata,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(OffsetCommitTopic { name, partitions })
        })?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            group_id,
            generation_id,
            member_id,
            group_instance_id,
            retention_time_ms,
            topics,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        encode_str(buf, &self.group_id, flexible);
        buf.put_i32(self.generation_id);
        encode_str(buf, &self.member_id, flexible);
        if version >= 7 {
            encode_nullable_str(buf, self.group_instance_id.as_deref(), flexible);
        }
        if (2..=4).contains(&version) {
            buf.put_i64(self.retention_time_ms);
        }
        encode_array(buf, &self.topics, flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.partition_index);
                p.put_i64(partition.committed_offset);
                if version >= 6 {
                    p.put_i32(partition.committed_leader_epoch);
                }
                encode_nullable_str(p, partition.committed_metadata.as_deref(), flexible);
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });
        encode_tags(buf, flexible);
    }
}

impl Request for OffsetCommitRequest {
    type Response = OffsetCommitResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitPartitionResponse {
    pub partition_index: i32,
    pub error_code: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetCommitTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartitionResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetCommitResponse {
    /// v3+
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetCommitTopicResponse>,
}

impl OffsetCommitResponse {
    /// Error code of the single partition of a single-partition commit
    pub fn first_error(&self) -> Option<i16> {
        self.topics
            .first()
            .and_then(|t| t.partitions.first())
            .map(|p| p.error_code)
    }
}

impl Message for OffsetCommitResponse {
    const API_KEY: ApiKey = ApiKey::OffsetCommit;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let throttle_time_ms = if version >= 3 { read_i32(buf)? } else { 0 };
        let topics = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition = OffsetCommitPartitionResponse {
                    partition_index: read_i32(p)?,
                    error_code: read_i16(p)?,
                };
                parse_tags(p, flexible)?;
                Ok(partition)
            })?;
            parse_tags(b, flexible)?;
            Ok(OffsetCommitTopicResponse { name, partitions })
        })?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            throttle_time_ms,
            topics,
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
                p.put_i16(partition.error_code);
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

    fn sample_request() -> OffsetCommitRequest {
        OffsetCommitRequest {
            group_id: "billing".to_string(),
            generation_id: 4,
            member_id: "member-1".to_string(),
            group_instance_id: None,
            retention_time_ms: -1,
            topics: vec![OffsetCommitTopic {
                name: "orders".to_string(),
                partitions: vec![OffsetCommitPartition {
                    partition_index: 42,
                    committed_offset: 3,
                    committed_leader_epoch: -1,
                    committed_metadata: Some(String::new()),
                }],
            }],
        }
    }

    #[test]
    fn test_request_versions() {
        let request = sample_request();
        for version in 2..=8 {
            assert_eq!(reencode(&request, version), request, "v{}", version);
        }
    }

    #[test]
    fn test_simple_commit_fields() {
        let request = OffsetCommitRequest::simple("billing.vp42".to_string(), vec![]);
        assert_eq!(request.generation_id, -1);
        assert_eq!(request.member_id, "");
        assert_eq!(reencode(&request, 2), request);
    }
}
