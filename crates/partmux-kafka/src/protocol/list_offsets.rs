//! ListOffsets (API key 2), versions 1-6

use bytes::{BufMut, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_str, encode_tags, parse_array, parse_str, parse_tags, read_i16, read_i32,
    read_i64, read_i8,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsPartition {
    pub partition_index: i32,
    /// v4+
    pub current_leader_epoch: i32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    /// v2+
    pub isolation_level: i8,
    pub topics: Vec<ListOffsetsTopic>,
}

impl ListOffsetsRequest {
    /// Single-partition lookup as sent to brokers
    pub fn single(topic: &str, partition: i32, timestamp: i64) -> Self {
        Self {
            replica_id: -1,
            isolation_level: 0,
            topics: vec![ListOffsetsTopic {
                name: topic.to_string(),
                partitions: vec![ListOffsetsPartition {
                    partition_index: partition,
                    current_leader_epoch: -1,
                    timestamp,
                }],
            }],
        }
    }
}

impl Message for ListOffsetsRequest {
    const API_KEY: ApiKey = ApiKey::ListOffsets;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let replica_id = read_i32(buf)?;
        let isolation_level = if version >= 2 { read_i8(buf)? } else { 0 };
        let topics = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition_index = read_i32(p)?;
                let current_leader_epoch = if version >= 4 { read_i32(p)? } else { -1 };
                let timestamp = read_i64(p)?;
                parse_tags(p, flexible)?;
                Ok(ListOffsetsPartition {
                    partition_index,
                    current_leader_epoch,
                    timestamp,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(ListOffsetsTopic { name, partitions })
        })?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            replica_id,
            isolation_level,
            topics,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        buf.put_i32(self.replica_id);
        if version >= 2 {
            buf.put_i8(self.isolation_level);
        }
        encode_array(buf, &self.topics, flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.partition_index);
                if version >= 4 {
                    p.put_i32(partition.current_leader_epoch);
                }
                p.put_i64(partition.timestamp);
                encode_tags(p, flexible);
            });
            encode_tags(b, flexible);
        });
        encode_tags(buf, flexible);
    }
}

impl Request for ListOffsetsRequest {
    type Response = ListOffsetsResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsPartitionResponse {
    pub partition_index: i32,
    pub error_code: i16,
    pub timestamp: i64,
    pub offset: i64,
    /// v4+
    pub leader_epoch: i32,
}

impl ListOffsetsPartitionResponse {
    pub fn error(partition_index: i32, error_code: i16) -> Self {
        Self {
            partition_index,
            error_code,
            timestamp: -1,
            offset: -1,
            leader_epoch: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOffsetsResponse {
    /// v2+
    pub throttle_time_ms: i32,
    pub topics: Vec<ListOffsetsTopicResponse>,
}

impl ListOffsetsResponse {
    /// First partition entry, as returned for a single-partition lookup
    pub fn first_partition(&self) -> Option<&ListOffsetsPartitionResponse> {
        self.topics.first().and_then(|t| t.partitions.first())
    }
}

impl Message for ListOffsetsResponse {
    const API_KEY: ApiKey = ApiKey::ListOffsets;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let throttle_time_ms = if version >= 2 { read_i32(buf)? } else { 0 };
        let topics = parse_array(buf, flexible, |b| {
            let name = parse_str(b, flexible)?;
            let partitions = parse_array(b, flexible, |p| {
                let partition_index = read_i32(p)?;
                let error_code = read_i16(p)?;
                let timestamp = read_i64(p)?;
                let offset = read_i64(p)?;
                let leader_epoch = if version >= 4 { read_i32(p)? } else { -1 };
                parse_tags(p, flexible)?;
                Ok(ListOffsetsPartitionResponse {
                    partition_index,
                    error_code,
                    timestamp,
                    offset,
                    leader_epoch,
                })
            })?;
            parse_tags(b, flexible)?;
            Ok(ListOffsetsTopicResponse { name, partitions })
        })?;
        parse_tags(buf, flexible)?;

        Ok(Self {
            throttle_time_ms,
            topics,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        if version >= 2 {
            buf.put_i32(self.throttle_time_ms);
        }
        encode_array(buf, &self.topics, flexible, |b, topic| {
            encode_str(b, &topic.name, flexible);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i32(partition.partition_index);
                p.put_i16(partition.error_code);
                p.put_i64(partition.timestamp);
                p.put_i64(partition.offset);
                if version >= 4 {
                    p.put_i32(partition.leader_epoch);
                }
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
        let mut request = ListOffsetsRequest::single("orders", 42, -2);
        request.isolation_level = 1;
        request.topics[0].partitions[0].current_leader_epoch = 5;
        assert_eq!(reencode(&request, 6), request);

        let v1 = reencode(&request, 1);
        assert_eq!(v1.isolation_level, 0);
        assert_eq!(v1.topics[0].partitions[0].timestamp, -2);
    }

    #[test]
    fn test_response_first_partition() {
        let response = ListOffsetsResponse {
            throttle_time_ms: 0,
            topics: vec![ListOffsetsTopicResponse {
                name: "orders".to_string(),
                partitions: vec![ListOffsetsPartitionResponse {
                    partition_index: 4,
                    error_code: 0,
                    timestamp: -1,
                    offset: 120,
                    leader_epoch: -1,
                }],
            }],
        };
        for version in [1, 4, 6] {
            let decoded = reencode(&response, version);
            assert_eq!(decoded, response);
            assert_eq!(decoded.first_partition().map(|p| p.offset), Some(120));
        }
    }
}
