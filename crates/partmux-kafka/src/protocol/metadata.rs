//! Metadata (API key 3), versions 1-12

use bytes::{BufMut, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_nullable_array, encode_nullable_str, encode_str, encode_tags,
    parse_array, parse_nullable_array, parse_nullable_str, parse_str, parse_tags, read_bool,
    read_i16, read_i32, read_uuid,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequestTopic {
    /// v10+
    pub topic_id: [u8; 16],
    /// Nullable from v10 when looking up by id
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    /// `None` requests every topic
    pub topics: Option<Vec<MetadataRequestTopic>>,
    /// v4+
    pub allow_auto_topic_creation: bool,
    /// v8-10
    pub include_cluster_authorized_operations: bool,
    /// v8+
    pub include_topic_authorized_operations: bool,
}

impl Default for MetadataRequest {
    fn default() -> Self {
        Self {
            topics: None,
            allow_auto_topic_creation: true,
            include_cluster_authorized_operations: false,
            include_topic_authorized_operations: false,
        }
    }
}

impl MetadataRequest {
    pub fn for_topics<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: Some(
                names
                    .into_iter()
                    .map(|name| MetadataRequestTopic {
                        topic_id: [0; 16],
                        name: Some(name.into()),
                    })
                    .collect(),
            ),
            allow_auto_topic_creation: false,
            ..Self::default()
        }
    }

    /// Requested topic names; `None` means all topics
    pub fn topic_names(&self) -> Option<Vec<String>> {
        self.topics
            .as_ref()
            .map(|topics| topics.iter().filter_map(|t| t.name.clone()).collect())
    }
}

impl Message for MetadataRequest {
    const API_KEY: ApiKey = ApiKey::Metadata;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let topics = parse_nullable_array(buf, flexible, |b| {
            let topic_id = if version >= 10 { read_uuid(b)? } else { [0; 16] };
            let name = if version >= 10 {
                parse_nullable_str(b, flexible)?
            } else {
                Some(parse_str(b, flexible)?)
            };
            parse_tags(b, flexible)?;
            Ok(MetadataRequestTopic { topic_id, name })
        })?;

        let mut request = Self {
            topics,
            ..Self::default()
        };
        if version >= 4 {
            request.allow_auto_topic_creation = read_bool(buf)?;
        }
        if (8..=10).contains(&version) {
            request.include_cluster_authorized_operations = read_bool(buf)?;
        }
        if version >= 8 {
            request.include_topic_authorized_operations = read_bool(buf)?;
        }
        parse_tags(buf, flexible)?;
        Ok(request)
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        encode_nullable_array(buf, self.topics.as_deref(), flexible, |b, topic| {
            if version >= 10 {
                b.put_slice(&topic.topic_id);
                encode_nullable_str(b, topic.name.as_deref(), flexible);
            } else {
                encode_str(b, topic.name.as_deref().unwrap_or_default(), flexible);
            }
            encode_tags(b, flexible);
        });
        if version >= 4 {
            buf.put_i8(self.allow_auto_topic_creation as i8);
        }
        if (8..=10).contains(&version) {
            buf.put_i8(self.include_cluster_authorized_operations as i8);
        }
        if version >= 8 {
            buf.put_i8(self.include_topic_authorized_operations as i8);
        }
        encode_tags(buf, flexible);
    }
}

impl Request for MetadataRequest {
    type Response = MetadataResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPartition {
    pub error_code: i16,
    pub partition_index: i32,
    pub leader_id: i32,
    /// v7+
    pub leader_epoch: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    /// v5+
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataTopic {
    pub error_code: i16,
    pub name: Option<String>,
    /// v10+
    pub topic_id: [u8; 16],
    pub is_internal: bool,
    pub partitions: Vec<MetadataPartition>,
    /// v8+
    pub topic_authorized_operations: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    /// v3+
    pub throttle_time_ms: i32,
    pub brokers: Vec<MetadataBroker>,
    /// v2+
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub topics: Vec<MetadataTopic>,
    /// v8-10
    pub cluster_authorized_operations: i32,
}

impl Default for MetadataResponse {
    fn default() -> Self {
        Self {
            throttle_time_ms: 0,
            brokers: Vec::new(),
            cluster_id: None,
            controller_id: -1,
            topics: Vec::new(),
            cluster_authorized_operations: i32::MIN,
        }
    }
}

fn read_int_array(buf: &mut BytesMut, flexible: bool) -> ProxyResult<Vec<i32>> {
    parse_array(buf, flexible, read_i32)
}

fn write_int_array(buf: &mut BytesMut, values: &[i32], flexible: bool) {
    encode_array(buf, values, flexible, |b, v| b.put_i32(*v));
}

impl Message for MetadataResponse {
    const API_KEY: ApiKey = ApiKey::Metadata;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let throttle_time_ms = if version >= 3 { read_i32(buf)? } else { 0 };

        let brokers = parse_array(buf, flexible, |b| {
            let broker = MetadataBroker {
                node_id: read_i32(b)?,
                host: parse_str(b, flexible)?,
                port: read_i32(b)?,
                rack: parse_nullable_str(b, flexible)?,
            };
            parse_tags(b, flexible)?;
            Ok(broker)
        })?;

        let cluster_id = if version >= 2 {
            parse_nullable_str(buf, flexible)?
        } else {
            None
        };
        let controller_id = read_i32(buf)?;

        let topics = parse_array(buf, flexible, |b| {
            let error_code = read_i16(b)?;
            let name = if version >= 12 {
                parse_nullable_str(b, flexible)?
            } else {
                Some(parse_str(b, flexible)?)
            };
            let topic_id = if version >= 10 { read_uuid(b)? } else { [0; 16] };
            let is_internal = read_bool(b)?;
            let partitions = parse_array(b, flexible, |p| {
                let error_code = read_i16(p)?;
                let partition_index = read_i32(p)?;
                let leader_id = read_i32(p)?;
                let leader_epoch = if version >= 7 { read_i32(p)? } else { -1 };
                let replica_nodes = read_int_array(p, flexible)?;
                let isr_nodes = read_int_array(p, flexible)?;
                let offline_replicas = if version >= 5 {
                    read_int_array(p, flexible)?
                } else {
                    Vec::new()
                };
                parse_tags(p, flexible)?;
                Ok(MetadataPartition {
                    error_code,
                    partition_index,
                    leader_id,
                    leader_epoch,
                    replica_nodes,
                    isr_nodes,
                    offline_replicas,
                })
            })?;
            let topic_authorized_operations = if version >= 8 { read_i32(b)? } else { i32::MIN };
            parse_tags(b, flexible)?;
            Ok(MetadataTopic {
                error_code,
                name,
                topic_id,
                is_internal,
                partitions,
                topic_authorized_operations,
            })
        })?;

        let cluster_authorized_operations = if (8..=10).contains(&version) {
            read_i32(buf)?
        } else {
            i32::MIN
        };
        parse_tags(buf, flexible)?;

        Ok(Self {
            throttle_time_ms,
            brokers,
            cluster_id,
            controller_id,
            topics,
            cluster_authorized_operations,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        if version >= 3 {
            buf.put_i32(self.throttle_time_ms);
        }

        encode_array(buf, &self.brokers, flexible, |b, broker| {
            b.put_i32(broker.node_id);
            encode_str(b, &broker.host, flexible);
            b.put_i32(broker.port);
            encode_nullable_str(b, broker.rack.as_deref(), flexible);
            encode_tags(b, flexible);
        });

        if version >= 2 {
            encode_nullable_str(buf, self.cluster_id.as_deref(), flexible);
        }
        buf.put_i32(self.controller_id);

        encode_array(buf, &self.topics, flexible, |b, topic| {
            b.put_i16(topic.error_code);
            if version >= 12 {
                encode_nullable_str(b, topic.name.as_deref(), flexible);
            } else {
                encode_str(b, topic.name.as_deref().unwrap_or_default(), flexible);
            }
            if version >= 10 {
                b.put_slice(&topic.topic_id);
            }
            b.put_i8(topic.is_internal as i8);
            encode_array(b, &topic.partitions, flexible, |p, partition| {
                p.put_i16(partition.error_code);
                p.put_i32(partition.partition_index);
                p.put_i32(partition.leader_id);
                if version >= 7 {
                    p.put_i32(partition.leader_epoch);
                }
                write_int_array(p, &partition.replica_nodes, flexible);
                write_int_array(p, &partition.isr_nodes, flexible);
                if version >= 5 {
                    write_int_array(p, &partition.offline_replicas, flexible);
                }
                encode_tags(p, flexible);
            });
            if version >= 8 {
                b.put_i32(topic.topic_authorized_operations);
            }
            encode_tags(b, flexible);
        });

        if (8..=10).contains(&version) {
            buf.put_i32(self.cluster_authorized_operations);
        }
        encode_tags(buf, flexible);
    }
}
