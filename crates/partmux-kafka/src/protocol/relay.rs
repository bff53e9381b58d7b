//! Group coordination requests forwarded with their body intact
//!
//! JoinGroup, SyncGroup, Heartbeat, LeaveGroup, DescribeGroups, ListGroups and
//! InitProducerId carry no partition content, so only the routing key is
//! decoded. The body goes to the coordinator byte for byte.

use bytes::{Bytes, BytesMut};

use crate::codec::{parse_array, parse_nullable_str, parse_str, RequestHeader};
use crate::error::{ProxyError, ProxyResult};
use crate::types::{is_flexible_version, ApiKey, CoordinatorType};

/// Where a relayed request must go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTarget {
    Coordinator { key: String, key_type: CoordinatorType },
    AnyBroker,
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub api_key: ApiKey,
    pub header: RequestHeader,
    pub target: RelayTarget,
    pub body: Bytes,
}

impl RelayRequest {
    pub fn parse(api_key: ApiKey, header: RequestHeader, body: BytesMut) -> ProxyResult<Self> {
        let flexible = is_flexible_version(header.api_key, header.api_version);
        let mut peek = body.clone();

        let group = |key: String| RelayTarget::Coordinator {
            key,
            key_type: CoordinatorType::Group,
        };

        let target = match api_key {
            ApiKey::JoinGroup | ApiKey::SyncGroup | ApiKey::Heartbeat | ApiKey::LeaveGroup => {
                group(parse_str(&mut peek, flexible)?)
            }
            // Every listed group is assumed to share the first one's coordinator
            ApiKey::DescribeGroups => parse_array(&mut peek, flexible, |b| parse_str(b, flexible))?
                .into_iter()
                .next()
                .map(group)
                .unwrap_or(RelayTarget::AnyBroker),
            ApiKey::ListGroups => RelayTarget::AnyBroker,
            ApiKey::InitProducerId => match parse_nullable_str(&mut peek, flexible)? {
                Some(key) => RelayTarget::Coordinator {
                    key,
                    key_type: CoordinatorType::Transaction,
                },
                None => RelayTarget::AnyBroker,
            },
            _ => {
                return Err(ProxyError::UnsupportedProtocol {
                    api_key: header.api_key,
                    api_version: header.api_version,
                })
            }
        };

        Ok(Self {
            api_key,
            header,
            target,
            body: body.freeze(),
        })
    }
}
