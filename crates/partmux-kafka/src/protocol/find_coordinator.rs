//! FindCoordinator (API key 10), versions 0-4
//!
//! v4 batches several keys per request; earlier versions carry one key and
//! a flat response. Both shapes decode into the batched form.

use bytes::{BufMut, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_nullable_str, encode_str, encode_tags, parse_array, parse_nullable_str,
    parse_str, parse_tags, read_i16, read_i32, read_i8,
};
use crate::error::ProxyResult;
use crate::types::ApiKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCoordinatorRequest {
    /// One key before v4
    pub keys: Vec<String>,
    /// v1+
    pub key_type: i8,
}

impl FindCoordinatorRequest {
    pub fn new(key: impl Into<String>, key_type: i8) -> Self {
        Self {
            keys: vec![key.into()],
            key_type,
        }
    }
}

impl Message for FindCoordinatorRequest {
    const API_KEY: ApiKey = ApiKey::FindCoordinator;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let (keys, key_type) = if version >= 4 {
            let key_type = read_i8(buf)?;
            (parse_array(buf, flexible, |b| parse_str(b, flexible))?, key_type)
        } else {
            let key = parse_str(buf, flexible)?;
            let key_type = if version >= 1 { read_i8(buf)? } else { 0 };
            (vec![key], key_type)
        };
        parse_tags(buf, flexible)?;
        Ok(Self { keys, key_type })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        if version >= 4 {
            buf.put_i8(self.key_type);
            encode_array(buf, &self.keys, flexible, |b, key| encode_str(b, key, flexible));
        } else {
            encode_str(buf, self.keys.first().map(String::as_str).unwrap_or_default(), flexible);
            if version >= 1 {
                buf.put_i8(self.key_type);
            }
        }
        encode_tags(buf, flexible);
    }
}

impl Request for FindCoordinatorRequest {
    type Response = FindCoordinatorResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coordinator {
    pub key: String,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub error_code: i16,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindCoordinatorResponse {
    /// v1+
    pub throttle_time_ms: i32,
    /// Exactly one entry before v4
    pub coordinators: Vec<Coordinator>,
}

impl Message for FindCoordinatorResponse {
    const API_KEY: ApiKey = ApiKey::FindCoordinator;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let throttle_time_ms = if version >= 1 { read_i32(buf)? } else { 0 };

        let coordinators = if version >= 4 {
            parse_array(buf, flexible, |b| {
                let coordinator = Coordinator {
                    key: parse_str(b, flexible)?,
                    node_id: read_i32(b)?,
                    host: parse_str(b, flexible)?,
                    port: read_i32(b)?,
                    error_code: read_i16(b)?,
                    error_message: parse_nullable_str(b, flexible)?,
                };
                parse_tags(b, flexible)?;
                Ok(coordinator)
            })?
        } else {
            let error_code = read_i16(buf)?;
            let error_message = if version >= 1 {
                parse_nullable_str(buf, flexible)?
            } else {
                None
            };
            vec![Coordinator {
                key: String::new(),
                node_id: read_i32(buf)?,
                host: parse_str(buf, flexible)?,
                port: read_i32(buf)?,
                error_code,
                error_message,
            }]
        };
        parse_tags(buf, flexible)?;

        Ok(Self {
            throttle_time_ms,
            coordinators,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }

        if version >= 4 {
            encode_array(buf, &self.coordinators, flexible, |b, c| {
                encode_str(b, &c.key, flexible);
                b.put_i32(c.node_id);
                encode_str(b, &c.host, flexible);
                b.put_i32(c.port);
                b.put_i16(c.error_code);
                encode_nullable_str(b, c.error_message.as_deref(), flexible);
                encode_tags(b, flexible);
            });
        } else {
            let first = self.coordinators.first();
            buf.put_i16(first.map(|c| c.error_code).unwrap_or_default());
            if version >= 1 {
                encode_nullable_str(buf, first.and_then(|c| c.error_message.as_deref()), flexible);
            }
            buf.put_i32(first.map(|c| c.node_id).unwrap_or(-1));
            encode_str(buf, first.map(|c| c.host.as_str()).unwrap_or_default(), flexible);
            buf.put_i32(first.map(|c| c.port).unwrap_or(-1));
        }
        encode_tags(buf, flexible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::reencode;

    #[test]
    fn test_request_single_and_batched() {
        let request = FindCoordinatorRequest::new("group-a", 0);
        for version in 0..=4 {
            assert_eq!(reencode(&request, version), request);
        }

        let batched = FindCoordinatorRequest {
            keys: vec!["a".to_string(), "b".to_string()],
            key_type: 0,
        };
        assert_eq!(reencode(&batched, 4), batched);
    }

    #[test]
    fn test_response_flat_layout() {
        let response = FindCoordinatorResponse {
            throttle_time_ms: 0,
            coordinators: vec![Coordinator {
                key: String::new(),
                node_id: 1,
                host: "proxy.local".to_string(),
                port: 9092,
                error_code: 0,
                error_message: None,
            }],
        };
        for version in 0..=3 {
            assert_eq!(reencode(&response, version), response);
        }
    }
}
