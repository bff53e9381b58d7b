//! ApiVersions (API key 18), versions 0-3

use bytes::{BufMut, BytesMut};

use super::{Message, Request};
use crate::codec::{
    encode_array, encode_str, encode_tags, parse_array, parse_str, parse_tags, read_i16, read_i32,
};
use crate::error::ProxyResult;
use crate::types::{ApiKey, ApiVersionRange};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiVersionsRequest {
    /// v3+
    pub client_software_name: String,
    /// v3+
    pub client_software_version: String,
}

impl Message for ApiVersionsRequest {
    const API_KEY: ApiKey = ApiKey::ApiVersions;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let mut request = Self::default();
        if version >= 3 {
            request.client_software_name = parse_str(buf, true)?;
            request.client_software_version = parse_str(buf, true)?;
            parse_tags(buf, true)?;
        }
        Ok(request)
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        if version >= 3 {
            encode_str(buf, &self.client_software_name, true);
            encode_str(buf, &self.client_software_version, true);
            encode_tags(buf, true);
        }
    }
}

impl Request for ApiVersionsRequest {
    type Response = ApiVersionsResponse;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiVersionsResponse {
    pub error_code: i16,
    pub api_keys: Vec<ApiVersionRange>,
    /// v1+
    pub throttle_time_ms: i32,
}

impl ApiVersionsResponse {
    /// Response to a request newer than any supported version.
    ///
    /// Always written in the v0 layout so the client can read it and retry
    /// with a version from `api_keys`.
    pub fn unsupported(api_keys: Vec<ApiVersionRange>) -> Self {
        Self {
            error_code: crate::error::ErrorCode::UnsupportedVersion.as_i16(),
            api_keys,
            throttle_time_ms: 0,
        }
    }
}

impl Message for ApiVersionsResponse {
    const API_KEY: ApiKey = ApiKey::ApiVersions;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self> {
        let flexible = Self::flexible(version);
        let error_code = read_i16(buf)?;
        let api_keys = parse_array(buf, flexible, |b| {
            let range = ApiVersionRange {
                api_key: read_i16(b)?,
                min_version: read_i16(b)?,
                max_version: read_i16(b)?,
            };
            parse_tags(b, flexible)?;
            Ok(range)
        })?;
        let throttle_time_ms = if version >= 1 { read_i32(buf)? } else { 0 };
        parse_tags(buf, flexible)?;

        Ok(Self {
            error_code,
            api_keys,
            throttle_time_ms,
        })
    }

    fn write(&self, buf: &mut BytesMut, version: i16) {
        let flexible = Self::flexible(version);
        buf.put_i16(self.error_code);
        encode_array(buf, &self.api_keys, flexible, |b, range| {
            b.put_i16(range.api_key);
            b.put_i16(range.min_version);
            b.put_i16(range.max_version);
            encode_tags(b, flexible);
        });
        if version >= 1 {
            buf.put_i32(self.throttle_time_ms);
        }
        encode_tags(buf, flexible);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::reencode;
    use crate::types::supported_api_versions;

    #[test]
    fn test_response_all_versions() {
        let response = ApiVersionsResponse {
            error_code: 0,
            api_keys: supported_api_versions(),
            throttle_time_ms: 0,
        };
        for version in 0..=3 {
            assert_eq!(reencode(&response, version), response);
        }
    }

    #[test]
    fn test_v0_layout() {
        let response = ApiVersionsResponse::unsupported(vec![ApiVersionRange {
            api_key: 18,
            min_version: 0,
            max_version: 3,
        }]);
        let mut buf = BytesMut::new();
        response.write(&mut buf, 0);

        // error_code(2) + count(4) + one entry(6), no throttle time
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[..2], &35i16.to_be_bytes());
    }

    #[test]
    fn test_request_v3_carries_client_software() {
        let request = ApiVersionsRequest {
            client_software_name: "librdkafka".to_string(),
            client_software_version: "2.3.0".to_string(),
        };
        assert_eq!(reencode(&request, 3), request);
        assert_eq!(reencode(&request, 2), ApiVersionsRequest::default());
    }
}
