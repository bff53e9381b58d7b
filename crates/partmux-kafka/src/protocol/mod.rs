//! Structured Kafka messages
//!
//! Each message type decodes and encodes every version the proxy accepts
//! from clients. The same types are used on the backend side at the fixed
//! versions returned by [`ApiKey::backend_version`], so one schema
//! definition covers both directions.
//!
//! Fields that only exist in some versions are kept on the struct and
//! ignored when writing a version that lacks them.

use bytes::BytesMut;

use crate::codec::{RequestHeader, ResponseHeader};
use crate::error::ProxyResult;
use crate::types::{is_flexible_response, is_flexible_version, ApiKey};

pub mod api_versions;
pub mod fetch;
pub mod find_coordinator;
pub mod list_offsets;
pub mod metadata;
pub mod offset_commit;
pub mod offset_fetch;
pub mod produce;
pub mod relay;

pub use api_versions::{ApiVersionsRequest, ApiVersionsResponse};
pub use fetch::{FetchRequest, FetchResponse};
pub use find_coordinator::{FindCoordinatorRequest, FindCoordinatorResponse};
pub use list_offsets::{ListOffsetsRequest, ListOffsetsResponse};
pub use metadata::{MetadataRequest, MetadataResponse};
pub use offset_commit::{OffsetCommitRequest, OffsetCommitResponse};
pub use offset_fetch::{OffsetFetchRequest, OffsetFetchResponse};
pub use produce::{ProduceRequest, ProduceResponse};
pub use relay::RelayRequest;

/// A versioned request or response body
pub trait Message: Sized {
    const API_KEY: ApiKey;

    fn read(buf: &mut BytesMut, version: i16) -> ProxyResult<Self>;

    fn write(&self, buf: &mut BytesMut, version: i16);

    fn flexible(version: i16) -> bool {
        is_flexible_version(Self::API_KEY.as_i16(), version)
    }
}

/// A request body paired with its response type
pub trait Request: Message {
    type Response: Message;
}

/// Encode a full request frame payload (header + body)
pub fn encode_request<R: Request>(header: &RequestHeader, request: &R) -> BytesMut {
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    request.write(&mut buf, header.api_version);
    buf
}

/// Encode a full response frame payload (header + body)
pub fn encode_response<M: Message>(correlation_id: i32, version: i16, response: &M) -> BytesMut {
    let mut buf = BytesMut::new();
    ResponseHeader::new(correlation_id)
        .encode(&mut buf, is_flexible_response(M::API_KEY.as_i16(), version));
    response.write(&mut buf, version);
    buf
}

/// Decode a response frame payload, returning its correlation id and body
pub fn decode_response<M: Message>(buf: &mut BytesMut, version: i16) -> ProxyResult<(i32, M)> {
    let header = ResponseHeader::parse(buf, is_flexible_response(M::API_KEY.as_i16(), version))?;
    let body = M::read(buf, version)?;
    Ok((header.correlation_id, body))
}
