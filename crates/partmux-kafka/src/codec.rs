//! Kafka protocol frame codec and primitive types
//!
//! Handles the length-prefixed framing of Kafka protocol messages.
//!
//! Frame format:
//! ```text
//! +------------------+------------------+
//! | Length (4 bytes) | Payload          |
//! +------------------+------------------+
//! ```
//!
//! Primitive readers are bounds-checked and return a protocol error on short
//! input. Most helpers take a `flexible` flag selecting between the legacy
//! encodings (int16/int32 lengths) and the compact encodings (unsigned varint
//! length + 1) used by flexible API versions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProxyError, ProxyResult};
use crate::types::is_flexible_version;

/// Maximum frame size (100MB)
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Kafka protocol frame codec
pub struct KafkaCodec {
    max_frame_size: usize,
}

impl Default for KafkaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for KafkaCodec {
    type Item = BytesMut;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> ProxyResult<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = (&src[..4]).get_i32();
        if length < 0 {
            return Err(ProxyError::Protocol(format!(
                "Negative frame size {}",
                length
            )));
        }
        let length = length as usize;

        if length > self.max_frame_size {
            return Err(ProxyError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        let total_length = 4 + length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<BytesMut> for KafkaCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: BytesMut, dst: &mut BytesMut) -> ProxyResult<()> {
        let length = item.len();

        if length > self.max_frame_size {
            return Err(ProxyError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        dst.reserve(4 + length);
        dst.put_i32(length as i32);
        dst.extend_from_slice(&item);

        Ok(())
    }
}

/// Request header (v1, or v2 for flexible versions)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    /// Parse a request header. Tagged fields are consumed when the api key and
    /// version use the flexible header.
    pub fn parse(buf: &mut BytesMut) -> ProxyResult<Self> {
        let api_key = read_i16(buf)?;
        let api_version = read_i16(buf)?;
        let correlation_id = read_i32(buf)?;
        // client_id stays a legacy nullable string even in header v2
        let client_id = parse_nullable_str(buf, false)?;

        if is_flexible_version(api_key, api_version) {
            skip_tagged_fields(buf)?;
        }

        Ok(RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.api_key);
        buf.put_i16(self.api_version);
        buf.put_i32(self.correlation_id);
        encode_nullable_str(buf, self.client_id.as_deref(), false);
        if is_flexible_version(self.api_key, self.api_version) {
            encode_empty_tagged_fields(buf);
        }
    }
}

/// Response header (v0, or v1 for flexible versions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub correlation_id: i32,
}

impl ResponseHeader {
    pub fn new(correlation_id: i32) -> Self {
        Self { correlation_id }
    }

    pub fn encode(&self, buf: &mut BytesMut, flexible: bool) {
        buf.put_i32(self.correlation_id);
        if flexible {
            encode_empty_tagged_fields(buf);
        }
    }

    pub fn parse(buf: &mut BytesMut, flexible: bool) -> ProxyResult<Self> {
        let correlation_id = read_i32(buf)?;
        if flexible {
            skip_tagged_fields(buf)?;
        }
        Ok(Self { correlation_id })
    }
}

fn short(what: &str, needed: usize, buf: &BytesMut) -> ProxyError {
    ProxyError::Protocol(format!(
        "Buffer too short for {}: need {} bytes, have {}",
        what,
        needed,
        buf.len()
    ))
}

pub fn read_i8(buf: &mut BytesMut) -> ProxyResult<i8> {
    if buf.is_empty() {
        return Err(short("int8", 1, buf));
    }
    Ok(buf.get_i8())
}

pub fn read_bool(buf: &mut BytesMut) -> ProxyResult<bool> {
    Ok(read_i8(buf)? != 0)
}

pub fn read_i16(buf: &mut BytesMut) -> ProxyResult<i16> {
    if buf.len() < 2 {
        return Err(short("int16", 2, buf));
    }
    Ok(buf.get_i16())
}

pub fn read_i32(buf: &mut BytesMut) -> ProxyResult<i32> {
    if buf.len() < 4 {
        return Err(short("int32", 4, buf));
    }
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut BytesMut) -> ProxyResult<i64> {
    if buf.len() < 8 {
        return Err(short("int64", 8, buf));
    }
    Ok(buf.get_i64())
}

pub fn read_uuid(buf: &mut BytesMut) -> ProxyResult<[u8; 16]> {
    if buf.len() < 16 {
        return Err(short("uuid", 16, buf));
    }
    let mut uuid = [0u8; 16];
    buf.copy_to_slice(&mut uuid);
    Ok(uuid)
}

/// Parse an unsigned varint
pub fn parse_unsigned_varint(buf: &mut BytesMut) -> ProxyResult<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;

    loop {
        if buf.is_empty() {
            return Err(ProxyError::Protocol(
                "Buffer too short for varint".to_string(),
            ));
        }

        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift >= 64 {
            return Err(ProxyError::Protocol("Varint too long".to_string()));
        }
    }

    Ok(result)
}

/// Encode an unsigned varint
pub fn encode_unsigned_varint(buf: &mut BytesMut, value: u64) {
    partmux_core::varint::encode_varint_u64(buf, value);
}

/// Length of a string/bytes field: `None` means null
fn parse_length(buf: &mut BytesMut, flexible: bool, wide: bool) -> ProxyResult<Option<usize>> {
    let length = if flexible {
        match parse_unsigned_varint(buf)? {
            0 => return Ok(None),
            n => (n - 1) as i64,
        }
    } else if wide {
        read_i32(buf)? as i64
    } else {
        read_i16(buf)? as i64
    };

    if length < 0 {
        return Ok(None);
    }

    let length = length as usize;
    if buf.len() < length {
        return Err(short("field", length, buf));
    }
    Ok(Some(length))
}

/// Parse a nullable string (int16 or compact length)
pub fn parse_nullable_str(buf: &mut BytesMut, flexible: bool) -> ProxyResult<Option<String>> {
    match parse_length(buf, flexible, false)? {
        None => Ok(None),
        Some(length) => {
            let bytes = buf.split_to(length);
            String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| ProxyError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
        }
    }
}

/// Parse a non-null string
pub fn parse_str(buf: &mut BytesMut, flexible: bool) -> ProxyResult<String> {
    parse_nullable_str(buf, flexible)?
        .ok_or_else(|| ProxyError::Protocol("Expected non-null string".to_string()))
}

/// Parse nullable bytes (int32 or compact length) as a zero-copy view
pub fn parse_nullable_bytes(buf: &mut BytesMut, flexible: bool) -> ProxyResult<Option<Bytes>> {
    Ok(parse_length(buf, flexible, true)?.map(|length| buf.split_to(length).freeze()))
}

/// Parse non-null bytes, treating null as empty
pub fn parse_bytes(buf: &mut BytesMut, flexible: bool) -> ProxyResult<Bytes> {
    Ok(parse_nullable_bytes(buf, flexible)?.unwrap_or_default())
}

/// Parse an array length. `None` means a null array.
///
/// Every element takes at least one byte, so a count larger than the remaining
/// buffer is rejected before anything is allocated.
pub fn parse_array_len(buf: &mut BytesMut, flexible: bool) -> ProxyResult<Option<usize>> {
    let count = if flexible {
        match parse_unsigned_varint(buf)? {
            0 => return Ok(None),
            n => (n - 1) as i64,
        }
    } else {
        read_i32(buf)? as i64
    };

    if count < 0 {
        return Ok(None);
    }
    if count as usize > buf.len() {
        return Err(ProxyError::Protocol(format!(
            "Array count {} exceeds remaining {} bytes",
            count,
            buf.len()
        )));
    }
    Ok(Some(count as usize))
}

/// Parse a nullable array
pub fn parse_nullable_array<T, F>(
    buf: &mut BytesMut,
    flexible: bool,
    mut parse_element: F,
) -> ProxyResult<Option<Vec<T>>>
where
    F: FnMut(&mut BytesMut) -> ProxyResult<T>,
{
    let Some(count) = parse_array_len(buf, flexible)? else {
        return Ok(None);
    };

    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(parse_element(buf)?);
    }
    Ok(Some(elements))
}

/// Parse an array, treating null as empty
pub fn parse_array<T, F>(
    buf: &mut BytesMut,
    flexible: bool,
    parse_element: F,
) -> ProxyResult<Vec<T>>
where
    F: FnMut(&mut BytesMut) -> ProxyResult<T>,
{
    Ok(parse_nullable_array(buf, flexible, parse_element)?.unwrap_or_default())
}

/// Skip tagged fields (compact protocol)
pub fn skip_tagged_fields(buf: &mut BytesMut) -> ProxyResult<()> {
    let count = parse_unsigned_varint(buf)?;
    for _ in 0..count {
        let _tag = parse_unsigned_varint(buf)?;
        let size = parse_unsigned_varint(buf)? as usize;
        if buf.len() < size {
            return Err(ProxyError::Protocol(
                "Buffer too short for tagged field".to_string(),
            ));
        }
        buf.advance(size);
    }
    Ok(())
}

/// Skip tagged fields if the version is flexible
pub fn parse_tags(buf: &mut BytesMut, flexible: bool) -> ProxyResult<()> {
    if flexible {
        skip_tagged_fields(buf)?;
    }
    Ok(())
}

/// Encode empty tagged fields
pub fn encode_empty_tagged_fields(buf: &mut BytesMut) {
    encode_unsigned_varint(buf, 0);
}

/// Encode empty tagged fields if the version is flexible
pub fn encode_tags(buf: &mut BytesMut, flexible: bool) {
    if flexible {
        encode_empty_tagged_fields(buf);
    }
}

pub fn encode_nullable_str(buf: &mut BytesMut, s: Option<&str>, flexible: bool) {
    match (s, flexible) {
        (Some(s), true) => {
            encode_unsigned_varint(buf, (s.len() + 1) as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        (Some(s), false) => {
            buf.put_i16(s.len() as i16);
            buf.extend_from_slice(s.as_bytes());
        }
        (None, true) => encode_unsigned_varint(buf, 0),
        (None, false) => buf.put_i16(-1),
    }
}

pub fn encode_str(buf: &mut BytesMut, s: &str, flexible: bool) {
    encode_nullable_str(buf, Some(s), flexible);
}

pub fn encode_nullable_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>, flexible: bool) {
    match (bytes, flexible) {
        (Some(b), true) => {
            encode_unsigned_varint(buf, (b.len() + 1) as u64);
            buf.extend_from_slice(b);
        }
        (Some(b), false) => {
            buf.put_i32(b.len() as i32);
            buf.extend_from_slice(b);
        }
        (None, true) => encode_unsigned_varint(buf, 0),
        (None, false) => buf.put_i32(-1),
    }
}

pub fn encode_array_len(buf: &mut BytesMut, len: usize, flexible: bool) {
    if flexible {
        encode_unsigned_varint(buf, (len + 1) as u64);
    } else {
        buf.put_i32(len as i32);
    }
}

pub fn encode_null_array(buf: &mut BytesMut, flexible: bool) {
    if flexible {
        encode_unsigned_varint(buf, 0);
    } else {
        buf.put_i32(-1);
    }
}

pub fn encode_array<T, F>(buf: &mut BytesMut, items: &[T], flexible: bool, mut encode_element: F)
where
    F: FnMut(&mut BytesMut, &T),
{
    encode_array_len(buf, items.len(), flexible);
    for item in items {
        encode_element(buf, item);
    }
}

pub fn encode_nullable_array<T, F>(
    buf: &mut BytesMut,
    items: Option<&[T]>,
    flexible: bool,
    encode_element: F,
) where
    F: FnMut(&mut BytesMut, &T),
{
    match items {
        Some(items) => encode_array(buf, items, flexible, encode_element),
        None => encode_null_array(buf, flexible),
    }
}
