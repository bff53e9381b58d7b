//! Variable-length integers used inside Kafka records
//!
//! Record fields (lengths, offset and timestamp deltas, header counts) are
//! zigzag-encoded varints. Decoding is bounds-checked: a short buffer or an
//! over-long encoding is a corrupt batch, never a panic.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Encode a signed integer as a zigzag varint
pub fn encode_varint(buf: &mut impl BufMut, value: i64) {
    let unsigned = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint_u64(buf, unsigned);
}

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Number of bytes `value` occupies as a zigzag varint
pub fn varint_len(value: i64) -> usize {
    let mut unsigned = ((value << 1) ^ (value >> 63)) as u64;
    let mut len = 1;
    while unsigned >= 0x80 {
        unsigned >>= 7;
        len += 1;
    }
    len
}

/// Decode a zigzag varint
pub fn decode_varint(buf: &mut impl Buf) -> Result<i64> {
    let unsigned = decode_varint_u64(buf)?;
    Ok(((unsigned >> 1) as i64) ^ (-((unsigned & 1) as i64)))
}

/// Decode an unsigned varint
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(Error::CorruptBatch("truncated varint".to_string()));
        }

        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptBatch("varint too long".to_string()));
        }
    }
}
