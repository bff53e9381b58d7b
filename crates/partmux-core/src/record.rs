//! Kafka RecordBatch (magic v2) encoding and decoding
//!
//! ## Batch layout
//!
//! ```text
//! base_offset            i64
//! batch_length           i32   bytes after this field
//! partition_leader_epoch i32
//! magic                  i8    always 2
//! crc                    u32   CRC32C over attributes..end
//! attributes             i16   compression | timestamp type | transactional | control
//! last_offset_delta      i32
//! base_timestamp         i64
//! max_timestamp          i64
//! producer_id            i64
//! producer_epoch         i16
//! base_sequence          i32
//! records                i32 count + records (possibly compressed)
//! ```
//!
//! Each record stores varint deltas against the batch base offset and base
//! timestamp, followed by key, value and headers.
//!
//! ## Virtual partition tag
//!
//! Records written by the proxy carry a `partmux.vp` header holding the
//! 4-byte big-endian id of the virtual partition they were produced to. The
//! tag is how colocated virtual partitions are told apart on read.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::varint::{decode_varint, encode_varint};

/// Header key carrying the virtual partition id of a record
pub const VIRTUAL_PARTITION_HEADER: &str = "partmux.vp";

/// Fixed size of the batch header, including the record count
pub const BATCH_HEADER_SIZE: usize = 61;

/// base_offset + batch_length
const LOG_OVERHEAD: usize = 12;
const MAGIC_OFFSET: usize = 16;
const CRC_OFFSET: usize = 17;
const ATTRIBUTES_OFFSET: usize = 21;
const MAGIC_V2: i8 = 2;

pub const COMPRESSION_MASK: i16 = 0x07;
pub const LOG_APPEND_TIME_FLAG: i16 = 0x08;
pub const TRANSACTIONAL_FLAG: i16 = 0x10;
pub const CONTROL_FLAG: i16 = 0x20;

/// Largest accepted ratio of decompressed to compressed records size
pub const MAX_DECOMPRESSION_RATIO: usize = 256;
/// Decompressed size always allowed, however small the compressed input
const MIN_DECOMPRESSION_LIMIT: usize = 64 * 1024;

fn decompression_limit(compressed_len: usize) -> usize {
    compressed_len
        .saturating_mul(MAX_DECOMPRESSION_RATIO)
        .max(MIN_DECOMPRESSION_LIMIT)
}

const XERIAL_MAGIC: [u8; 8] = [0x82, b'S', b'N', b'A', b'P', b'P', b'Y', 0];
const XERIAL_HEADER_SIZE: usize = 16;

/// Compression codec stored in the low bits of the batch attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn from_attributes(attributes: i16) -> Result<Self> {
        match attributes & COMPRESSION_MASK {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            3 => Ok(Compression::Lz4),
            4 => Ok(Compression::Zstd),
            other => Err(Error::UnsupportedCompression(other)),
        }
    }

    pub fn id(self) -> i16 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
            Compression::Lz4 => 3,
            Compression::Zstd => 4,
        }
    }

    /// Decompress `data`, failing once the output would exceed `limit` bytes
    fn decompress(self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => read_limited(flate2::read::GzDecoder::new(data), limit),
            Compression::Snappy => decompress_snappy(data, limit),
            Compression::Lz4 => read_limited(lz4_flex::frame::FrameDecoder::new(data), limit),
            Compression::Zstd => read_limited(zstd::stream::read::Decoder::new(data)?, limit),
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            Compression::Snappy => compress_snappy(data),
            Compression::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                encoder.write_all(data)?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))
            }
            Compression::Zstd => Ok(zstd::stream::encode_all(data, 3)?),
        }
    }
}

/// Snappy payloads come either raw or in the xerial block framing used by the
/// Java client.
fn decompress_snappy(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = snap::raw::Decoder::new();
    let declared_len = |block: &[u8]| {
        snap::raw::decompress_len(block).map_err(|e| Error::Compression(e.to_string()))
    };

    if data.len() < XERIAL_HEADER_SIZE || data[..8] != XERIAL_MAGIC {
        if declared_len(data)? > limit {
            return Err(Error::DecompressionLimit(limit));
        }
        return decoder
            .decompress_vec(data)
            .map_err(|e| Error::Compression(e.to_string()));
    }

    let mut out = Vec::new();
    let mut blocks = &data[XERIAL_HEADER_SIZE..];
    while !blocks.is_empty() {
        if blocks.len() < 4 {
            return Err(Error::Compression("truncated xerial block".to_string()));
        }
        let len = blocks.get_i32();
        if len < 0 || blocks.len() < len as usize {
            return Err(Error::Compression("truncated xerial block".to_string()));
        }
        let (block, rest) = blocks.split_at(len as usize);
        if out.len() + declared_len(block)? > limit {
            return Err(Error::DecompressionLimit(limit));
        }
        out.extend_from_slice(
            &decoder
                .decompress_vec(block)
                .map_err(|e| Error::Compression(e.to_string()))?,
        );
        blocks = rest;
    }
    Ok(out)
}

fn read_limited<R: Read>(reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(Error::DecompressionLimit(limit));
    }
    Ok(out)
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let block = snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| Error::Compression(e.to_string()))?;

    let mut out = Vec::with_capacity(XERIAL_HEADER_SIZE + 4 + block.len());
    out.extend_from_slice(&XERIAL_MAGIC);
    out.put_i32(1);
    out.put_i32(1);
    out.put_i32(block.len() as i32);
    out.extend_from_slice(&block);
    Ok(out)
}

/// A record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// A single record with absolute offset and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    pub fn new(offset: i64, timestamp: i64, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            offset,
            timestamp,
            key,
            value,
            headers: Vec::new(),
        }
    }

    /// Upper bound on the bytes this record occupies inside an uncompressed
    /// batch, whatever the batch base offset and timestamp
    pub fn size_hint(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, self.offset, self.timestamp);
        // Two deltas of up to 9 extra varint bytes, plus a longer length prefix
        buf.len() + 2 * 9 + 3
    }

    /// Virtual partition this record was produced to, if tagged
    pub fn virtual_partition(&self) -> Option<i32> {
        self.headers
            .iter()
            .find(|h| h.key == VIRTUAL_PARTITION_HEADER)
            .and_then(|h| h.value.as_ref())
            .and_then(|v| <[u8; 4]>::try_from(v.as_ref()).ok())
            .map(i32::from_be_bytes)
    }

    /// Tag the record with a virtual partition, replacing any existing tag
    pub fn set_virtual_partition(&mut self, virtual_partition: i32) {
        self.strip_virtual_partition();
        self.headers.push(RecordHeader {
            key: VIRTUAL_PARTITION_HEADER.to_string(),
            value: Some(Bytes::copy_from_slice(&virtual_partition.to_be_bytes())),
        });
    }

    pub fn strip_virtual_partition(&mut self) {
        self.headers.retain(|h| h.key != VIRTUAL_PARTITION_HEADER);
    }

    fn encode(&self, buf: &mut BytesMut, base_offset: i64, base_timestamp: i64) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        encode_varint(&mut body, self.timestamp - base_timestamp);
        encode_varint(&mut body, self.offset - base_offset);
        encode_varbytes(&mut body, self.key.as_deref());
        encode_varbytes(&mut body, self.value.as_deref());
        encode_varint(&mut body, self.headers.len() as i64);
        for header in &self.headers {
            encode_varint(&mut body, header.key.len() as i64);
            body.extend_from_slice(header.key.as_bytes());
            encode_varbytes(&mut body, header.value.as_deref());
        }

        encode_varint(buf, body.len() as i64);
        buf.extend_from_slice(&body);
    }

    fn decode(buf: &mut Bytes, base_offset: i64, base_timestamp: i64) -> Result<Self> {
        let length = decode_varint(buf)?;
        if length < 0 || buf.remaining() < length as usize {
            return Err(Error::CorruptBatch(format!(
                "record length {} exceeds remaining {}",
                length,
                buf.remaining()
            )));
        }
        let mut body = buf.split_to(length as usize);

        if !body.has_remaining() {
            return Err(Error::CorruptBatch("empty record".to_string()));
        }
        let _attributes = body.get_i8();
        let timestamp_delta = decode_varint(&mut body)?;
        let offset_delta = decode_varint(&mut body)?;
        let key = decode_varbytes(&mut body)?;
        let value = decode_varbytes(&mut body)?;

        let header_count = decode_varint(&mut body)?;
        if header_count < 0 {
            return Err(Error::CorruptBatch("negative header count".to_string()));
        }
        let mut headers = Vec::with_capacity((header_count as usize).min(body.remaining()));
        for _ in 0..header_count {
            let key = decode_varbytes(&mut body)?
                .ok_or_else(|| Error::CorruptBatch("null header key".to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| Error::CorruptBatch(format!("invalid header key: {}", e)))?;
            let value = decode_varbytes(&mut body)?;
            headers.push(RecordHeader { key, value });
        }

        Ok(Record {
            offset: base_offset + offset_delta,
            timestamp: base_timestamp + timestamp_delta,
            key,
            value,
            headers,
        })
    }
}

fn encode_varbytes(buf: &mut BytesMut, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            encode_varint(buf, b.len() as i64);
            buf.extend_from_slice(b);
        }
        None => encode_varint(buf, -1),
    }
}

fn decode_varbytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    let len = decode_varint(buf)?;
    if len < 0 {
        return Ok(None);
    }
    if buf.remaining() < len as usize {
        return Err(Error::CorruptBatch(format!(
            "field length {} exceeds remaining {}",
            len,
            buf.remaining()
        )));
    }
    Ok(Some(buf.split_to(len as usize)))
}

/// A decoded record batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub attributes: i16,
    pub last_offset_delta: i32,
    pub base_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Build a batch around records that already carry absolute offsets.
    pub fn new(records: Vec<Record>) -> Self {
        let base_offset = records.first().map(|r| r.offset).unwrap_or(0);
        let last_offset = records.last().map(|r| r.offset).unwrap_or(base_offset);
        let base_timestamp = records.first().map(|r| r.timestamp).unwrap_or(-1);
        let max_timestamp = records
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or(base_timestamp);

        Self {
            base_offset,
            partition_leader_epoch: -1,
            attributes: 0,
            last_offset_delta: (last_offset - base_offset) as i32,
            base_timestamp,
            max_timestamp,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records,
        }
    }

    pub fn compression(&self) -> Result<Compression> {
        Compression::from_attributes(self.attributes)
    }

    pub fn is_control(&self) -> bool {
        self.attributes & CONTROL_FLAG != 0
    }

    pub fn is_transactional(&self) -> bool {
        self.attributes & TRANSACTIONAL_FLAG != 0
    }

    pub fn has_log_append_time(&self) -> bool {
        self.attributes & LOG_APPEND_TIME_FLAG != 0
    }

    /// Offset following the last offset this batch covers
    pub fn next_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta as i64 + 1
    }

    /// Drop idempotent/transactional producer state so the broker treats the
    /// batch as a plain append.
    pub fn clear_producer_state(&mut self) {
        self.producer_id = -1;
        self.producer_epoch = -1;
        self.base_sequence = -1;
        self.attributes &= !TRANSACTIONAL_FLAG;
    }

    /// Encode uncompressed
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.encode_with(buf, Compression::None)
    }

    /// Encode, compressing the records section with `compression`
    pub fn encode_with(&self, buf: &mut BytesMut, compression: Compression) -> Result<()> {
        let mut body = BytesMut::new();
        for record in &self.records {
            record.encode(&mut body, self.base_offset, self.base_timestamp);
        }
        let body = compression.compress(&body)?;

        let start = buf.len();
        buf.reserve(BATCH_HEADER_SIZE + body.len());
        buf.put_i64(self.base_offset);
        buf.put_i32(0);
        buf.put_i32(self.partition_leader_epoch);
        buf.put_i8(MAGIC_V2);
        buf.put_u32(0);
        buf.put_i16((self.attributes & !COMPRESSION_MASK) | compression.id());
        buf.put_i32(self.last_offset_delta);
        buf.put_i64(self.base_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_i32(self.base_sequence);
        buf.put_i32(self.records.len() as i32);
        buf.extend_from_slice(&body);

        let batch_length = (buf.len() - start - LOG_OVERHEAD) as i32;
        buf[start + 8..start + LOG_OVERHEAD].copy_from_slice(&batch_length.to_be_bytes());
        let crc = crc32c::crc32c(&buf[start + ATTRIBUTES_OFFSET..]);
        buf[start + CRC_OFFSET..start + ATTRIBUTES_OFFSET].copy_from_slice(&crc.to_be_bytes());

        Ok(())
    }

    /// Decode the next batch from `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only a partial batch, which brokers
    /// legitimately send at the end of a size-limited fetch.
    pub fn decode(buf: &mut Bytes) -> Result<Option<Self>> {
        if buf.remaining() < LOG_OVERHEAD {
            return Ok(None);
        }

        let batch_length = i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if batch_length < 0 {
            return Err(Error::CorruptBatch(format!(
                "negative batch length {}",
                batch_length
            )));
        }
        let total = LOG_OVERHEAD + batch_length as usize;
        if buf.remaining() < total {
            return Ok(None);
        }

        let mut data = buf.split_to(total);
        if total <= MAGIC_OFFSET {
            return Err(Error::CorruptBatch("batch too short for magic".to_string()));
        }
        let magic = data[MAGIC_OFFSET] as i8;
        if magic != MAGIC_V2 {
            return Err(Error::UnsupportedMessageFormat(magic));
        }
        if total < BATCH_HEADER_SIZE {
            return Err(Error::CorruptBatch(format!("batch too short: {} bytes", total)));
        }

        let expected = u32::from_be_bytes([
            data[CRC_OFFSET],
            data[CRC_OFFSET + 1],
            data[CRC_OFFSET + 2],
            data[CRC_OFFSET + 3],
        ]);
        let actual = crc32c::crc32c(&data[ATTRIBUTES_OFFSET..]);
        if expected != actual {
            return Err(Error::CrcMismatch { expected, actual });
        }

        let base_offset = data.get_i64();
        let _batch_length = data.get_i32();
        let partition_leader_epoch = data.get_i32();
        let _magic = data.get_i8();
        let _crc = data.get_u32();
        let attributes = data.get_i16();
        let last_offset_delta = data.get_i32();
        let base_timestamp = data.get_i64();
        let max_timestamp = data.get_i64();
        let producer_id = data.get_i64();
        let producer_epoch = data.get_i16();
        let base_sequence = data.get_i32();
        let record_count = data.get_i32();
        if record_count < 0 {
            return Err(Error::CorruptBatch(format!(
                "negative record count {}",
                record_count
            )));
        }

        let compression = Compression::from_attributes(attributes)?;
        let mut body = match compression {
            Compression::None => data,
            other => Bytes::from(other.decompress(&data, decompression_limit(data.len()))?),
        };

        let mut records = Vec::with_capacity((record_count as usize).min(body.remaining()));
        for _ in 0..record_count {
            let mut record = Record::decode(&mut body, base_offset, base_timestamp)?;
            if attributes & LOG_APPEND_TIME_FLAG != 0 {
                record.timestamp = max_timestamp;
            }
            records.push(record);
        }

        Ok(Some(RecordBatch {
            base_offset,
            partition_leader_epoch,
            attributes,
            last_offset_delta,
            base_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            base_sequence,
            records,
        }))
    }
}

/// Decode every complete batch in a records field, ignoring a partial tail
pub fn decode_batches(mut data: Bytes) -> Result<Vec<RecordBatch>> {
    let mut batches = Vec::new();
    while let Some(batch) = RecordBatch::decode(&mut data)? {
        batches.push(batch);
    }
    Ok(batches)
}

/// Encode batches back to back, uncompressed
pub fn encode_batches(batches: &[RecordBatch]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for batch in batches {
        batch.encode(&mut buf)?;
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<Record> {
        let mut first = Record::new(
            100,
            1_700_000_000_000,
            Some(Bytes::from_static(b"k1")),
            Some(Bytes::from_static(b"a")),
        );
        first.headers.push(RecordHeader {
            key: "trace".to_string(),
            value: None,
        });
        let second = Record::new(101, 1_700_000_000_005, None, Some(Bytes::from_static(b"b")));
        let third = Record::new(102, 1_699_999_999_990, None, None);
        vec![first, second, third]
    }

    fn encode_one(batch: &RecordBatch, compression: Compression) -> Bytes {
        let mut buf = BytesMut::new();
        batch.encode_with(&mut buf, compression).unwrap();
        buf.freeze()
    }

    // ===============================================================
    // Batch encode/decode
    // ===============================================================

    #[test]
    fn test_batch_header_fields() {
        let batch = RecordBatch::new(sample_records());
        assert_eq!(batch.base_offset, 100);
        assert_eq!(batch.last_offset_delta, 2);
        assert_eq!(batch.base_timestamp, 1_700_000_000_000);
        assert_eq!(batch.max_timestamp, 1_700_000_000_005);
        assert_eq!(batch.next_offset(), 103);
        assert_eq!(batch.producer_id, -1);
    }

    #[test]
    fn test_batch_decode_restores_records() {
        let batch = RecordBatch::new(sample_records());
        let encoded = encode_one(&batch, Compression::None);

        let decoded = decode_batches(encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].records, sample_records());
        assert_eq!(decoded[0].compression().unwrap(), Compression::None);
    }

    #[test]
    fn test_batch_length_and_crc_layout() {
        let batch = RecordBatch::new(sample_records());
        let encoded = encode_one(&batch, Compression::None);

        let batch_length = i32::from_be_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]);
        assert_eq!(batch_length as usize, encoded.len() - LOG_OVERHEAD);
        assert_eq!(encoded[MAGIC_OFFSET] as i8, 2);

        let crc = u32::from_be_bytes([encoded[17], encoded[18], encoded[19], encoded[20]]);
        assert_eq!(crc, crc32c::crc32c(&encoded[ATTRIBUTES_OFFSET..]));
    }

    #[test]
    fn test_size_hint_bounds_encoded_size() {
        let mut far = Record::new(
            i64::MAX / 2,
            i64::MAX / 2,
            Some(Bytes::from_static(b"key")),
            Some(Bytes::from(vec![1u8; 300])),
        );
        far.set_virtual_partition(42);
        let near = Record::new(0, 0, None, Some(Bytes::from_static(b"v")));
        let batch = RecordBatch::new(vec![near.clone(), far.clone()]);

        let encoded = encode_one(&batch, Compression::None);
        assert!(encoded.len() <= BATCH_HEADER_SIZE + near.size_hint() + far.size_hint());
    }

    #[test]
    fn test_every_codec_decodes() {
        for compression in [
            Compression::Gzip,
            Compression::Snappy,
            Compression::Lz4,
            Compression::Zstd,
        ] {
            let batch = RecordBatch::new(sample_records());
            let encoded = encode_one(&batch, compression);
            let decoded = decode_batches(encoded).unwrap();
            assert_eq!(decoded[0].compression().unwrap(), compression);
            assert_eq!(decoded[0].records, sample_records(), "{:?}", compression);
        }
    }

    #[test]
    fn test_raw_snappy_decodes() {
        let data = b"raw snappy without xerial framing";
        let raw = snap::raw::Encoder::new().compress_vec(data).unwrap();
        assert_eq!(decompress_snappy(&raw, 1024).unwrap(), data.to_vec());
    }

    #[test]
    fn test_highly_compressible_batch_rejected() {
        let zeros = Bytes::from(vec![0u8; 8 * 1024 * 1024]);
        for compression in [Compression::Gzip, Compression::Zstd] {
            let batch = RecordBatch::new(vec![Record::new(0, 1, None, Some(zeros.clone()))]);
            let encoded = encode_one(&batch, compression);
            assert!(encoded.len() * MAX_DECOMPRESSION_RATIO < zeros.len());

            let err = decode_batches(encoded).unwrap_err();
            assert!(
                matches!(err, Error::DecompressionLimit(_)),
                "{:?}: {:?}",
                compression,
                err
            );
        }
    }

    #[test]
    fn test_snappy_declared_length_checked() {
        let data = vec![7u8; 4096];
        let raw = snap::raw::Encoder::new().compress_vec(&data).unwrap();
        assert!(matches!(
            decompress_snappy(&raw, 1024),
            Err(Error::DecompressionLimit(1024))
        ));

        let framed = compress_snappy(&data).unwrap();
        assert!(matches!(
            decompress_snappy(&framed, 1024),
            Err(Error::DecompressionLimit(1024))
        ));
        assert_eq!(decompress_snappy(&framed, 4096).unwrap(), data);
    }

    #[test]
    fn test_small_batches_get_minimum_limit() {
        assert_eq!(decompression_limit(10), MIN_DECOMPRESSION_LIMIT);
        assert_eq!(decompression_limit(1024 * 1024), 256 * 1024 * 1024);
    }

    #[test]
    fn test_multiple_batches_and_partial_tail() {
        let first = RecordBatch::new(sample_records());
        let second = RecordBatch::new(vec![Record::new(
            103,
            1,
            None,
            Some(Bytes::from_static(b"c")),
        )]);

        let mut buf = BytesMut::new();
        first.encode(&mut buf).unwrap();
        second.encode(&mut buf).unwrap();
        let full_len = buf.len();
        first.encode(&mut buf).unwrap();
        buf.truncate(full_len + 30);

        let decoded = decode_batches(buf.freeze()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].base_offset, 103);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let batch = RecordBatch::new(sample_records());
        let mut encoded = BytesMut::from(&encode_one(&batch, Compression::None)[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let err = decode_batches(encoded.freeze()).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { .. }));
    }

    #[test]
    fn test_legacy_magic_rejected() {
        let batch = RecordBatch::new(sample_records());
        let mut encoded = BytesMut::from(&encode_one(&batch, Compression::None)[..]);
        encoded[MAGIC_OFFSET] = 1;

        let err = decode_batches(encoded.freeze()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMessageFormat(1)));
    }

    #[test]
    fn test_log_append_time_overrides_record_timestamps() {
        let mut batch = RecordBatch::new(sample_records());
        batch.attributes |= LOG_APPEND_TIME_FLAG;
        batch.max_timestamp = 42;

        let decoded = decode_batches(encode_one(&batch, Compression::None)).unwrap();
        assert!(decoded[0].has_log_append_time());
        assert!(decoded[0].records.iter().all(|r| r.timestamp == 42));
    }

    #[test]
    fn test_clear_producer_state() {
        let mut batch = RecordBatch::new(sample_records());
        batch.producer_id = 7;
        batch.producer_epoch = 1;
        batch.base_sequence = 12;
        batch.attributes |= TRANSACTIONAL_FLAG;

        batch.clear_producer_state();
        assert_eq!(batch.producer_id, -1);
        assert_eq!(batch.producer_epoch, -1);
        assert_eq!(batch.base_sequence, -1);
        assert!(!batch.is_transactional());
    }

    // ===============================================================
    // Virtual partition tag
    // ===============================================================

    #[test]
    fn test_tag_set_replace_and_strip() {
        let mut record = Record::new(0, 0, None, Some(Bytes::from_static(b"x")));
        assert_eq!(record.virtual_partition(), None);

        record.set_virtual_partition(42);
        assert_eq!(record.virtual_partition(), Some(42));

        record.set_virtual_partition(43);
        assert_eq!(record.virtual_partition(), Some(43));
        assert_eq!(record.headers.len(), 1);

        record.strip_virtual_partition();
        assert_eq!(record.virtual_partition(), None);
        assert!(record.headers.is_empty());
    }

    #[test]
    fn test_tag_survives_encoding() {
        let mut record = Record::new(5, 10, None, Some(Bytes::from_static(b"payload")));
        record.set_virtual_partition(7);

        let batch = RecordBatch::new(vec![record]);
        let decoded = decode_batches(encode_one(&batch, Compression::Lz4)).unwrap();
        assert_eq!(decoded[0].records[0].virtual_partition(), Some(7));
    }

    #[test]
    fn test_malformed_tag_is_ignored() {
        let mut record = Record::new(0, 0, None, None);
        record.headers.push(RecordHeader {
            key: VIRTUAL_PARTITION_HEADER.to_string(),
            value: Some(Bytes::from_static(b"abc")),
        });
        assert_eq!(record.virtual_partition(), None);
    }
}
