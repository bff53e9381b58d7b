//! Core building blocks for partmux
//!
//! - [`mapping`]: virtual to physical partition assignment
//! - [`record`]: Kafka RecordBatch v2 codec and the virtual partition tag
//! - [`offset_index`]: virtual offset translation state
//! - [`varint`]: zigzag varints used inside records

pub mod error;
pub mod mapping;
pub mod offset_index;
pub mod record;
pub mod varint;

pub use error::{Error, Result};
pub use mapping::PartitionMapping;
pub use offset_index::{
    IndexStats, OffsetIndex, PartitionKey, ScanSource, ScanStart, ScannedRecord,
};
pub use record::{
    decode_batches, encode_batches, Compression, Record, RecordBatch, RecordHeader,
    VIRTUAL_PARTITION_HEADER,
};
