//! Error types for partition mapping and record batch handling.
//!
//! ## Error Categories
//!
//! ### Mapping Errors
//! - `InvalidPartition`: a partition id outside the configured range
//! - `ConfigInvariantViolation`: V/P counts that cannot form a mapping
//!
//! ### Record Batch Errors
//! - `CorruptBatch`: truncated or malformed batch data
//! - `CrcMismatch`: checksum over the batch body does not match
//! - `UnsupportedMessageFormat`: legacy message sets (magic 0 and 1)
//! - `Compression`: codec failure while compressing or decompressing
//! - `DecompressionLimit`: compressed records expanding past the allowed ratio

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid partition {partition}: must be in [0, {limit})")]
    InvalidPartition { partition: i32, limit: i32 },

    #[error("Config invariant violated: {0}")]
    ConfigInvariantViolation(String),

    #[error("Corrupt record batch: {0}")]
    CorruptBatch(String),

    #[error("CRC mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Unsupported message format: magic {0}")]
    UnsupportedMessageFormat(i8),

    #[error("Unsupported compression type: {0}")]
    UnsupportedCompression(i16),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompressed batch exceeds {0} bytes")]
    DecompressionLimit(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Compression(err.to_string())
    }
}
