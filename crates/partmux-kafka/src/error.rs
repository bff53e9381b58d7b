//! Proxy error handling
//!
//! Maps proxy failures to the Kafka protocol error codes clients see.

use thiserror::Error;

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported API: key={api_key}, version={api_version}")]
    UnsupportedProtocol { api_key: i16, api_version: i16 },

    #[error("Invalid partition: topic={topic}, partition={partition}")]
    InvalidPartition { topic: String, partition: i32 },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend returned error code {0}")]
    Backend(i16),

    #[error("Cannot translate offset {offset} for {topic}-{partition}")]
    OffsetTranslationFailure {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Request timed out after {0:?}")]
    GatewayTimeout(std::time::Duration),

    #[error(transparent)]
    Mapping(#[from] partmux_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl ProxyError {
    /// Errors worth retrying against a (possibly different) backend connection
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProxyError::Io(_) | ProxyError::ConnectionClosed | ProxyError::BackendUnavailable(_)
        )
    }

    /// Whether the client connection must be closed rather than answered
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ProxyError::Protocol(_) | ProxyError::UnsupportedProtocol { .. }
        )
    }

    /// Kafka error code reported to the client for this error
    pub fn error_code(&self) -> i16 {
        match self {
            ProxyError::Backend(code) => *code,
            other => ErrorCode::from(other).as_i16(),
        }
    }
}

/// Kafka protocol error codes used by the proxy
/// See: https://kafka.apache.org/protocol#protocol_error_codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    None = 0,
    UnknownServerError = -1,
    OffsetOutOfRange = 1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    LeaderNotAvailable = 5,
    NotLeaderOrFollower = 6,
    RequestTimedOut = 7,
    NetworkException = 13,
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    InvalidRequiredAcks = 21,
    UnsupportedVersion = 35,
    InvalidPartitions = 37,
    InvalidRequest = 42,
    UnsupportedForMessageFormat = 43,
    TransactionalIdAuthorizationFailed = 53,
    UnsupportedCompressionType = 76,
    OffsetNotAvailable = 78,
}

impl ErrorCode {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Backend codes that mean the cached leader is stale
    pub fn is_stale_leader(code: i16) -> bool {
        code == ErrorCode::NotLeaderOrFollower.as_i16()
            || code == ErrorCode::LeaderNotAvailable.as_i16()
    }

    /// Backend codes that mean the cached coordinator is stale
    pub fn is_stale_coordinator(code: i16) -> bool {
        code == ErrorCode::CoordinatorLoadInProgress.as_i16()
            || code == ErrorCode::CoordinatorNotAvailable.as_i16()
            || code == ErrorCode::NotCoordinator.as_i16()
    }
}

impl From<&ProxyError> for ErrorCode {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::InvalidPartition { .. } => ErrorCode::UnknownTopicOrPartition,
            ProxyError::UnsupportedProtocol { .. } => ErrorCode::UnsupportedVersion,
            ProxyError::BackendUnavailable(_) => ErrorCode::LeaderNotAvailable,
            ProxyError::Io(_) | ProxyError::ConnectionClosed => ErrorCode::NetworkException,
            ProxyError::OffsetTranslationFailure { .. } => ErrorCode::OffsetOutOfRange,
            ProxyError::GatewayTimeout(_) => ErrorCode::RequestTimedOut,
            ProxyError::Mapping(inner) => match inner {
                partmux_core::Error::InvalidPartition { .. } => ErrorCode::UnknownTopicOrPartition,
                partmux_core::Error::UnsupportedMessageFormat(_) => {
                    ErrorCode::UnsupportedForMessageFormat
                }
                partmux_core::Error::UnsupportedCompression(_) => {
                    ErrorCode::UnsupportedCompressionType
                }
                partmux_core::Error::CorruptBatch(_)
                | partmux_core::Error::CrcMismatch { .. }
                | partmux_core::Error::Compression(_)
                | partmux_core::Error::DecompressionLimit(_) => ErrorCode::CorruptMessage,
                partmux_core::Error::ConfigInvariantViolation(_) => ErrorCode::UnknownServerError,
            },
            ProxyError::Protocol(_) => ErrorCode::InvalidRequest,
            ProxyError::Config(_) | ProxyError::Backend(_) => ErrorCode::UnknownServerError,
        }
    }
}

impl From<ProxyError> for ErrorCode {
    fn from(err: ProxyError) -> Self {
        ErrorCode::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = ProxyError::InvalidPartition {
            topic: "orders".to_string(),
            partition: 100,
        };
        assert_eq!(ErrorCode::from(&err), ErrorCode::UnknownTopicOrPartition);
        assert_eq!(ErrorCode::from(&err).as_i16(), 3);

        let err = ProxyError::OffsetTranslationFailure {
            topic: "orders".to_string(),
            partition: 4,
            offset: 99,
        };
        assert_eq!(ErrorCode::from(err).as_i16(), 1);

        let err = ProxyError::GatewayTimeout(std::time::Duration::from_secs(30));
        assert_eq!(ErrorCode::from(err).as_i16(), 7);
    }

    #[test]
    fn test_batch_errors_map_to_corrupt_message() {
        let err = ProxyError::from(partmux_core::Error::CrcMismatch {
            expected: 1,
            actual: 2,
        });
        assert_eq!(ErrorCode::from(&err), ErrorCode::CorruptMessage);

        let err = ProxyError::from(partmux_core::Error::UnsupportedMessageFormat(1));
        assert_eq!(ErrorCode::from(&err), ErrorCode::UnsupportedForMessageFormat);
    }

    #[test]
    fn test_stale_codes() {
        assert!(ErrorCode::is_stale_leader(6));
        assert!(ErrorCode::is_stale_leader(5));
        assert!(!ErrorCode::is_stale_leader(3));
        assert!(ErrorCode::is_stale_coordinator(16));
        assert!(!ErrorCode::is_stale_coordinator(0));
    }

    #[test]
    fn test_backend_code_passes_through() {
        assert_eq!(ProxyError::Backend(29).error_code(), 29);
        assert_eq!(ProxyError::ConnectionClosed.error_code(), 13);
        assert!(ProxyError::Protocol("short read".to_string()).closes_connection());
        assert!(!ProxyError::Backend(6).closes_connection());
    }

    #[test]
    fn test_retriable() {
        assert!(ProxyError::ConnectionClosed.is_retriable());
        assert!(ProxyError::BackendUnavailable("broker 1".to_string()).is_retriable());
        assert!(!ProxyError::Protocol("bad".to_string()).is_retriable());
    }
}
