//! Kafka protocol types and constants

/// Kafka API keys understood by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    DescribeGroups = 15,
    ListGroups = 16,
    ApiVersions = 18,
    InitProducerId = 22,
}

impl ApiKey {
    pub const ALL: [ApiKey; 15] = [
        ApiKey::Produce,
        ApiKey::Fetch,
        ApiKey::ListOffsets,
        ApiKey::Metadata,
        ApiKey::OffsetCommit,
        ApiKey::OffsetFetch,
        ApiKey::FindCoordinator,
        ApiKey::JoinGroup,
        ApiKey::Heartbeat,
        ApiKey::LeaveGroup,
        ApiKey::SyncGroup,
        ApiKey::DescribeGroups,
        ApiKey::ListGroups,
        ApiKey::ApiVersions,
        ApiKey::InitProducerId,
    ];

    pub fn from_i16(key: i16) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_i16() == key)
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Metric label
    pub fn name(self) -> &'static str {
        match self {
            ApiKey::Produce => "produce",
            ApiKey::Fetch => "fetch",
            ApiKey::ListOffsets => "list_offsets",
            ApiKey::Metadata => "metadata",
            ApiKey::OffsetCommit => "offset_commit",
            ApiKey::OffsetFetch => "offset_fetch",
            ApiKey::FindCoordinator => "find_coordinator",
            ApiKey::JoinGroup => "join_group",
            ApiKey::Heartbeat => "heartbeat",
            ApiKey::LeaveGroup => "leave_group",
            ApiKey::SyncGroup => "sync_group",
            ApiKey::DescribeGroups => "describe_groups",
            ApiKey::ListGroups => "list_groups",
            ApiKey::ApiVersions => "api_versions",
            ApiKey::InitProducerId => "init_producer_id",
        }
    }

    /// Versions the proxy accepts from clients
    pub fn supported_versions(self) -> (i16, i16) {
        match self {
            ApiKey::Produce => (3, 9),
            ApiKey::Fetch => (4, 12),
            ApiKey::ListOffsets => (1, 6),
            ApiKey::Metadata => (1, 12),
            ApiKey::OffsetCommit => (2, 8),
            ApiKey::OffsetFetch => (1, 7),
            ApiKey::FindCoordinator => (0, 4),
            ApiKey::JoinGroup => (0, 7),
            ApiKey::Heartbeat => (0, 4),
            ApiKey::LeaveGroup => (0, 4),
            ApiKey::SyncGroup => (0, 5),
            ApiKey::DescribeGroups => (0, 5),
            ApiKey::ListGroups => (0, 4),
            ApiKey::ApiVersions => (0, 3),
            ApiKey::InitProducerId => (0, 4),
        }
    }

    pub fn supports(self, version: i16) -> bool {
        let (min, max) = self.supported_versions();
        (min..=max).contains(&version)
    }

    /// Version the proxy speaks to brokers
    pub fn backend_version(self) -> Option<i16> {
        match self {
            ApiKey::ApiVersions => Some(0),
            ApiKey::Metadata => Some(1),
            ApiKey::Produce => Some(3),
            ApiKey::Fetch => Some(4),
            ApiKey::ListOffsets => Some(1),
            ApiKey::FindCoordinator => Some(1),
            ApiKey::OffsetCommit => Some(2),
            ApiKey::OffsetFetch => Some(1),
            _ => None,
        }
    }
}

/// Returns true if the given (api_key, api_version) uses flexible protocol
/// (compact strings + tagged fields in request/response headers).
pub fn is_flexible_version(api_key: i16, api_version: i16) -> bool {
    let flex_start = match api_key {
        0 => 9,  // Produce
        1 => 12, // Fetch
        2 => 6,  // ListOffsets
        3 => 9,  // Metadata
        8 => 8,  // OffsetCommit
        9 => 6,  // OffsetFetch
        10 => 3, // FindCoordinator
        11 => 6, // JoinGroup
        12 => 4, // Heartbeat
        13 => 4, // LeaveGroup
        14 => 4, // SyncGroup
        15 => 5, // DescribeGroups
        16 => 3, // ListGroups
        18 => 3, // ApiVersions
        22 => 2, // InitProducerId
        _ => return false,
    };
    api_version >= flex_start
}

/// Whether the response header carries tagged fields.
///
/// ApiVersions responses always use header v0 so that clients can parse the
/// reply before they know which versions the broker supports.
pub fn is_flexible_response(api_key: i16, api_version: i16) -> bool {
    api_key != ApiKey::ApiVersions.as_i16() && is_flexible_version(api_key, api_version)
}

/// Supported API versions for one API key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersionRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

/// Returns the API versions the proxy advertises
pub fn supported_api_versions() -> Vec<ApiVersionRange> {
    ApiKey::ALL
        .iter()
        .map(|key| {
            let (min_version, max_version) = key.supported_versions();
            ApiVersionRange {
                api_key: key.as_i16(),
                min_version,
                max_version,
            }
        })
        .collect()
}

/// FindCoordinator key types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum CoordinatorType {
    Group = 0,
    Transaction = 1,
}

impl CoordinatorType {
    pub fn from_i8(value: i8) -> Self {
        match value {
            1 => CoordinatorType::Transaction,
            _ => CoordinatorType::Group,
        }
    }
}

/// ListOffsets sentinel timestamp for the log end
pub const LATEST_TIMESTAMP: i64 = -1;
/// ListOffsets sentinel timestamp for the log start
pub const EARLIEST_TIMESTAMP: i64 = -2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_from_i16_roundtrip() {
        for key in ApiKey::ALL {
            assert_eq!(ApiKey::from_i16(key.as_i16()), Some(key));
        }
        assert_eq!(ApiKey::from_i16(19), None);
        assert_eq!(ApiKey::from_i16(-1), None);
    }

    #[test]
    fn test_supported_ranges() {
        assert!(ApiKey::Fetch.supports(12));
        assert!(!ApiKey::Fetch.supports(13));
        assert!(!ApiKey::Fetch.supports(3));
        assert!(ApiKey::Produce.supports(9));
        assert!(!ApiKey::Produce.supports(2));
        assert!(!ApiKey::ApiVersions.supports(4));
    }

    #[test]
    fn test_supported_api_versions_no_duplicates() {
        let versions = supported_api_versions();
        assert_eq!(versions.len(), ApiKey::ALL.len());
        let mut keys: Vec<i16> = versions.iter().map(|v| v.api_key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), versions.len());
        assert!(versions.iter().all(|v| v.min_version <= v.max_version));
    }

    #[test]
    fn test_backend_versions_are_not_flexible() {
        for key in ApiKey::ALL {
            if let Some(version) = key.backend_version() {
                assert!(key.supports(version));
                assert!(!is_flexible_version(key.as_i16(), version));
            }
        }
    }

    #[test]
    fn test_api_versions_response_header_is_never_flexible() {
        assert!(is_flexible_version(18, 3));
        assert!(!is_flexible_response(18, 3));
        assert!(is_flexible_response(3, 9));
    }
}
