//! ApiVersions API handler (API Key 18)

use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::protocol::{ApiVersionsRequest, ApiVersionsResponse};
use crate::session::SessionContext;
use crate::types::{supported_api_versions, ApiKey, ApiVersionRange};

/// Handle ApiVersions request.
///
/// Advertises the proxy's ranges narrowed to what the backend cluster can
/// serve. If the backend cannot be asked, the proxy's own ranges are used.
pub async fn handle_api_versions(ctx: &SessionContext) -> ApiVersionsResponse {
    let api_keys = match ctx.backend.send_to_any(&ApiVersionsRequest::default()).await {
        Ok(backend) if backend.error_code == ErrorCode::None.as_i16() => {
            intersect_api_versions(&backend.api_keys)
        }
        Ok(backend) => {
            warn!(
                error_code = backend.error_code,
                "Backend rejected ApiVersions, advertising proxy ranges"
            );
            supported_api_versions()
        }
        Err(e) => {
            warn!(error = %e, "Backend ApiVersions failed, advertising proxy ranges");
            supported_api_versions()
        }
    };

    ApiVersionsResponse {
        error_code: ErrorCode::None.as_i16(),
        api_keys,
        throttle_time_ms: 0,
    }
}

/// Combine the proxy's ranges with the backend's.
///
/// APIs the proxy rewrites keep the proxy's full range as long as the backend
/// accepts the fixed version the proxy speaks to it. Relayed APIs pass the
/// client's version through, so their range is the intersection.
pub fn intersect_api_versions(backend: &[ApiVersionRange]) -> Vec<ApiVersionRange> {
    supported_api_versions()
        .into_iter()
        .filter_map(|proxy| {
            let Some(key) = ApiKey::from_i16(proxy.api_key) else {
                return Some(proxy);
            };
            if key == ApiKey::ApiVersions {
                return Some(proxy);
            }

            let Some(broker) = backend.iter().find(|b| b.api_key == proxy.api_key) else {
                debug!(api = key.name(), "API not offered by backend");
                return None;
            };

            match key.backend_version() {
                Some(version) => (broker.min_version <= version && version <= broker.max_version)
                    .then_some(proxy),
                None => {
                    let min_version = proxy.min_version.max(broker.min_version);
                    let max_version = proxy.max_version.min(broker.max_version);
                    (min_version <= max_version).then_some(ApiVersionRange {
                        api_key: proxy.api_key,
                        min_version,
                        max_version,
                    })
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(key: ApiKey, min_version: i16, max_version: i16) -> ApiVersionRange {
        ApiVersionRange {
            api_key: key.as_i16(),
            min_version,
            max_version,
        }
    }

    fn find(ranges: &[ApiVersionRange], key: ApiKey) -> Option<ApiVersionRange> {
        ranges.iter().copied().find(|r| r.api_key == key.as_i16())
    }

    #[test]
    fn test_rewritten_apis_keep_proxy_range() {
        let backend = vec![range(ApiKey::Fetch, 0, 13), range(ApiKey::Produce, 0, 9)];
        let ranges = intersect_api_versions(&backend);

        assert_eq!(find(&ranges, ApiKey::Fetch), Some(range(ApiKey::Fetch, 4, 12)));
        assert_eq!(find(&ranges, ApiKey::Produce), Some(range(ApiKey::Produce, 3, 9)));
        assert_eq!(find(&ranges, ApiKey::Metadata), None);
        assert!(find(&ranges, ApiKey::ApiVersions).is_some());
    }

    #[test]
    fn test_rewritten_api_dropped_when_backend_version_missing() {
        // Broker no longer accepts Fetch v4
        let backend = vec![range(ApiKey::Fetch, 5, 16)];
        let ranges = intersect_api_versions(&backend);
        assert_eq!(find(&ranges, ApiKey::Fetch), None);
    }

    #[test]
    fn test_relayed_apis_are_intersected() {
        let backend = vec![
            range(ApiKey::JoinGroup, 2, 5),
            range(ApiKey::Heartbeat, 5, 9),
        ];
        let ranges = intersect_api_versions(&backend);

        assert_eq!(find(&ranges, ApiKey::JoinGroup), Some(range(ApiKey::JoinGroup, 2, 5)));
        assert_eq!(find(&ranges, ApiKey::Heartbeat), None);
    }
}
