//! FindCoordinator API handler (API Key 10)
//!
//! Coordinators are looked up on the backend so unknown groups surface the
//! broker's own errors, but clients are always pointed back at the proxy.

use futures::future::join_all;
use tracing::debug;

use crate::error::ErrorCode;
use crate::protocol::find_coordinator::Coordinator;
use crate::protocol::{FindCoordinatorRequest, FindCoordinatorResponse};
use crate::session::SessionContext;
use crate::types::CoordinatorType;

/// Handle FindCoordinator request
pub async fn handle_find_coordinator(
    ctx: &SessionContext,
    request: &FindCoordinatorRequest,
) -> FindCoordinatorResponse {
    let key_type = CoordinatorType::from_i8(request.key_type);
    let config = &ctx.state.config;

    let lookups = request.keys.iter().map(|key| async move {
        match ctx.backend.find_coordinator(key, key_type).await {
            Ok(found) if found.error_code == ErrorCode::None.as_i16() => Coordinator {
                key: key.clone(),
                node_id: config.node_id,
                host: config.advertised_host.clone(),
                port: config.advertised_port,
                error_code: ErrorCode::None.as_i16(),
                error_message: None,
            },
            Ok(found) => Coordinator {
                key: key.clone(),
                ..unavailable(found.error_code, found.error_message)
            },
            Err(e) => {
                debug!(key = %key, ?key_type, error = %e, "Coordinator lookup failed");
                Coordinator {
                    key: key.clone(),
                    ..unavailable(ErrorCode::CoordinatorNotAvailable.as_i16(), None)
                }
            }
        }
    });

    FindCoordinatorResponse {
        throttle_time_ms: 0,
        coordinators: join_all(lookups).await,
    }
}

/// Response reporting `error_code` for every requested key
pub fn error_response(
    request: &FindCoordinatorRequest,
    error_code: i16,
) -> FindCoordinatorResponse {
    FindCoordinatorResponse {
        throttle_time_ms: 0,
        coordinators: request
            .keys
            .iter()
            .map(|key| Coordinator {
                key: key.clone(),
                ..unavailable(error_code, None)
            })
            .collect(),
    }
}

fn unavailable(error_code: i16, error_message: Option<String>) -> Coordinator {
    Coordinator {
        key: String::new(),
        node_id: -1,
        host: String::new(),
        port: -1,
        error_code,
        error_message,
    }
}
