//! Admin HTTP surface: Prometheus scrape plus liveness and readiness
//!
//! - `GET /metrics`: text exposition of [`REGISTRY`]
//! - `GET /healthz`: 200 while the process serves HTTP at all
//! - `GET /readyz`: 200 once the owner called [`Health::set_ready`], 503
//!   before that and again after shutdown begins

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::{self, REGISTRY};

/// Readiness flag shared between a component and its admin router
#[derive(Debug, Clone, Default)]
pub struct Health {
    ready: Arc<AtomicBool>,
}

impl Health {
    /// Starts out not ready
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Current registry contents in the Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

async fn metrics_handler() -> Response {
    match render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(health): State<Health>) -> (StatusCode, &'static str) {
    if health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Admin router for one component. Registers every metric on first use.
pub fn admin_router(health: Health) -> Router {
    metrics::init();
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .with_state(health)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt; // for `oneshot`

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = admin_router(Health::new());
        metrics::CONNECTIONS_ACTIVE.inc();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("partmux_connections_active"));
    }

    #[tokio::test]
    async fn test_liveness_ignores_readiness() {
        let (status, body) = get_path(admin_router(Health::new()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let health = Health::new();
        let app = admin_router(health.clone());

        let (status, _) = get_path(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        health.set_ready(true);
        let (status, body) = get_path(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");

        // Draining
        health.set_ready(false);
        let (status, _) = get_path(app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (status, _) = get_path(admin_router(Health::new()), "/other").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_render_metrics_includes_proxy_families() {
        metrics::init();
        metrics::CONNECTIONS_ACTIVE.inc();
        let text = render_metrics().unwrap();
        assert!(text.contains("# TYPE partmux_connections_active gauge"));
    }
}
