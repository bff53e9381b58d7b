//! HTTP server for the admin endpoints (metrics, liveness, readiness)

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

use partmux_observability::{admin_router, Health};

/// Serve the admin endpoints on `addr` until `shutdown` completes
pub async fn serve<F>(addr: &str, health: Health, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, health, shutdown).await
}

pub async fn serve_on<F>(listener: TcpListener, health: Health, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "Admin endpoint listening");
    axum::serve(listener, admin_router(health))
        .with_graceful_shutdown(shutdown)
        .await
}
