//! partmux proxy
//!
//! Kafka-protocol proxy that presents V virtual partitions per topic on top
//! of P physical ones.
//!
//! ## Configuration
//!
//! Read from the environment:
//!
//! - `PARTMUX_BOOTSTRAP_SERVERS`: comma-separated backend brokers (required)
//! - `PARTMUX_VIRTUAL_PARTITIONS` / `PARTMUX_PHYSICAL_PARTITIONS`: V and P
//! - `PARTMUX_BIND_ADDR`: client listener (default: 0.0.0.0:9092)
//! - `PARTMUX_ADVERTISED_HOST` / `PARTMUX_ADVERTISED_PORT`: address returned
//!   in Metadata and FindCoordinator
//! - `PARTMUX_METRICS_ADDR`: admin endpoint serving `/metrics`, `/healthz`
//!   and `/readyz` (default: 0.0.0.0:9090)
//! - `PARTMUX_LOG_FORMAT`: `json` for structured logs
//!
//! ```bash
//! PARTMUX_BOOTSTRAP_SERVERS=localhost:19092 \
//! PARTMUX_VIRTUAL_PARTITIONS=100 PARTMUX_PHYSICAL_PARTITIONS=10 \
//! cargo run -p partmux-server --bin partmux-proxy
//! ```

use anyhow::Context;
use tracing::{error, info};

use partmux_kafka::{ProxyConfig, ProxyServer};
use partmux_observability::Health;
use partmux_server::{metrics_server, telemetry, ShutdownHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    partmux_observability::init_metrics();

    let config = ProxyConfig::from_env().context("invalid proxy configuration")?;
    info!(
        virtual_partitions = config.virtual_partitions,
        physical_partitions = config.physical_partitions,
        advertised = %format!("{}:{}", config.advertised_host, config.advertised_port),
        "Starting partmux proxy"
    );

    let shutdown = ShutdownHandle::new();
    shutdown.listen_for_signals();

    let health = Health::new();
    let metrics_addr = config.metrics_addr.clone();
    let metrics_health = health.clone();
    let metrics_shutdown = shutdown.clone();
    let metrics = tokio::spawn(async move {
        let stop = async move {
            metrics_shutdown.wait().await;
        };
        if let Err(e) = metrics_server::serve(&metrics_addr, metrics_health, stop).await {
            error!(addr = %metrics_addr, error = %e, "Admin endpoint failed");
        }
    });

    let server = ProxyServer::bind(config)
        .await
        .context("failed to start proxy")?;
    health.set_ready(true);

    let proxy_shutdown = shutdown.clone();
    let proxy_health = health.clone();
    server
        .run_until(async move {
            proxy_shutdown.wait().await;
            // Stop receiving new clients while sessions drain
            proxy_health.set_ready(false);
        })
        .await
        .context("proxy terminated with an error")?;

    shutdown.trigger(partmux_server::ShutdownSignal::Manual);
    let _ = metrics.await;
    info!("partmux proxy stopped");
    Ok(())
}
