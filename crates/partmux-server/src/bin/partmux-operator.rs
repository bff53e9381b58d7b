//! partmux operator
//!
//! Watches `VirtualPartitionProxy` resources in every namespace and keeps a
//! proxy Deployment and Service running for each.
//!
//! ## Configuration
//!
//! - `PARTMUX_PROXY_IMAGE`: image used when a resource names none
//! - `PARTMUX_OPERATOR_METRICS_ADDR`: admin endpoint serving `/metrics`,
//!   `/healthz` and `/readyz` (default: 0.0.0.0:9091)
//! - `PARTMUX_LOG_FORMAT`: `json` for structured logs
//!
//! Cluster credentials come from the in-cluster service account or the local
//! kubeconfig.

use anyhow::Context;
use tracing::{error, info};

use partmux_observability::Health;
use partmux_operator::{controller, OperatorConfig};
use partmux_server::{metrics_server, telemetry, ShutdownHandle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    partmux_observability::init_metrics();

    let config = OperatorConfig::from_env();
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!(proxy_image = %config.proxy_image, "Starting partmux operator");

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

    health.set_ready(true);

    let controller_shutdown = shutdown.clone();
    controller::run(client, config, async move {
        controller_shutdown.wait().await;
    })
    .await;

    shutdown.trigger(partmux_server::ShutdownSignal::Manual);
    let _ = metrics.await;
    info!("partmux operator stopped");
    Ok(())
}
