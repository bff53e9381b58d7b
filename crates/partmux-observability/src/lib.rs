//! partmux observability
//!
//! Prometheus metrics for the proxy and the operator, exported over HTTP
//! next to liveness and readiness endpoints.
//!
//! # Usage
//!
//! ```no_run
//! use partmux_observability::{exporter, metrics, Health};
//!
//! // Register every metric with the global registry
//! metrics::init();
//!
//! // Serve GET /metrics, /healthz and /readyz
//! let health = Health::new();
//! let admin_router = exporter::admin_router(health.clone());
//! health.set_ready(true);
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::{admin_router, Health};
pub use metrics::{init as init_metrics, REGISTRY};
