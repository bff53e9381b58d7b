//! # partmux Kafka proxy
//!
//! A Kafka wire protocol proxy that presents every topic with V virtual
//! partitions while the physical cluster stores them in P physical
//! partitions. Unmodified Kafka clients connect to the proxy as if it were a
//! single broker.
//!
//! ## Supported APIs
//!
//! | API | Name | Handling |
//! |-----|------|----------|
//! | 18 | ApiVersions | Intersected with the backend's ranges |
//! | 3 | Metadata | Physical partitions expanded into virtual ones |
//! | 0 | Produce | Records tagged and merged per physical partition |
//! | 1 | Fetch | Physical records filtered per virtual partition |
//! | 2 | ListOffsets | Translated to virtual offsets |
//! | 10 | FindCoordinator | Coordinator address rewritten to the proxy |
//! | 8 | OffsetCommit | Stored under per-virtual-partition groups |
//! | 9 | OffsetFetch | Read from per-virtual-partition groups |
//! | 11-16, 22 | Group coordination, InitProducerId | Relayed unchanged |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use partmux_kafka::{ProxyConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::from_env()?;
//!     let server = ProxyServer::bind(config).await?;
//!     server.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod session;
pub mod types;

pub use backend::{BackendRouter, BrokerConnection};
pub use config::{ProxyConfig, ProxyState};
pub use error::{ErrorCode, ProxyError, ProxyResult};
pub use retry::RetryPolicy;
pub use server::{BoundProxyServer, ProxyServer};
pub use session::{ProxyRequest, ReorderBuffer, SessionContext};
pub use types::ApiKey;
