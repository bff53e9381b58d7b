//! Process plumbing shared by the `partmux-proxy` and `partmux-operator`
//! binaries: logging setup, signal handling and the metrics endpoint.

pub mod metrics_server;
pub mod shutdown;
pub mod telemetry;

pub use shutdown::{ShutdownHandle, ShutdownSignal};
