//! Operator error types
//!
//! ## Error Categories
//!
//! ### Configuration Errors
//! - `ConfigInvariantViolation`: V/P counts that cannot form a partition mapping
//! - `Validation`: any other spec field outside its allowed range
//!
//! Both mark the resource `Failed` and are retried only after a long delay,
//! since nothing changes until the resource is edited.
//!
//! ### Cluster Errors
//! - `Kube`: the API server rejected or failed a request
//! - `MissingObjectKey`: a resource arrived without a field the controller needs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Config invariant violated: {0}")]
    ConfigInvariantViolation(String),

    #[error("Invalid spec: {0}")]
    Validation(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// True for errors caused by the resource's own spec
    pub fn is_invalid_config(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvariantViolation(_) | Error::Validation(_)
        )
    }
}

impl From<partmux_core::Error> for Error {
    fn from(err: partmux_core::Error) -> Self {
        match err {
            partmux_core::Error::ConfigInvariantViolation(msg) => {
                Error::ConfigInvariantViolation(msg)
            }
            other => Error::Validation(other.to_string()),
        }
    }
}
