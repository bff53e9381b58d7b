//! Shutdown coordination
//!
//! A [`ShutdownHandle`] fans one signal out to every server in the process:
//! the proxy or controller loop and the metrics endpoint all wait on clones
//! of the same handle.

use std::fmt;

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    SigInt,
    SigTerm,
    Manual,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Clone)]
pub struct ShutdownHandle {
    sender: watch::Sender<Option<ShutdownSignal>>,
    receiver: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self { sender, receiver }
    }

    /// Signal shutdown; the first signal wins
    pub fn trigger(&self, signal: ShutdownSignal) {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Resolve once shutdown has been signalled
    pub async fn wait(mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.receiver.borrow() {
                return signal;
            }
            if self.receiver.changed().await.is_err() {
                return ShutdownSignal::Manual;
            }
        }
    }

    /// Trigger this handle when the process receives SIGINT or SIGTERM
    pub fn listen_for_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            match os_signal().await {
                Ok(signal) => {
                    info!(%signal, "Received signal, shutting down");
                    handle.trigger(signal);
                }
                Err(e) => warn!(error = %e, "Failed to install signal handlers"),
            }
        });
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn os_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| ShutdownSignal::SigInt),
        _ = terminate.recv() => Ok(ShutdownSignal::SigTerm),
    }
}

#[cfg(not(unix))]
async fn os_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::SigInt)
}
