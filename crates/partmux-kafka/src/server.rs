//! Proxy server
//!
//! TCP accept loop handing each client connection to its own session task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use partmux_observability::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL};

use crate::config::{ProxyConfig, ProxyState};
use crate::error::{ProxyError, ProxyResult};
use crate::session::run_session;

/// Counts a connection as active until dropped, aborted sessions included.
/// Holds a slot of the connection limit when one is configured.
struct ActiveConnection {
    _slot: Option<OwnedSemaphorePermit>,
}

impl ActiveConnection {
    fn open(slot: Option<OwnedSemaphorePermit>) -> Self {
        CONNECTIONS_ACTIVE.inc();
        Self { _slot: slot }
    }
}

/// Free connection slots; `None` when connections are unlimited
fn connection_slots(max_connections: usize) -> Option<Arc<Semaphore>> {
    (max_connections > 0).then(|| Arc::new(Semaphore::new(max_connections)))
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        CONNECTIONS_ACTIVE.dec();
    }
}

/// Partition-virtualizing Kafka proxy
pub struct ProxyServer;

impl ProxyServer {
    /// Validate `config` and bind the client listener
    pub async fn bind(config: ProxyConfig) -> ProxyResult<BoundProxyServer> {
        let state = Arc::new(ProxyState::new(config)?);
        let listener = TcpListener::bind(&state.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            %local_addr,
            virtual_partitions = state.mapping.virtual_partitions(),
            physical_partitions = state.mapping.physical_partitions(),
            topic_mappings = state.config.topic_mappings.len(),
            max_connections = state.config.max_connections,
            bootstrap_servers = ?state.config.bootstrap_servers,
            "Proxy listening"
        );

        Ok(BoundProxyServer { listener, state })
    }
}

/// Proxy server that has been bound to a port
pub struct BoundProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl BoundProxyServer {
    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        self.listener.local_addr().map_err(ProxyError::from)
    }

    pub fn state(&self) -> Arc<ProxyState> {
        self.state.clone()
    }

    /// Accept connections until `shutdown` completes, then let sessions
    /// drain their in-flight requests for up to the configured shutdown
    /// timeout before aborting them.
    pub async fn run_until<F>(self, shutdown: F) -> ProxyResult<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let slots = connection_slots(self.state.config.max_connections);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let slot = match &slots {
                                Some(slots) => match slots.clone().try_acquire_owned() {
                                    Ok(permit) => Some(permit),
                                    Err(_) => {
                                        CONNECTIONS_REJECTED_TOTAL.inc();
                                        warn!(
                                            client = %addr,
                                            max_connections = self.state.config.max_connections,
                                            "Connection limit reached, closing"
                                        );
                                        drop(stream);
                                        continue;
                                    }
                                },
                                None => None,
                            };
                            let state = self.state.clone();
                            let stop = stop_rx.clone();
                            sessions.spawn(async move {
                                let _active = ActiveConnection::open(slot);
                                match run_session(stream, addr, state, stop).await {
                                    Ok(()) | Err(ProxyError::ConnectionClosed) => {
                                        debug!(client = %addr, "Connection closed");
                                    }
                                    Err(e) => {
                                        warn!(client = %addr, error = %e, "Connection error");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = &mut shutdown => {
                    info!(sessions = sessions.len(), "Proxy shutting down");
                    break;
                }
            }
        }

        drop(self.listener);
        let _ = stop_tx.send(true);

        let drain_timeout = self.state.config.shutdown_timeout;
        let drained = tokio::time::timeout(drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                timeout_ms = drain_timeout.as_millis() as u64,
                "Sessions did not drain in time, aborting"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("Proxy stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_slots() {
        assert!(connection_slots(0).is_none());

        let slots = connection_slots(2).unwrap();
        let first = slots.clone().try_acquire_owned().unwrap();
        let _second = slots.clone().try_acquire_owned().unwrap();
        assert!(slots.clone().try_acquire_owned().is_err());

        drop(first);
        assert!(slots.try_acquire_owned().is_ok());
    }
}
