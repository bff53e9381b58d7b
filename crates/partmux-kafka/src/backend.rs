//! Connections to the physical Kafka cluster
//!
//! Each client session owns a [`BackendRouter`]. The router connects lazily
//! to brokers, learns partition leaders from Metadata and group or
//! transaction coordinators from FindCoordinator, and routes every backend
//! request accordingly.
//!
//! A [`BrokerConnection`] multiplexes concurrent requests over one TCP
//! connection: writes are serialized, and a reader task hands each response
//! to the waiting caller by correlation id.
//!
//! ```text
//!  session ──send()──► writer ──────────► broker
//!     ▲                                     │
//!     └──── oneshot ◄── pending[cid] ◄── reader task
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use partmux_core::PartitionKey;
use partmux_observability::metrics::BACKEND_CONNECTION_ERRORS_TOTAL;

use crate::codec::{KafkaCodec, RequestHeader};
use crate::config::ProxyConfig;
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::protocol::find_coordinator::Coordinator;
use crate::protocol::{
    decode_response, encode_request, FetchResponse, FindCoordinatorRequest, ListOffsetsResponse,
    MetadataRequest, MetadataResponse, OffsetCommitResponse, OffsetFetchResponse,
    ProduceResponse, RelayRequest, Request,
};
use crate::protocol::relay::RelayTarget;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::CoordinatorType;

type Pending = Arc<Mutex<HashMap<i32, oneshot::Sender<BytesMut>>>>;

/// One multiplexed connection to a broker
pub struct BrokerConnection {
    addr: String,
    client_id: String,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, KafkaCodec>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_correlation_id: AtomicI32,
    reader: JoinHandle<()>,
}

impl BrokerConnection {
    pub async fn connect(
        addr: &str,
        client_id: &str,
        connect_timeout: Duration,
    ) -> ProxyResult<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProxyError::BackendUnavailable(format!("connect to {} timed out", addr))
            })?
            .map_err(|e| ProxyError::BackendUnavailable(format!("connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_responses(
            addr.to_string(),
            FramedRead::new(read_half, KafkaCodec::new()),
            pending.clone(),
            closed.clone(),
        ));

        debug!(broker = %addr, "Connected to backend broker");

        Ok(Self {
            addr: addr.to_string(),
            client_id: client_id.to_string(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, KafkaCodec::new())),
            pending,
            closed,
            next_correlation_id: AtomicI32::new(1),
            reader,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_correlation_id(&self) -> i32 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    fn header<R: Request>(&self) -> ProxyResult<RequestHeader> {
        let api_version = R::API_KEY.backend_version().ok_or_else(|| {
            ProxyError::Protocol(format!("{} is never sent to brokers", R::API_KEY.name()))
        })?;
        Ok(RequestHeader {
            api_key: R::API_KEY.as_i16(),
            api_version,
            correlation_id: self.next_correlation_id(),
            client_id: Some(self.client_id.clone()),
        })
    }

    /// Send a request at its backend version and wait for the response
    pub async fn send<R: Request>(&self, request: &R) -> ProxyResult<R::Response> {
        let header = self.header::<R>()?;
        let payload = encode_request(&header, request);
        let mut frame = self.round_trip(header.correlation_id, payload).await?;

        let (correlation_id, response) =
            decode_response::<R::Response>(&mut frame, header.api_version)?;
        if correlation_id != header.correlation_id {
            return Err(ProxyError::Protocol(format!(
                "Broker {} answered correlation id {} for request {}",
                self.addr, correlation_id, header.correlation_id
            )));
        }
        Ok(response)
    }

    /// Send a request the broker does not answer (produce with acks=0)
    pub async fn send_oneway<R: Request>(&self, request: &R) -> ProxyResult<()> {
        let header = self.header::<R>()?;
        let payload = encode_request(&header, request);
        self.write(payload).await
    }

    /// Forward a client request body unchanged. The returned response frame
    /// carries the client's correlation id.
    pub async fn relay(&self, header: &RequestHeader, body: &Bytes) -> ProxyResult<BytesMut> {
        let correlation_id = self.next_correlation_id();
        let mut payload = BytesMut::with_capacity(body.len() + 64);
        RequestHeader {
            correlation_id,
            ..header.clone()
        }
        .encode(&mut payload);
        payload.extend_from_slice(body);

        let mut frame = self.round_trip(correlation_id, payload).await?;
        if frame.len() < 4 {
            return Err(ProxyError::Protocol(format!(
                "Broker {} sent a {} byte response",
                self.addr,
                frame.len()
            )));
        }
        frame[..4].copy_from_slice(&header.correlation_id.to_be_bytes());
        Ok(frame)
    }

    async fn round_trip(&self, correlation_id: i32, payload: BytesMut) -> ProxyResult<BytesMut> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        // The reader clears `pending` after setting `closed`, so one of the two
        // always observes the other.
        if self.is_closed() {
            self.pending.lock().remove(&correlation_id);
            return Err(ProxyError::ConnectionClosed);
        }

        if let Err(e) = self.write(payload).await {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        rx.await.map_err(|_| ProxyError::ConnectionClosed)
    }

    async fn write(&self, payload: BytesMut) -> ProxyResult<()> {
        if self.is_closed() {
            return Err(ProxyError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(payload).await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(
    addr: String,
    mut frames: FramedRead<tokio::net::tcp::OwnedReadHalf, KafkaCodec>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(broker = %addr, error = %e, "Backend connection failed");
                BACKEND_CONNECTION_ERRORS_TOTAL
                    .with_label_values(&[addr.as_str()])
                    .inc();
                break;
            }
        };
        if frame.len() < 4 {
            warn!(broker = %addr, "Backend response shorter than its header");
            break;
        }

        let correlation_id = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        match pending.lock().remove(&correlation_id) {
            Some(waiter) => {
                let _ = waiter.send(frame);
            }
            None => debug!(broker = %addr, correlation_id, "Dropping unexpected response"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
    debug!(broker = %addr, "Backend connection closed");
}

/// Error codes carried by a backend response
pub trait ResponseErrors {
    fn error_codes(&self) -> Vec<i16>;
}

impl ResponseErrors for ProduceResponse {
    fn error_codes(&self) -> Vec<i16> {
        self.responses
            .iter()
            .flat_map(|t| t.partitions.iter().map(|p| p.error_code))
            .collect()
    }
}

impl ResponseErrors for FetchResponse {
    fn error_codes(&self) -> Vec<i16> {
        std::iter::once(self.error_code)
            .chain(
                self.responses
                    .iter()
                    .flat_map(|t| t.partitions.iter().map(|p| p.error_code)),
            )
            .collect()
    }
}

impl ResponseErrors for ListOffsetsResponse {
    fn error_codes(&self) -> Vec<i16> {
        self.topics
            .iter()
            .flat_map(|t| t.partitions.iter().map(|p| p.error_code))
            .collect()
    }
}

impl ResponseErrors for OffsetCommitResponse {
    fn error_codes(&self) -> Vec<i16> {
        self.topics
            .iter()
            .flat_map(|t| t.partitions.iter().map(|p| p.error_code))
            .collect()
    }
}

impl ResponseErrors for OffsetFetchResponse {
    fn error_codes(&self) -> Vec<i16> {
        std::iter::once(self.error_code)
            .chain(
                self.topics
                    .iter()
                    .flat_map(|t| t.partitions.iter().map(|p| p.error_code)),
            )
            .collect()
    }
}

/// What the router knows about the physical cluster
#[derive(Debug, Default)]
struct ClusterView {
    /// node id -> `host:port`
    brokers: HashMap<i32, String>,
    /// physical partition -> leader node id
    leaders: HashMap<PartitionKey, i32>,
    /// (key type, key) -> coordinator `host:port`
    coordinators: HashMap<(CoordinatorType, String), String>,
    /// When leaders were last learned from a Metadata response
    refreshed_at: Option<Instant>,
}

impl ClusterView {
    /// Leaders older than `max_age` are re-learned before use. A zero
    /// `max_age` keeps them until a request proves them stale.
    fn leaders_expired(&self, max_age: Duration) -> bool {
        !max_age.is_zero() && self.refreshed_at.is_some_and(|at| at.elapsed() >= max_age)
    }
}

/// Routes backend requests for one client session
pub struct BackendRouter {
    bootstrap_servers: Vec<String>,
    client_id: String,
    connect_timeout: Duration,
    metadata_max_age: Duration,
    retry: RetryPolicy,
    connections: Mutex<HashMap<String, Arc<BrokerConnection>>>,
    cluster: RwLock<ClusterView>,
}

impl BackendRouter {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            client_id: config.client_id.clone(),
            connect_timeout: config.connect_timeout,
            metadata_max_age: config.metadata_refresh_interval,
            retry: config.retry.clone(),
            connections: Mutex::new(HashMap::new()),
            cluster: RwLock::new(ClusterView::default()),
        }
    }

    /// Open (or reuse) the connection to `addr`
    pub async fn connection(&self, addr: &str) -> ProxyResult<Arc<BrokerConnection>> {
        let existing = {
            let connections = self.connections.lock();
            connections.get(addr).filter(|c| !c.is_closed()).cloned()
        };
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let connected = BrokerConnection::connect(addr, &self.client_id, self.connect_timeout).await;
        let conn = match connected {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                BACKEND_CONNECTION_ERRORS_TOTAL
                    .with_label_values(&[addr])
                    .inc();
                return Err(e);
            }
        };

        let mut connections = self.connections.lock();
        let entry = connections
            .entry(addr.to_string())
            .or_insert_with(|| conn.clone());
        if entry.is_closed() {
            *entry = conn;
        }
        Ok(entry.clone())
    }

    fn drop_connection(&self, addr: &str) {
        self.connections.lock().remove(addr);
    }

    /// Send to one broker, discarding the connection if it broke
    pub async fn send_to<R: Request>(&self, addr: &str, request: &R) -> ProxyResult<R::Response> {
        let conn = self.connection(addr).await?;
        let result = conn.send(request).await;
        if let Err(e) = &result {
            if e.is_retriable() {
                self.drop_connection(addr);
            }
        }
        result
    }

    fn candidate_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.connections.lock().keys().cloned().collect();
        addrs.extend(self.bootstrap_servers.iter().cloned());
        addrs.extend(self.cluster.read().brokers.values().cloned());

        let mut seen = std::collections::HashSet::new();
        addrs.retain(|addr| seen.insert(addr.clone()));
        addrs
    }

    /// Send to whichever broker answers first, trying known brokers in turn
    pub async fn send_to_any<R: Request>(&self, request: &R) -> ProxyResult<R::Response> {
        retry_with_backoff(&self.retry, move || async move {
            let mut last_error = None;
            for addr in self.candidate_addrs() {
                match self.send_to(&addr, request).await {
                    Ok(response) => return Ok(response),
                    Err(e) if e.is_retriable() => {
                        debug!(broker = %addr, error = %e, "Broker unreachable, trying next");
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last_error.unwrap_or_else(|| {
                ProxyError::BackendUnavailable("no bootstrap servers configured".to_string())
            }))
        })
        .await
    }

    /// Fetch cluster metadata and refresh the broker and leader view
    pub async fn metadata(&self, request: &MetadataRequest) -> ProxyResult<MetadataResponse> {
        let response = self.send_to_any(request).await?;

        let mut cluster = self.cluster.write();
        cluster.refreshed_at = Some(Instant::now());
        for broker in &response.brokers {
            cluster
                .brokers
                .insert(broker.node_id, format!("{}:{}", broker.host, broker.port));
        }
        for topic in &response.topics {
            let Some(name) = &topic.name else { continue };
            if topic.error_code != ErrorCode::None.as_i16() {
                continue;
            }
            for partition in &topic.partitions {
                let key = PartitionKey::new(name.as_str(), partition.partition_index);
                if partition.leader_id >= 0 {
                    cluster.leaders.insert(key, partition.leader_id);
                } else {
                    cluster.leaders.remove(&key);
                }
            }
        }
        drop(cluster);

        Ok(response)
    }

    fn cached_leader(&self, key: &PartitionKey) -> Option<String> {
        let cluster = self.cluster.read();
        if cluster.leaders_expired(self.metadata_max_age) {
            return None;
        }
        cluster
            .leaders
            .get(key)
            .and_then(|node| cluster.brokers.get(node))
            .cloned()
    }

    /// Address of the broker leading `key`
    pub async fn leader_for(&self, key: &PartitionKey) -> ProxyResult<String> {
        if let Some(addr) = self.cached_leader(key) {
            return Ok(addr);
        }

        let response = self
            .metadata(&MetadataRequest::for_topics([key.topic.as_str()]))
            .await?;
        if let Some(topic) = response
            .topics
            .iter()
            .find(|t| t.name.as_deref() == Some(key.topic.as_str()))
        {
            if topic.error_code != ErrorCode::None.as_i16() {
                return Err(ProxyError::Backend(topic.error_code));
            }
            if !topic
                .partitions
                .iter()
                .any(|p| p.partition_index == key.partition)
            {
                return Err(ProxyError::Backend(
                    ErrorCode::UnknownTopicOrPartition.as_i16(),
                ));
            }
        }

        self.cached_leader(key).ok_or_else(|| {
            ProxyError::BackendUnavailable(format!(
                "no leader for {}-{}",
                key.topic, key.partition
            ))
        })
    }

    pub fn invalidate_leader(&self, key: &PartitionKey) {
        self.cluster.write().leaders.remove(key);
    }

    async fn send_to_leader_once<R: Request>(
        &self,
        key: &PartitionKey,
        request: &R,
    ) -> ProxyResult<R::Response> {
        retry_with_backoff(&self.retry, move || async move {
            let addr = self.leader_for(key).await?;
            self.send_to(&addr, request).await.inspect_err(|e| {
                if e.is_retriable() {
                    self.invalidate_leader(key);
                }
            })
        })
        .await
    }

    /// Send a single-partition request to the partition leader. A stale
    /// leader answer refreshes metadata and the request is sent once more.
    pub async fn send_to_leader<R>(
        &self,
        key: &PartitionKey,
        request: &R,
    ) -> ProxyResult<R::Response>
    where
        R: Request,
        R::Response: ResponseErrors,
    {
        let response = self.send_to_leader_once(key, request).await?;
        if !response
            .error_codes()
            .into_iter()
            .any(ErrorCode::is_stale_leader)
        {
            return Ok(response);
        }

        debug!(
            topic = %key.topic,
            partition = key.partition,
            "Stale partition leader, refreshing metadata"
        );
        self.invalidate_leader(key);
        self.send_to_leader_once(key, request).await
    }

    /// Look up a coordinator on the cluster, refreshing the cache
    pub async fn find_coordinator(
        &self,
        key: &str,
        key_type: CoordinatorType,
    ) -> ProxyResult<Coordinator> {
        let response = self
            .send_to_any(&FindCoordinatorRequest::new(key, key_type as i8))
            .await?;
        let coordinator = response.coordinators.into_iter().next().ok_or_else(|| {
            ProxyError::Protocol("FindCoordinator response without a coordinator".to_string())
        })?;

        let cache_key = (key_type, key.to_string());
        let mut cluster = self.cluster.write();
        if coordinator.error_code == ErrorCode::None.as_i16() {
            cluster.coordinators.insert(
                cache_key,
                format!("{}:{}", coordinator.host, coordinator.port),
            );
        } else {
            cluster.coordinators.remove(&cache_key);
        }
        drop(cluster);

        Ok(coordinator)
    }

    /// Address of the coordinator for `key`
    pub async fn coordinator_for(
        &self,
        key: &str,
        key_type: CoordinatorType,
    ) -> ProxyResult<String> {
        let cached = self
            .cluster
            .read()
            .coordinators
            .get(&(key_type, key.to_string()))
            .cloned();
        if let Some(addr) = cached {
            return Ok(addr);
        }

        let coordinator = self.find_coordinator(key, key_type).await?;
        if coordinator.error_code != ErrorCode::None.as_i16() {
            return Err(ProxyError::Backend(coordinator.error_code));
        }
        Ok(format!("{}:{}", coordinator.host, coordinator.port))
    }

    pub fn invalidate_coordinator(&self, key: &str, key_type: CoordinatorType) {
        self.cluster
            .write()
            .coordinators
            .remove(&(key_type, key.to_string()));
    }

    async fn send_to_coordinator_once<R: Request>(
        &self,
        key: &str,
        key_type: CoordinatorType,
        request: &R,
    ) -> ProxyResult<R::Response> {
        retry_with_backoff(&self.retry, move || async move {
            let addr = self.coordinator_for(key, key_type).await?;
            self.send_to(&addr, request).await.inspect_err(|e| {
                if e.is_retriable() {
                    self.invalidate_coordinator(key, key_type);
                }
            })
        })
        .await
    }

    /// Send a request to the coordinator for `key`. A stale coordinator
    /// answer forgets the cached coordinator and the request is sent once more.
    pub async fn send_to_coordinator<R>(
        &self,
        key: &str,
        key_type: CoordinatorType,
        request: &R,
    ) -> ProxyResult<R::Response>
    where
        R: Request,
        R::Response: ResponseErrors,
    {
        let response = self.send_to_coordinator_once(key, key_type, request).await?;
        if !response
            .error_codes()
            .into_iter()
            .any(ErrorCode::is_stale_coordinator)
        {
            return Ok(response);
        }

        debug!(key, ?key_type, "Stale coordinator, looking it up again");
        self.invalidate_coordinator(key, key_type);
        self.send_to_coordinator_once(key, key_type, request).await
    }

    /// Forward a group coordination request body unchanged
    pub async fn relay(&self, relay: &RelayRequest) -> ProxyResult<BytesMut> {
        retry_with_backoff(&self.retry, move || async move {
            match &relay.target {
                RelayTarget::Coordinator { key, key_type } => {
                    let addr = self.coordinator_for(key, *key_type).await?;
                    let conn = self.connection(&addr).await?;
                    conn.relay(&relay.header, &relay.body).await.inspect_err(|e| {
                        if e.is_retriable() {
                            self.drop_connection(&addr);
                            self.invalidate_coordinator(key, *key_type);
                        }
                    })
                }
                RelayTarget::AnyBroker => {
                    let mut last_error = None;
                    for addr in self.candidate_addrs() {
                        let result = match self.connection(&addr).await {
                            Ok(conn) => conn.relay(&relay.header, &relay.body).await,
                            Err(e) => Err(e),
                        };
                        match result {
                            Ok(frame) => return Ok(frame),
                            Err(e) if e.is_retriable() => {
                                self.drop_connection(&addr);
                                last_error = Some(e);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(last_error.unwrap_or_else(|| {
                        ProxyError::BackendUnavailable(
                            "no bootstrap servers configured".to_string(),
                        )
                    }))
                }
            }
        })
        .await
    }

    /// Send a request the broker never answers to `addr`
    pub async fn send_oneway_to<R: Request>(&self, addr: &str, request: &R) -> ProxyResult<()> {
        let conn = self.connection(addr).await?;
        conn.send_oneway(request).await.inspect_err(|e| {
            if e.is_retriable() {
                self.drop_connection(addr);
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn router(metadata_max_age: Duration) -> BackendRouter {
        BackendRouter::new(&ProxyConfig {
            metadata_refresh_interval: metadata_max_age,
            ..ProxyConfig::default()
        })
    }

    fn learn_leader(router: &BackendRouter, key: &PartitionKey, refreshed_at: Instant) {
        let mut cluster = router.cluster.write();
        cluster.brokers.insert(1, "kafka-1:9092".to_string());
        cluster.leaders.insert(key.clone(), 1);
        cluster.refreshed_at = Some(refreshed_at);
    }

    #[test]
    fn test_fresh_leaders_are_served_from_cache() {
        let router = router(Duration::from_secs(30));
        let key = PartitionKey::new("orders", 4);
        learn_leader(&router, &key, Instant::now());
        assert_eq!(router.cached_leader(&key).as_deref(), Some("kafka-1:9092"));
    }

    #[test]
    fn test_leaders_expire_after_refresh_interval() {
        let router = router(Duration::from_millis(50));
        let key = PartitionKey::new("orders", 4);
        learn_leader(&router, &key, Instant::now() - Duration::from_millis(100));
        assert_eq!(router.cached_leader(&key), None);
    }

    #[test]
    fn test_zero_interval_never_expires() {
        let router = router(Duration::ZERO);
        let key = PartitionKey::new("orders", 4);
        let long_ago = Instant::now()
            .checked_sub(Duration::from_secs(3600))
            .unwrap_or_else(Instant::now);
        learn_leader(&router, &key, long_ago);
        assert_eq!(router.cached_leader(&key).as_deref(), Some("kafka-1:9092"));
    }
}
