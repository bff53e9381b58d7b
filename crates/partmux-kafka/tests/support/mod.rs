//! In-process Kafka broker and raw protocol client for proxy tests.
//!
//! The broker speaks exactly the API versions the proxy uses on its backend
//! side and keeps every partition log in memory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use partmux_core::{decode_batches, encode_batches, Record, RecordBatch};
use partmux_kafka::codec::{KafkaCodec, RequestHeader};
use partmux_kafka::protocol::fetch::{FetchPartition, FetchPartitionResponse, FetchTopicResponse};
use partmux_kafka::protocol::find_coordinator::Coordinator;
use partmux_kafka::protocol::list_offsets::{
    ListOffsetsPartition, ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use partmux_kafka::protocol::metadata::{MetadataBroker, MetadataPartition, MetadataTopic};
use partmux_kafka::protocol::offset_commit::{
    OffsetCommitPartitionResponse, OffsetCommitTopicResponse,
};
use partmux_kafka::protocol::offset_fetch::{OffsetFetchPartitionResponse, OffsetFetchTopicResponse};
use partmux_kafka::protocol::produce::{
    ProducePartitionData, ProducePartitionResponse, ProduceTopicResponse,
};
use partmux_kafka::protocol::{
    decode_response, encode_request, encode_response, ApiVersionsResponse, FetchRequest,
    FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse, ListOffsetsRequest,
    ListOffsetsResponse, Message, MetadataRequest, MetadataResponse, OffsetCommitRequest,
    OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse, ProduceRequest,
    ProduceResponse, Request,
};
use partmux_kafka::types::{supported_api_versions, ApiKey, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};
use partmux_kafka::{ProxyConfig, ProxyError, ProxyResult, ProxyServer, RetryPolicy};

pub const BROKER_ID: i32 = 1;

// ============================================================================
// Fake broker
// ============================================================================

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, i32>,
    logs: HashMap<(String, i32), Vec<RecordBatch>>,
    commits: HashMap<(String, String, i32), (i64, Option<String>)>,
}

fn log_end(log: &[RecordBatch]) -> i64 {
    log.last().map(|b| b.next_offset()).unwrap_or(0)
}

impl BrokerState {
    fn has_partition(&self, topic: &str, partition: i32) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|&count| partition >= 0 && partition < count)
    }

    fn log(&self, topic: &str, partition: i32) -> &[RecordBatch] {
        self.logs
            .get(&(topic.to_string(), partition))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn metadata(&self, addr: SocketAddr, request: &MetadataRequest) -> MetadataResponse {
        let names = request
            .topic_names()
            .unwrap_or_else(|| self.topics.keys().cloned().collect());

        let topics = names
            .into_iter()
            .map(|name| {
                let (error_code, partitions) = match self.topics.get(&name) {
                    Some(&count) => (
                        0,
                        (0..count)
                            .map(|index| MetadataPartition {
                                error_code: 0,
                                partition_index: index,
                                leader_id: BROKER_ID,
                                leader_epoch: 0,
                                replica_nodes: vec![BROKER_ID],
                                isr_nodes: vec![BROKER_ID],
                                offline_replicas: Vec::new(),
                            })
                            .collect(),
                    ),
                    None => (3, Vec::new()),
                };
                MetadataTopic {
                    error_code,
                    name: Some(name),
                    topic_id: [0; 16],
                    is_internal: false,
                    partitions,
                    topic_authorized_operations: i32::MIN,
                }
            })
            .collect();

        MetadataResponse {
            throttle_time_ms: 0,
            brokers: vec![MetadataBroker {
                node_id: BROKER_ID,
                host: addr.ip().to_string(),
                port: addr.port() as i32,
                rack: None,
            }],
            cluster_id: Some("fake-cluster".to_string()),
            controller_id: BROKER_ID,
            topics,
            cluster_authorized_operations: i32::MIN,
        }
    }

    fn produce(&mut self, request: &ProduceRequest) -> ProduceResponse {
        ProduceResponse {
            responses: request
                .topics
                .iter()
                .map(|topic| ProduceTopicResponse {
                    name: topic.name.clone(),
                    partitions: topic
                        .partitions
                        .iter()
                        .map(|data| self.append(&topic.name, data))
                        .collect(),
                })
                .collect(),
            throttle_time_ms: 0,
        }
    }

    fn append(&mut self, topic: &str, data: &ProducePartitionData) -> ProducePartitionResponse {
        if !self.has_partition(topic, data.index) {
            return ProducePartitionResponse::error(data.index, 3);
        }
        let batches = match data.records.clone().map(decode_batches).transpose() {
            Ok(batches) => batches.unwrap_or_default(),
            Err(_) => return ProducePartitionResponse::error(data.index, 2),
        };

        let log = self.logs.entry((topic.to_string(), data.index)).or_default();
        let base_offset = log_end(log);
        let mut next = base_offset;
        for mut batch in batches {
            let shift = next - batch.base_offset;
            batch.base_offset += shift;
            for record in &mut batch.records {
                record.offset += shift;
            }
            next = batch.next_offset();
            log.push(batch);
        }

        ProducePartitionResponse {
            base_offset,
            log_start_offset: 0,
            ..ProducePartitionResponse::error(data.index, 0)
        }
    }

    fn fetch(&self, request: &FetchRequest) -> FetchResponse {
        FetchResponse {
            throttle_time_ms: 0,
            error_code: 0,
            session_id: 0,
            responses: request
                .topics
                .iter()
                .map(|topic| FetchTopicResponse {
                    topic: topic.topic.clone(),
                    partitions: topic
                        .partitions
                        .iter()
                        .map(|p| self.read(&topic.topic, p))
                        .collect(),
                })
                .collect(),
        }
    }

    fn read(&self, topic: &str, partition: &FetchPartition) -> FetchPartitionResponse {
        if !self.has_partition(topic, partition.partition) {
            return FetchPartitionResponse::error(partition.partition, 3);
        }
        let log = self.log(topic, partition.partition);
        let end = log_end(log);
        if partition.fetch_offset < 0 || partition.fetch_offset > end {
            return FetchPartitionResponse::error(partition.partition, 1);
        }

        let batches: Vec<RecordBatch> = log
            .iter()
            .filter(|b| b.next_offset() > partition.fetch_offset)
            .cloned()
            .collect();

        FetchPartitionResponse {
            high_watermark: end,
            last_stable_offset: end,
            log_start_offset: 0,
            aborted_transactions: Some(Vec::new()),
            records: Some(encode_batches(&batches).unwrap_or_default()),
            ..FetchPartitionResponse::error(partition.partition, 0)
        }
    }

    fn list_offsets(&self, request: &ListOffsetsRequest) -> ListOffsetsResponse {
        ListOffsetsResponse {
            throttle_time_ms: 0,
            topics: request
                .topics
                .iter()
                .map(|topic| ListOffsetsTopicResponse {
                    name: topic.name.clone(),
                    partitions: topic
                        .partitions
                        .iter()
                        .map(|p| self.offset_for(&topic.name, p))
                        .collect(),
                })
                .collect(),
        }
    }

    fn offset_for(&self, topic: &str, p: &ListOffsetsPartition) -> ListOffsetsPartitionResponse {
        if !self.has_partition(topic, p.partition_index) {
            return ListOffsetsPartitionResponse::error(p.partition_index, 3);
        }
        let log = self.log(topic, p.partition_index);
        let (timestamp, offset) = match p.timestamp {
            LATEST_TIMESTAMP => (-1, log_end(log)),
            EARLIEST_TIMESTAMP => (-1, 0),
            target => log
                .iter()
                .flat_map(|b| b.records.iter())
                .find(|r| r.timestamp >= target)
                .map(|r| (r.timestamp, r.offset))
                .unwrap_or((-1, -1)),
        };
        ListOffsetsPartitionResponse {
            timestamp,
            offset,
            ..ListOffsetsPartitionResponse::error(p.partition_index, 0)
        }
    }

    fn commit(&mut self, request: &OffsetCommitRequest) -> OffsetCommitResponse {
        let topics = request
            .topics
            .iter()
            .map(|topic| OffsetCommitTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| {
                        self.commits.insert(
                            (request.group_id.clone(), topic.name.clone(), p.partition_index),
                            (p.committed_offset, p.committed_metadata.clone()),
                        );
                        OffsetCommitPartitionResponse {
                            partition_index: p.partition_index,
                            error_code: 0,
                        }
                    })
                    .collect(),
            })
            .collect();
        OffsetCommitResponse {
            throttle_time_ms: 0,
            topics,
        }
    }

    fn offset_fetch(&self, request: &OffsetFetchRequest) -> OffsetFetchResponse {
        let topics = request
            .topics
            .iter()
            .flatten()
            .map(|topic| OffsetFetchTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partition_indexes
                    .iter()
                    .map(|&p| {
                        let key = (request.group_id.clone(), topic.name.clone(), p);
                        match self.commits.get(&key) {
                            Some((offset, metadata)) => OffsetFetchPartitionResponse {
                                committed_offset: *offset,
                                metadata: metadata.clone(),
                                ..OffsetFetchPartitionResponse::error(p, 0)
                            },
                            None => OffsetFetchPartitionResponse::error(p, 0),
                        }
                    })
                    .collect(),
            })
            .collect();
        OffsetFetchResponse {
            throttle_time_ms: 0,
            topics,
            error_code: 0,
        }
    }
}

/// Single-node broker serving from memory
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(topics: &[(&str, i32)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = listener.local_addr().expect("broker addr");
        let state = Arc::new(Mutex::new(BrokerState {
            topics: topics.iter().map(|(name, count)| (name.to_string(), *count)).collect(),
            ..BrokerState::default()
        }));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, addr, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Records stored in one physical partition, in log order
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        self.state
            .lock()
            .log(topic, partition)
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .commits
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|(offset, _)| *offset)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, addr: SocketAddr, state: Arc<Mutex<BrokerState>>) {
    let mut framed = Framed::new(stream, KafkaCodec::new());
    while let Some(Ok(mut frame)) = framed.next().await {
        let Ok(header) = RequestHeader::parse(&mut frame) else {
            return;
        };
        match respond(&state, addr, &header, &mut frame) {
            Ok(Some(response)) => {
                if framed.send(response).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(_) => return,
        }
    }
}

fn respond(
    state: &Mutex<BrokerState>,
    addr: SocketAddr,
    header: &RequestHeader,
    body: &mut BytesMut,
) -> ProxyResult<Option<BytesMut>> {
    let version = header.api_version;
    let cid = header.correlation_id;
    let response = match ApiKey::from_i16(header.api_key) {
        Some(ApiKey::ApiVersions) => {
            let response = ApiVersionsResponse {
                error_code: 0,
                api_keys: supported_api_versions(),
                throttle_time_ms: 0,
            };
            encode_response(cid, version, &response)
        }
        Some(ApiKey::Metadata) => {
            let request = MetadataRequest::read(body, version)?;
            encode_response(cid, version, &state.lock().metadata(addr, &request))
        }
        Some(ApiKey::Produce) => {
            let request = ProduceRequest::read(body, version)?;
            let response = state.lock().produce(&request);
            if request.acks == 0 {
                return Ok(None);
            }
            encode_response(cid, version, &response)
        }
        Some(ApiKey::Fetch) => {
            let request = FetchRequest::read(body, version)?;
            encode_response(cid, version, &state.lock().fetch(&request))
        }
        Some(ApiKey::ListOffsets) => {
            let request = ListOffsetsRequest::read(body, version)?;
            encode_response(cid, version, &state.lock().list_offsets(&request))
        }
        Some(ApiKey::FindCoordinator) => {
            let request = FindCoordinatorRequest::read(body, version)?;
            let response = FindCoordinatorResponse {
                throttle_time_ms: 0,
                coordinators: request
                    .keys
                    .iter()
                    .map(|key| Coordinator {
                        key: key.clone(),
                        node_id: BROKER_ID,
                        host: addr.ip().to_string(),
                        port: addr.port() as i32,
                        error_code: 0,
                        error_message: None,
                    })
                    .collect(),
            };
            encode_response(cid, version, &response)
        }
        Some(ApiKey::OffsetCommit) => {
            let request = OffsetCommitRequest::read(body, version)?;
            encode_response(cid, version, &state.lock().commit(&request))
        }
        Some(ApiKey::OffsetFetch) => {
            let request = OffsetFetchRequest::read(body, version)?;
            encode_response(cid, version, &state.lock().offset_fetch(&request))
        }
        _ => {
            return Err(ProxyError::UnsupportedProtocol {
                api_key: header.api_key,
                api_version: version,
            })
        }
    };
    Ok(Some(response))
}

// ============================================================================
// Proxy under test
// ============================================================================

/// Proxy running on a background task
pub struct RunningProxy {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<ProxyResult<()>>,
}

impl RunningProxy {
    pub async fn spawn(config: ProxyConfig) -> Self {
        let server = ProxyServer::bind(config).await.expect("proxy binds");
        let addr = server.local_addr().expect("proxy addr");
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));

        Self {
            addr,
            stop: Some(stop),
            task,
        }
    }

    pub async fn client(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let result = (&mut self.task).await.expect("proxy task joins");
        assert!(result.is_ok(), "proxy stopped with {:?}", result);
    }
}

/// Proxy settings for tests: loopback addresses, short timeouts
pub fn test_config(
    backend: SocketAddr,
    virtual_partitions: i32,
    physical_partitions: i32,
) -> ProxyConfig {
    ProxyConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        advertised_host: "127.0.0.1".to_string(),
        node_id: 0,
        bootstrap_servers: vec![backend.to_string()],
        virtual_partitions,
        physical_partitions,
        request_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..RetryPolicy::default()
        },
        shutdown_timeout: Duration::from_secs(1),
        ..ProxyConfig::default()
    }
}

/// Proxy in front of a [`FakeBroker`]
pub struct TestProxy {
    pub addr: SocketAddr,
    pub broker: FakeBroker,
    proxy: RunningProxy,
}

impl TestProxy {
    pub async fn start(
        virtual_partitions: i32,
        physical_partitions: i32,
        topics: &[(&str, i32)],
    ) -> Self {
        let broker = FakeBroker::start(topics).await;
        let config = test_config(broker.addr(), virtual_partitions, physical_partitions);
        let proxy = RunningProxy::spawn(config).await;
        Self {
            addr: proxy.addr,
            broker,
            proxy,
        }
    }

    pub async fn client(&self) -> TestClient {
        self.proxy.client().await
    }

    pub async fn shutdown(self) {
        self.proxy.shutdown().await;
    }
}

// ============================================================================
// Unresponsive broker
// ============================================================================

/// Broker that accepts connections and reads requests but never answers.
/// Reports each connection the proxy closes.
pub struct SilentBroker {
    addr: SocketAddr,
    closed: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    task: JoinHandle<()>,
}

impl SilentBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = listener.local_addr().expect("broker addr");
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let closed = closed_tx.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, KafkaCodec::new());
                    while let Some(Ok(_)) = framed.next().await {}
                    let _ = closed.send(());
                });
            }
        });

        Self {
            addr,
            closed: tokio::sync::Mutex::new(closed_rx),
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait up to `timeout` for the proxy to close one backend connection
    pub async fn connection_closed_within(&self, timeout: Duration) -> bool {
        let mut closed = self.closed.lock().await;
        matches!(tokio::time::timeout(timeout, closed.recv()).await, Ok(Some(())))
    }
}

impl Drop for SilentBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Client
// ============================================================================

/// Minimal Kafka client speaking explicit API versions
pub struct TestClient {
    framed: Framed<TcpStream, KafkaCodec>,
    correlation_id: i32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to proxy");
        Self {
            framed: Framed::new(stream, KafkaCodec::new()),
            correlation_id: 0,
        }
    }

    fn header(&mut self, api_key: i16, api_version: i16) -> RequestHeader {
        self.correlation_id += 1;
        RequestHeader {
            api_key,
            api_version,
            correlation_id: self.correlation_id,
            client_id: Some("partmux-test".to_string()),
        }
    }

    /// Send `request` at `version` without waiting, returning its correlation id
    pub async fn send<R: Request>(&mut self, version: i16, request: &R) -> i32 {
        let header = self.header(R::API_KEY.as_i16(), version);
        self.framed
            .send(encode_request(&header, request))
            .await
            .expect("request sent");
        header.correlation_id
    }

    /// Send `request` at `version` and wait for its response
    pub async fn call<R: Request>(&mut self, version: i16, request: &R) -> R::Response {
        let correlation_id = self.send(version, request).await;
        let mut frame = self.next_frame().await.expect("response frame");
        let (response_id, response) =
            decode_response::<R::Response>(&mut frame, version).expect("response decodes");
        assert_eq!(response_id, correlation_id);
        response
    }

    /// Send a header followed by an arbitrary body, returning its correlation id
    pub async fn send_raw(&mut self, api_key: i16, api_version: i16, body: &[u8]) -> i32 {
        let header = self.header(api_key, api_version);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(body);
        self.framed.send(buf).await.expect("request sent");
        header.correlation_id
    }

    /// Next response frame, or `None` once the proxy closed the connection
    pub async fn next_frame(&mut self) -> Option<BytesMut> {
        match tokio::time::timeout(Duration::from_secs(10), self.framed.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            Ok(_) => None,
            Err(_) => panic!("timed out waiting for a response"),
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Uncompressed batch holding `values` with relative offsets from 0
pub fn batch(values: &[&str]) -> Bytes {
    let records = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            Record::new(
                i as i64,
                1_700_000_000_000 + i as i64,
                None,
                Some(Bytes::copy_from_slice(v.as_bytes())),
            )
        })
        .collect();
    encode_batches(&[RecordBatch::new(records)]).expect("batch encodes")
}

/// Values of every record in a fetched records field
pub fn values(records: &Option<Bytes>) -> Vec<(i64, String)> {
    let Some(data) = records else {
        return Vec::new();
    };
    decode_batches(data.clone())
        .expect("records decode")
        .into_iter()
        .flat_map(|b| b.records.into_iter())
        .map(|r| {
            let value = r.value.map(|v| String::from_utf8_lossy(&v).into_owned());
            (r.offset, value.unwrap_or_default())
        })
        .collect()
}
