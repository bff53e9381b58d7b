//! Client sessions
//!
//! A session owns one client connection. Requests are read, parsed and
//! handed to their handler as soon as they arrive, so several requests of
//! one client can wait on the backend at the same time. Kafka clients expect
//! responses in request order, so completed responses pass through a
//! [`ReorderBuffer`] before they are written.
//!
//! ```text
//!  client ──► reader ──► admit(seq) ──► handler futures (unordered)
//!                                              │
//!  client ◄── writer ◄── pop_ready() ◄── complete(seq)
//! ```
//!
//! The number of admitted but unanswered requests is bounded by
//! `max_in_flight`; once reached, the session stops reading until the oldest
//! response is written.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use futures::stream::FuturesUnordered;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument, warn};

use partmux_observability::metrics::{
    BYTES_PROXIED_TOTAL, REQUESTS_TOTAL, REQUEST_LATENCY, REQUEST_TIMEOUTS_TOTAL,
};

use crate::backend::BackendRouter;
use crate::codec::{KafkaCodec, RequestHeader};
use crate::config::ProxyState;
use crate::error::{ErrorCode, ProxyError, ProxyResult};
use crate::handlers;
use crate::protocol::{
    encode_response, ApiVersionsRequest, ApiVersionsResponse, FetchRequest,
    FindCoordinatorRequest, ListOffsetsRequest, Message, MetadataRequest, OffsetCommitRequest,
    OffsetFetchRequest, ProduceRequest, RelayRequest,
};
use crate::types::{supported_api_versions, ApiKey};

/// Everything a handler needs: the process-wide state and the session's
/// own backend connections
pub struct SessionContext {
    pub state: Arc<ProxyState>,
    pub backend: BackendRouter,
}

impl SessionContext {
    pub fn new(state: Arc<ProxyState>) -> Self {
        let backend = BackendRouter::new(&state.config);
        Self { state, backend }
    }
}

// ============================================================================
// Reorder buffer
// ============================================================================

/// Restores receipt order for responses that complete out of order.
///
/// Requests are keyed by an admission sequence number rather than the
/// client's correlation id, which clients are free to reuse.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next_seq: u64,
    next_to_send: u64,
    completed: BTreeMap<u64, Option<BytesMut>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next position in the response order
    pub fn admit(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Store the response for `seq`. `None` marks a request that gets no
    /// response (`acks=0` produce) but still holds its position.
    pub fn complete(&mut self, seq: u64, response: Option<BytesMut>) {
        self.completed.insert(seq, response);
    }

    /// Remove every response whose predecessors have all completed
    pub fn pop_ready(&mut self) -> Vec<BytesMut> {
        let mut ready = Vec::new();
        while let Some(response) = self.completed.remove(&self.next_to_send) {
            self.next_to_send += 1;
            ready.extend(response);
        }
        ready
    }

    /// Requests admitted but not yet released
    pub fn in_flight(&self) -> usize {
        (self.next_seq - self.next_to_send) as usize
    }
}

// ============================================================================
// Request dispatch
// ============================================================================

/// A parsed client request
#[derive(Debug)]
pub enum ProxyRequest {
    ApiVersions(ApiVersionsRequest),
    Metadata(MetadataRequest),
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    ListOffsets(ListOffsetsRequest),
    FindCoordinator(FindCoordinatorRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
    Relay(RelayRequest),
}

impl ProxyRequest {
    /// Decode a request body. Unknown APIs and versions outside the
    /// supported ranges fail with [`ProxyError::UnsupportedProtocol`].
    pub fn parse(header: &RequestHeader, mut body: BytesMut) -> ProxyResult<Self> {
        let unsupported = || ProxyError::UnsupportedProtocol {
            api_key: header.api_key,
            api_version: header.api_version,
        };
        let api_key = ApiKey::from_i16(header.api_key).ok_or_else(unsupported)?;
        if !api_key.supports(header.api_version) {
            return Err(unsupported());
        }

        let version = header.api_version;
        let request = match api_key {
            ApiKey::ApiVersions => Self::ApiVersions(ApiVersionsRequest::read(&mut body, version)?),
            ApiKey::Metadata => Self::Metadata(MetadataRequest::read(&mut body, version)?),
            ApiKey::Produce => Self::Produce(ProduceRequest::read(&mut body, version)?),
            ApiKey::Fetch => Self::Fetch(FetchRequest::read(&mut body, version)?),
            ApiKey::ListOffsets => Self::ListOffsets(ListOffsetsRequest::read(&mut body, version)?),
            ApiKey::FindCoordinator => {
                Self::FindCoordinator(FindCoordinatorRequest::read(&mut body, version)?)
            }
            ApiKey::OffsetCommit => {
                Self::OffsetCommit(OffsetCommitRequest::read(&mut body, version)?)
            }
            ApiKey::OffsetFetch => Self::OffsetFetch(OffsetFetchRequest::read(&mut body, version)?),
            ApiKey::JoinGroup
            | ApiKey::Heartbeat
            | ApiKey::LeaveGroup
            | ApiKey::SyncGroup
            | ApiKey::DescribeGroups
            | ApiKey::ListGroups
            | ApiKey::InitProducerId => {
                Self::Relay(RelayRequest::parse(api_key, header.clone(), body)?)
            }
        };
        Ok(request)
    }

    pub fn api_key(&self) -> ApiKey {
        match self {
            Self::ApiVersions(_) => ApiKey::ApiVersions,
            Self::Metadata(_) => ApiKey::Metadata,
            Self::Produce(_) => ApiKey::Produce,
            Self::Fetch(_) => ApiKey::Fetch,
            Self::ListOffsets(_) => ApiKey::ListOffsets,
            Self::FindCoordinator(_) => ApiKey::FindCoordinator,
            Self::OffsetCommit(_) => ApiKey::OffsetCommit,
            Self::OffsetFetch(_) => ApiKey::OffsetFetch,
            Self::Relay(relay) => relay.api_key,
        }
    }

    /// Run the request against the backend and encode the response frame.
    ///
    /// `Ok(None)` means the client expects no response. An `Err` is fatal to
    /// the connection.
    pub async fn dispatch(
        &self,
        ctx: &SessionContext,
        header: &RequestHeader,
    ) -> ProxyResult<Option<BytesMut>> {
        let frame = match self {
            Self::ApiVersions(_) => encode(header, &handlers::handle_api_versions(ctx).await),
            Self::Metadata(request) => match handlers::handle_metadata(ctx, request).await {
                Ok(response) => encode(header, &response),
                Err(e) => return self.error_response(ctx, header, e),
            },
            Self::Produce(request) => match handlers::handle_produce(ctx, request).await {
                Ok(Some(response)) => encode(header, &response),
                Ok(None) => return Ok(None),
                Err(e) => return self.error_response(ctx, header, e),
            },
            Self::Fetch(request) => encode(header, &handlers::handle_fetch(ctx, request).await),
            Self::ListOffsets(request) => {
                encode(header, &handlers::handle_list_offsets(ctx, request).await)
            }
            Self::FindCoordinator(request) => {
                encode(header, &handlers::handle_find_coordinator(ctx, request).await)
            }
            Self::OffsetCommit(request) => {
                encode(header, &handlers::handle_offset_commit(ctx, request).await)
            }
            Self::OffsetFetch(request) => {
                encode(header, &handlers::handle_offset_fetch(ctx, request).await)
            }
            Self::Relay(relay) => ctx.backend.relay(relay).await?,
        };
        Ok(Some(frame))
    }

    /// Answer the request with the error code for `error`.
    ///
    /// Connection-level errors are returned as is, as are failures of relayed
    /// requests, whose response layout the proxy does not know.
    pub fn error_response(
        &self,
        ctx: &SessionContext,
        header: &RequestHeader,
        error: ProxyError,
    ) -> ProxyResult<Option<BytesMut>> {
        if error.closes_connection() {
            return Err(error);
        }
        let code = error.error_code();

        let frame = match self {
            Self::ApiVersions(_) => encode(
                header,
                &ApiVersionsResponse {
                    error_code: code,
                    api_keys: supported_api_versions(),
                    throttle_time_ms: 0,
                },
            ),
            Self::Metadata(request) => encode(
                header,
                &handlers::metadata::error_response(&ctx.state.config, request, code),
            ),
            Self::Produce(request) => match handlers::produce::error_response(request, code) {
                Some(response) => encode(header, &response),
                None => return Ok(None),
            },
            Self::Fetch(request) => {
                encode(header, &handlers::fetch::error_response(request, code))
            }
            Self::ListOffsets(request) => {
                encode(header, &handlers::list_offsets::error_response(request, code))
            }
            Self::FindCoordinator(request) => {
                encode(header, &handlers::find_coordinator::error_response(request, code))
            }
            Self::OffsetCommit(request) => {
                encode(header, &handlers::offsets::commit_error_response(request, code))
            }
            Self::OffsetFetch(request) => {
                encode(header, &handlers::offsets::fetch_error_response(request, code))
            }
            Self::Relay(_) => return Err(error),
        };
        Ok(Some(frame))
    }
}

fn encode<M: Message>(header: &RequestHeader, response: &M) -> BytesMut {
    encode_response(header.correlation_id, header.api_version, response)
}

/// Run one request under the session deadline
async fn process(
    ctx: &SessionContext,
    seq: u64,
    header: RequestHeader,
    request: ProxyRequest,
) -> (u64, ProxyResult<Option<BytesMut>>) {
    let api = request.api_key().name();
    let started = Instant::now();
    REQUESTS_TOTAL.with_label_values(&[api]).inc();

    let deadline = ctx.state.config.request_timeout;
    let result = match tokio::time::timeout(deadline, request.dispatch(ctx, &header)).await {
        Ok(result) => result,
        Err(_) => {
            REQUEST_TIMEOUTS_TOTAL.with_label_values(&[api]).inc();
            warn!(
                api_key = header.api_key,
                correlation_id = header.correlation_id,
                timeout_ms = deadline.as_millis() as u64,
                "Request exceeded deadline"
            );
            request.error_response(ctx, &header, ProxyError::GatewayTimeout(deadline))
        }
    };

    REQUEST_LATENCY
        .with_label_values(&[api])
        .observe(started.elapsed().as_secs_f64());
    (seq, result)
}

/// Response to an ApiVersions request newer than the proxy supports, in the
/// v0 layout every client can read
fn unsupported_api_versions(correlation_id: i32) -> BytesMut {
    encode_response(
        correlation_id,
        0,
        &ApiVersionsResponse::unsupported(supported_api_versions()),
    )
}

// ============================================================================
// Session loop
// ============================================================================

/// Serve one client connection until it closes, fails, or `shutdown` fires.
///
/// On shutdown the session stops reading and returns once every admitted
/// request has been answered. When the client closes, unanswered requests
/// are abandoned immediately.
#[instrument(skip(stream, state, shutdown), fields(client = %addr))]
pub async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    mut shutdown: watch::Receiver<bool>,
) -> ProxyResult<()> {
    debug!("New client connection");
    stream.set_nodelay(true)?;

    let ctx = SessionContext::new(state);
    let max_in_flight = ctx.state.config.max_in_flight;

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, KafkaCodec::new());
    let mut writer = FramedWrite::new(write_half, KafkaCodec::new());

    let mut reorder = ReorderBuffer::new();
    let mut in_flight = FuturesUnordered::new();
    let mut reading = !*shutdown.borrow();

    loop {
        let can_read = reading && reorder.in_flight() < max_in_flight;

        tokio::select! {
            frame = reader.next(), if can_read => {
                let mut frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!(error = %e, "Frame decode error");
                        return Err(e);
                    }
                    None => {
                        // Dropping the handler futures and the backend router
                        // closes every backend connection of this session
                        debug!(abandoned = reorder.in_flight(), "Client closed connection");
                        return Ok(());
                    }
                };
                BYTES_PROXIED_TOTAL
                    .with_label_values(&["in"])
                    .inc_by(frame.len() as u64 + 4);

                let header = RequestHeader::parse(&mut frame)?;
                debug!(
                    api_key = header.api_key,
                    api_version = header.api_version,
                    correlation_id = header.correlation_id,
                    client_id = ?header.client_id,
                    "Request"
                );

                match ProxyRequest::parse(&header, frame) {
                    Ok(request) => {
                        let seq = reorder.admit();
                        in_flight.push(process(&ctx, seq, header, request));
                    }
                    Err(ProxyError::UnsupportedProtocol { .. })
                        if header.api_key == ApiKey::ApiVersions.as_i16() =>
                    {
                        debug!(
                            api_version = header.api_version,
                            "ApiVersions version not supported, answering with v0"
                        );
                        let seq = reorder.admit();
                        let response = unsupported_api_versions(header.correlation_id);
                        reorder.complete(seq, Some(response));
                        write_ready(&mut writer, &mut reorder).await?;
                    }
                    Err(e) => {
                        warn!(
                            api_key = header.api_key,
                            api_version = header.api_version,
                            error = %e,
                            "Rejecting request, closing connection"
                        );
                        return Err(e);
                    }
                }
            }
            Some((seq, result)) = in_flight.next(), if !in_flight.is_empty() => {
                let response = result.inspect_err(|e| {
                    warn!(error = %e, "Request failed, closing connection");
                })?;
                reorder.complete(seq, response);
                write_ready(&mut writer, &mut reorder).await?;
            }
            _ = shutdown.changed(), if reading => {
                debug!(in_flight = reorder.in_flight(), "Shutdown requested, draining session");
                reading = false;
            }
        }

        if !reading && in_flight.is_empty() {
            break;
        }
    }

    Ok(())
}

async fn write_ready(
    writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, KafkaCodec>,
    reorder: &mut ReorderBuffer,
) -> ProxyResult<()> {
    for frame in reorder.pop_ready() {
        BYTES_PROXIED_TOTAL
            .with_label_values(&["out"])
            .inc_by(frame.len() as u64 + 4);
        writer.feed(frame).await?;
    }
    writer.flush().await
}
