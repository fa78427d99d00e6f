//! # Request/Response Engine
//!
//! Versioned request/response exchanges over individual transport streams.
//!
//! ## Outbound
//!
//! ```text
//! Idle -> Dialing -> StreamOpen -> AwaitingResponse(chunk_i) -> Complete | TimedOut | Aborted
//! ```
//!
//! [`ReqResp::send_request`] proposes every requested version in priority
//! order and lets the transport pick the first one the remote accepts. The
//! response is a lazy [`ResponseChunks`] sequence read by a background task;
//! callers that expect one chunk or a bounded number use
//! [`ResponseChunks::collect_exact_one`] and
//! [`ResponseChunks::collect_max_response`].
//!
//! Every failure is classified by [`RequestError::peer_action`] and reported to
//! the reputation store from here. Handlers never touch peer scores.
//!
//! | Timeout | Default |
//! |---------|---------|
//! | dial | 5 s |
//! | request write | 5 s |
//! | time to first byte | 5 s |
//! | per response chunk | 10 s |
//!
//! ## Inbound
//!
//! ```text
//! StreamAccepted -> RateLimitCheck -> Dispatched -> Responding(chunk_i) -> Closed
//! ```
//!
//! The dispatch table is frozen by [`ReqRespBuilder::build`]. Requests over
//! budget get a `RATE_LIMITED` chunk and the handler is never invoked; goodbye
//! is exempt. A handler error becomes one error chunk before the stream closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::chain::{ChainContext, ForkDigest};
use crate::codec::{self, RespStatus, ResponseChunk};
use crate::identity::PeerId;
use crate::messages::{
    BlocksByRangeRequest, BlocksByRootRequest, CodecError, MetadataV2, RequestBody, ResponseBody,
    SignedBeaconBlock, StatusMessage,
};
use crate::peer_score::{PeerAction, PeerReputation};
use crate::protocols::{ContextBytes, Method, Protocol, SUPPORTED_PROTOCOLS, Version};
use crate::rate_limiter::{InboundRateLimiter, RateLimitDecision, RateLimiterConfig};
use crate::transport::{BoxStream, InboundStream, Transport, TransportError};

/// Chunks buffered between the reader task and the consumer.
const RESPONSE_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReqRespConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub dial_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub ttfb_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub resp_timeout: Duration,
}

impl Default for ReqRespConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            ttfb_timeout: Duration::from_secs(5),
            resp_timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error a handler returns; written to the requester as one error chunk.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct ResponseError {
    pub status: RespStatus,
    pub message: String,
}

impl ResponseError {
    pub fn new(status: RespStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RespStatus::InvalidRequest, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(RespStatus::ServerError, message)
    }

    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        Self::new(RespStatus::ResourceUnavailable, message)
    }
}

/// Failure of an outbound request.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("dial error: {0}")]
    DialError(String),
    #[error("dial timeout")]
    DialTimeout,
    #[error("remote supports none of {0:?}")]
    UnsupportedProtocol(Vec<String>),
    #[error("request write error: {0}")]
    WriteError(String),
    #[error("request write timeout")]
    WriteTimeout,
    #[error("no response byte within the first-byte timeout")]
    TtfbTimeout,
    #[error("response chunk timeout")]
    RespTimeout,
    #[error("response stream failed: {0}")]
    StreamError(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unknown context bytes {0}")]
    UnknownContext(ForkDigest),
    #[error("blocks out of sequence: {0}")]
    SequenceViolation(String),
    #[error("peer responded {status}: {message}")]
    ErrorResponse { status: RespStatus, message: String },
    #[error("empty response")]
    EmptyResponse,
    #[error("request aborted")]
    Aborted,
}

impl RequestError {
    /// Stable code used as the reputation reason and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::DialError(_) => "DIAL_ERROR",
            RequestError::DialTimeout => "DIAL_TIMEOUT",
            RequestError::UnsupportedProtocol(_) => "UNSUPPORTED_PROTOCOL",
            RequestError::WriteError(_) => "REQUEST_ERROR",
            RequestError::WriteTimeout => "REQUEST_TIMEOUT",
            RequestError::TtfbTimeout => "TTFB_TIMEOUT",
            RequestError::RespTimeout => "RESP_TIMEOUT",
            RequestError::StreamError(_) => "STREAM_ERROR",
            RequestError::InvalidResponse(_) => "INVALID_RESPONSE",
            RequestError::UnknownContext(_) => "UNKNOWN_CONTEXT_BYTES",
            RequestError::SequenceViolation(_) => "SEQUENCE_VIOLATION",
            RequestError::ErrorResponse { status, .. } => match status {
                RespStatus::InvalidRequest => "INVALID_REQUEST",
                RespStatus::ServerError => "SERVER_ERROR",
                RespStatus::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
                RespStatus::RateLimited => "RATE_LIMITED",
                RespStatus::Success | RespStatus::Unknown(_) => "UNKNOWN_ERROR_STATUS",
            },
            RequestError::EmptyResponse => "EMPTY_RESPONSE",
            RequestError::Aborted => "ABORTED",
        }
    }

    /// Score action for this failure on `method`, if any.
    pub fn peer_action(&self, method: Method) -> Option<PeerAction> {
        match self {
            RequestError::DialError(_) | RequestError::DialTimeout => {
                Some(PeerAction::LowToleranceError)
            }
            RequestError::UnsupportedProtocol(_) => match method {
                Method::Ping => Some(PeerAction::Fatal),
                Method::Status | Method::Metadata => Some(PeerAction::LowToleranceError),
                _ => None,
            },
            RequestError::WriteError(_) | RequestError::WriteTimeout => {
                Some(PeerAction::HighToleranceError)
            }
            RequestError::TtfbTimeout | RequestError::RespTimeout => match method {
                Method::Ping => Some(PeerAction::LowToleranceError),
                m if m.is_block_method() => Some(PeerAction::MidToleranceError),
                _ => None,
            },
            RequestError::StreamError(_) => match method {
                m if m.is_block_method() => Some(PeerAction::MidToleranceError),
                _ => Some(PeerAction::LowToleranceError),
            },
            RequestError::InvalidResponse(_)
            | RequestError::UnknownContext(_)
            | RequestError::SequenceViolation(_) => Some(PeerAction::Fatal),
            RequestError::ErrorResponse { status, .. } => match status {
                RespStatus::InvalidRequest => Some(PeerAction::LowToleranceError),
                RespStatus::ServerError => Some(PeerAction::MidToleranceError),
                RespStatus::ResourceUnavailable | RespStatus::RateLimited => None,
                RespStatus::Success | RespStatus::Unknown(_) => {
                    Some(PeerAction::HighToleranceError)
                }
            },
            RequestError::EmptyResponse | RequestError::Aborted => None,
        }
    }
}

impl From<CodecError> for RequestError {
    /// Io failures are stream errors; anything the codec rejects is an invalid response.
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => RequestError::StreamError(e.to_string()),
            other => RequestError::InvalidResponse(other.to_string()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("protocol {0} is not in the registry")]
    Unsupported(Protocol),
    #[error("protocol {0} registered twice")]
    Duplicate(Protocol),
}

// ============================================================================
// Handler Seam
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundRequest {
    pub peer: PeerId,
    pub protocol: Protocol,
    pub body: RequestBody,
}

/// Produces the response chunks for one inbound request.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: InboundRequest,
        sink: &mut ResponseSink,
    ) -> Result<(), ResponseError>;
}

/// Ordered writer of response chunks for one inbound stream.
pub struct ResponseSink {
    stream: BoxStream,
    protocol: Protocol,
    chain: Arc<dyn ChainContext>,
    sent: usize,
}

impl ResponseSink {
    fn new(stream: BoxStream, protocol: Protocol, chain: Arc<dyn ChainContext>) -> Self {
        Self {
            stream,
            protocol,
            chain,
            sent: 0,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Writes one success chunk. Context bytes, when the protocol carries
    /// them, are the fork digest of the block's slot or of the current epoch.
    pub async fn send(&mut self, body: ResponseBody) -> Result<(), ResponseError> {
        let context = match self.protocol.context_bytes() {
            ContextBytes::Empty => None,
            ContextBytes::ForkDigest => {
                let epoch = match &body {
                    ResponseBody::Block(block) => self.chain.spec().epoch_at_slot(block.slot),
                    _ => self.chain.current_epoch(),
                };
                Some(self.chain.fork_digest_for_epoch(epoch))
            }
        };
        self.write_chunk(body, context).await
    }

    pub async fn send_with_context(
        &mut self,
        body: ResponseBody,
        context: ForkDigest,
    ) -> Result<(), ResponseError> {
        self.write_chunk(body, Some(context)).await
    }

    async fn write_chunk(
        &mut self,
        body: ResponseBody,
        context: Option<ForkDigest>,
    ) -> Result<(), ResponseError> {
        if self.protocol.method.ignores_response() {
            return Ok(());
        }
        if self.protocol.method.is_single_response() && self.sent >= 1 {
            return Err(ResponseError::server_error("single response already sent"));
        }
        if !self.protocol.accepts_response(&body) {
            return Err(ResponseError::server_error(format!(
                "{} is not a response of {}",
                body.name(),
                self.protocol.method
            )));
        }
        codec::write_success_chunk(&mut self.stream, &self.protocol, context, &body)
            .await
            .map_err(|e| ResponseError::server_error(e.to_string()))?;
        self.sent += 1;
        Ok(())
    }

    async fn write_error(&mut self, error: &ResponseError) {
        if let Err(e) = codec::write_error_chunk(&mut self.stream, error.status, &error.message).await
        {
            trace!(error = %e, "could not write error chunk");
        }
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ReqRespBuilder {
    config: ReqRespConfig,
    limiter: RateLimiterConfig,
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
}

impl ReqRespBuilder {
    pub fn new(config: ReqRespConfig, limiter: RateLimiterConfig) -> Self {
        Self {
            config,
            limiter,
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        protocol: Protocol,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<&mut Self, RegistrationError> {
        if !SUPPORTED_PROTOCOLS.contains(&protocol) {
            return Err(RegistrationError::Unsupported(protocol));
        }
        if self.handlers.contains_key(&protocol) {
            return Err(RegistrationError::Duplicate(protocol));
        }
        self.handlers.insert(protocol, handler);
        Ok(self)
    }

    /// Registers one handler for every protocol in `protocols`.
    pub fn register_all(
        &mut self,
        protocols: impl IntoIterator<Item = Protocol>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<&mut Self, RegistrationError> {
        for protocol in protocols {
            self.register(protocol, handler.clone())?;
        }
        Ok(self)
    }

    /// Protocol ids to advertise to the transport.
    pub fn protocol_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().map(Protocol::id).collect();
        ids.sort();
        ids
    }

    pub fn build(
        self,
        transport: Arc<dyn Transport>,
        chain: Arc<dyn ChainContext>,
        reputation: PeerReputation,
        cancel: CancellationToken,
    ) -> ReqResp {
        let limiter = InboundRateLimiter::new(self.limiter);
        let inner = Arc::new(ReqRespInner {
            config: self.config,
            transport,
            chain,
            handlers: self.handlers,
            limiter,
            reputation,
            cancel,
        });
        tokio::spawn(run_limiter_maintenance(inner.clone()));
        ReqResp { inner }
    }
}

async fn run_limiter_maintenance(inner: Arc<ReqRespInner>) {
    let mut interval = tokio::time::interval(inner.limiter.config().window.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                let pruned = inner.limiter.prune_expired();
                if pruned > 0 {
                    trace!(pruned, "pruned idle rate limiter entries");
                }
            }
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

struct ReqRespInner {
    config: ReqRespConfig,
    transport: Arc<dyn Transport>,
    chain: Arc<dyn ChainContext>,
    handlers: HashMap<Protocol, Arc<dyn ProtocolHandler>>,
    limiter: InboundRateLimiter,
    reputation: PeerReputation,
    cancel: CancellationToken,
}

impl ReqRespInner {
    /// The single place where request failures turn into score actions.
    async fn report(&self, peer: &PeerId, method: Method, error: &RequestError) {
        match error.peer_action(method) {
            Some(action) => {
                debug!(
                    peer = %peer.short(),
                    method = %method,
                    code = error.code(),
                    ?action,
                    "request failed"
                );
                if let Err(e) = self.reputation.apply_action(*peer, action, error.code()).await {
                    warn!(error = %e, "could not report request failure");
                }
            }
            None => {
                trace!(peer = %peer.short(), method = %method, code = error.code(), "request failed");
            }
        }
    }
}

/// Request/response engine; cheap to clone.
#[derive(Clone)]
pub struct ReqResp {
    inner: Arc<ReqRespInner>,
}

impl ReqResp {
    pub fn rate_limiter(&self) -> &InboundRateLimiter {
        &self.inner.limiter
    }

    /// Forgets per-peer limiter state.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.limiter.prune(peer);
    }

    pub fn is_registered(&self, protocol: &Protocol) -> bool {
        self.inner.handlers.contains_key(protocol)
    }

    /// Sends `body` to `peer`, trying `versions` in order.
    pub async fn send_request(
        &self,
        peer: PeerId,
        method: Method,
        versions: &[Version],
        body: RequestBody,
    ) -> Result<ResponseChunks, RequestError> {
        let result = self.open_request(peer, method, versions, body).await;
        if let Err(e) = &result {
            self.inner.report(&peer, method, e).await;
        }
        result
    }

    async fn open_request(
        &self,
        peer: PeerId,
        method: Method,
        versions: &[Version],
        body: RequestBody,
    ) -> Result<ResponseChunks, RequestError> {
        let inner = &self.inner;
        let protocols: Vec<Protocol> = versions
            .iter()
            .map(|v| Protocol::new(method, *v))
            .filter(|p| SUPPORTED_PROTOCOLS.contains(p))
            .collect();
        let ids: Vec<String> = protocols.iter().map(Protocol::id).collect();
        if ids.is_empty() {
            return Err(RequestError::UnsupportedProtocol(ids));
        }
        let cancel = inner.cancel.child_token();

        // Dialing
        let dial = tokio::time::timeout(inner.config.dial_timeout, inner.transport.open_stream(&peer, &ids));
        let (selected, mut stream) = tokio::select! {
            _ = cancel.cancelled() => return Err(RequestError::Aborted),
            dialed = dial => match dialed {
                Err(_) => return Err(RequestError::DialTimeout),
                Ok(Err(TransportError::UnsupportedProtocol(ids))) => {
                    return Err(RequestError::UnsupportedProtocol(ids));
                }
                Ok(Err(e)) => return Err(RequestError::DialError(e.to_string())),
                Ok(Ok(opened)) => opened,
            },
        };
        let protocol = protocols
            .into_iter()
            .find(|p| p.id() == selected)
            .ok_or_else(|| RequestError::DialError(format!("negotiated unrequested protocol {selected}")))?;
        trace!(peer = %peer.short(), protocol = %protocol, "stream open");

        // StreamOpen
        let write = tokio::time::timeout(inner.config.request_timeout, async {
            codec::write_request(&mut stream, &body).await?;
            if method.ignores_response() {
                stream.shutdown().await?;
            }
            Ok::<_, crate::messages::CodecError>(())
        });
        tokio::select! {
            _ = cancel.cancelled() => return Err(RequestError::Aborted),
            written = write => match written {
                Err(_) => return Err(RequestError::WriteTimeout),
                Ok(Err(e)) => return Err(RequestError::WriteError(e.to_string())),
                Ok(Ok(())) => {}
            },
        }

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        if !method.ignores_response() {
            tokio::spawn(read_responses(
                inner.clone(),
                peer,
                protocol,
                stream,
                tx,
                cancel.clone(),
            ));
        }

        // AwaitingResponse
        Ok(ResponseChunks {
            peer,
            protocol,
            rx,
            inner: inner.clone(),
            _guard: cancel.drop_guard(),
        })
    }

    /// Serves one inbound stream to completion.
    pub async fn handle_inbound(&self, inbound: InboundStream) {
        let inner = &self.inner;
        let InboundStream {
            peer,
            protocol: protocol_id,
            stream,
        } = inbound;

        let Some(protocol) = Protocol::parse(&protocol_id) else {
            debug!(peer = %peer.short(), protocol = %protocol_id, "inbound stream on unknown protocol");
            return;
        };
        let mut sink = ResponseSink::new(stream, protocol, inner.chain.clone());
        let Some(handler) = inner.handlers.get(&protocol).cloned() else {
            sink.write_error(&ResponseError::invalid_request("protocol not served")).await;
            sink.close().await;
            return;
        };

        let served = tokio::select! {
            _ = inner.cancel.cancelled() => None,
            served = self.serve(peer, protocol, handler, &mut sink) => Some(served),
        };
        match served {
            Some(Ok(())) => trace!(peer = %peer.short(), protocol = %protocol, chunks = sink.sent(), "request served"),
            Some(Err(e)) => {
                debug!(peer = %peer.short(), protocol = %protocol, error = %e, "request failed");
                sink.write_error(&e).await;
            }
            None => sink.write_error(&ResponseError::server_error("shutting down")).await,
        }
        sink.close().await;
    }

    async fn serve(
        &self,
        peer: PeerId,
        protocol: Protocol,
        handler: Arc<dyn ProtocolHandler>,
        sink: &mut ResponseSink,
    ) -> Result<(), ResponseError> {
        let inner = &self.inner;
        let method = protocol.method;

        self.check_rate(&peer, method, inner.limiter.allow_request(&peer, method))
            .await?;

        let body = match tokio::time::timeout(
            inner.config.request_timeout,
            codec::read_request(&mut sink.stream, &protocol),
        )
        .await
        {
            Err(_) => return Err(ResponseError::invalid_request("request read timeout")),
            Ok(Err(e)) => return Err(ResponseError::invalid_request(e.to_string())),
            Ok(Ok(body)) => body,
        };

        if method.is_block_method() {
            let count = body.block_count();
            self.check_rate(&peer, method, inner.limiter.allow_block_request(&peer, count))
                .await?;
        }

        handler
            .handle(InboundRequest { peer, protocol, body }, sink)
            .await
    }

    async fn check_rate(
        &self,
        peer: &PeerId,
        method: Method,
        decision: RateLimitDecision,
    ) -> Result<(), ResponseError> {
        match decision {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Limited { sustained } => {
                if sustained {
                    warn!(peer = %peer.short(), method = %method, "sustained rate limit abuse");
                    if let Err(e) = self
                        .inner
                        .reputation
                        .apply_action(*peer, PeerAction::Fatal, "rate_limit_rpc")
                        .await
                    {
                        warn!(error = %e, "could not report rate limit abuse");
                    }
                }
                Err(ResponseError::new(RespStatus::RateLimited, "rate limited"))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Typed helpers
    // ------------------------------------------------------------------------

    pub async fn status(&self, peer: PeerId, status: StatusMessage) -> Result<StatusMessage, RequestError> {
        let chunks = self
            .send_request(peer, Method::Status, &[Version::V1], RequestBody::Status(status))
            .await?;
        match chunks.collect_exact_one().await? {
            ResponseBody::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a goodbye; the response is not awaited.
    pub async fn goodbye(&self, peer: PeerId, reason: u64) -> Result<(), RequestError> {
        self.send_request(peer, Method::Goodbye, &[Version::V1], RequestBody::Goodbye(reason))
            .await?;
        Ok(())
    }

    pub async fn ping(&self, peer: PeerId, seq_number: u64) -> Result<u64, RequestError> {
        let chunks = self
            .send_request(peer, Method::Ping, &[Version::V1], RequestBody::Ping(seq_number))
            .await?;
        match chunks.collect_exact_one().await? {
            ResponseBody::Pong(seq) => Ok(seq),
            other => Err(unexpected(other)),
        }
    }

    /// Metadata of `peer`; V1 answers come back with empty sync subnets.
    pub async fn metadata(&self, peer: PeerId) -> Result<MetadataV2, RequestError> {
        let chunks = self
            .send_request(peer, Method::Metadata, &[Version::V2, Version::V1], RequestBody::Metadata)
            .await?;
        match chunks.collect_exact_one().await? {
            ResponseBody::MetadataV2(metadata) => Ok(metadata),
            ResponseBody::MetadataV1(metadata) => Ok(MetadataV2 {
                seq_number: metadata.seq_number,
                attnets: metadata.attnets,
                syncnets: 0,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn beacon_blocks_by_range(
        &self,
        peer: PeerId,
        request: BlocksByRangeRequest,
    ) -> Result<Vec<SignedBeaconBlock>, RequestError> {
        let chunks = self
            .send_request(
                peer,
                Method::BeaconBlocksByRange,
                &[Version::V2, Version::V1],
                RequestBody::BlocksByRange(request),
            )
            .await?;
        chunks.collect_sequential_blocks_in_range(&request).await
    }

    pub async fn beacon_blocks_by_root(
        &self,
        peer: PeerId,
        request: BlocksByRootRequest,
    ) -> Result<Vec<SignedBeaconBlock>, RequestError> {
        let max = request.roots.len();
        let chunks = self
            .send_request(
                peer,
                Method::BeaconBlocksByRoot,
                &[Version::V2, Version::V1],
                RequestBody::BlocksByRoot(request),
            )
            .await?;
        chunks
            .collect_max_response(max)
            .await?
            .into_iter()
            .map(|body| match body {
                ResponseBody::Block(block) => Ok(block),
                other => Err(unexpected(other)),
            })
            .collect()
    }

    /// Light client request with an opaque response; `method` must be a light client method.
    pub async fn light_client(
        &self,
        peer: PeerId,
        method: Method,
        body: RequestBody,
        max_chunks: usize,
    ) -> Result<Vec<Vec<u8>>, RequestError> {
        let chunks = self.send_request(peer, method, &[Version::V1], body).await?;
        chunks
            .collect_max_response(max_chunks)
            .await?
            .into_iter()
            .map(|body| match body {
                ResponseBody::LightClient(bytes) => Ok(bytes),
                other => Err(unexpected(other)),
            })
            .collect()
    }
}

fn unexpected(body: ResponseBody) -> RequestError {
    RequestError::InvalidResponse(format!("unexpected {} chunk", body.name()))
}

// ============================================================================
// Response Reading
// ============================================================================

async fn read_responses(
    inner: Arc<ReqRespInner>,
    peer: PeerId,
    protocol: Protocol,
    stream: BoxStream,
    tx: mpsc::Sender<Result<ResponseBody, RequestError>>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(RequestError::Aborted),
        result = read_chunks(&inner, &protocol, &mut reader, &tx) => result,
    };
    if let Err(e) = result {
        inner.report(&peer, protocol.method, &e).await;
        let _ = tx.send(Err(e)).await;
    }
}

async fn read_chunks(
    inner: &ReqRespInner,
    protocol: &Protocol,
    reader: &mut BufReader<BoxStream>,
    tx: &mpsc::Sender<Result<ResponseBody, RequestError>>,
) -> Result<(), RequestError> {
    match tokio::time::timeout(inner.config.ttfb_timeout, reader.fill_buf()).await {
        Err(_) => return Err(RequestError::TtfbTimeout),
        Ok(Err(e)) => return Err(RequestError::StreamError(e.to_string())),
        Ok(Ok(_)) => {}
    }

    loop {
        let chunk = match tokio::time::timeout(
            inner.config.resp_timeout,
            codec::read_response_chunk(reader, protocol),
        )
        .await
        {
            Err(_) => return Err(RequestError::RespTimeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(chunk))) => chunk,
        };

        match chunk {
            ResponseChunk::Error { status, message } => {
                return Err(RequestError::ErrorResponse { status, message });
            }
            ResponseChunk::Success { context, body } => {
                if let Some(digest) = context
                    && inner.chain.fork_schedule().fork_for_digest(&digest).is_none()
                {
                    return Err(RequestError::UnknownContext(digest));
                }
                if tx.send(Ok(body)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Lazy, ordered response of one outbound request. Dropping it aborts the
/// request.
pub struct ResponseChunks {
    peer: PeerId,
    protocol: Protocol,
    rx: mpsc::Receiver<Result<ResponseBody, RequestError>>,
    inner: Arc<ReqRespInner>,
    _guard: DropGuard,
}

impl ResponseChunks {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Protocol the remote accepted.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Next chunk, or `None` once the responder closed the stream.
    pub async fn next(&mut self) -> Option<Result<ResponseBody, RequestError>> {
        self.rx.recv().await
    }

    async fn fail(&self, error: RequestError) -> RequestError {
        self.inner.report(&self.peer, self.protocol.method, &error).await;
        error
    }

    /// Exactly one chunk; further chunks are not read.
    pub async fn collect_exact_one(mut self) -> Result<ResponseBody, RequestError> {
        match self.next().await {
            Some(result) => result,
            None => Err(self.fail(RequestError::EmptyResponse).await),
        }
    }

    /// Every chunk, failing once more than `max` arrive.
    pub async fn collect_max_response(mut self, max: usize) -> Result<Vec<ResponseBody>, RequestError> {
        let mut chunks = Vec::new();
        while let Some(result) = self.next().await {
            let body = result?;
            if chunks.len() >= max {
                let error = RequestError::InvalidResponse(format!("more than {max} chunks"));
                return Err(self.fail(error).await);
            }
            chunks.push(body);
        }
        Ok(chunks)
    }

    /// Blocks of a range request, checked with [`assert_sequential_blocks_in_range`].
    pub async fn collect_sequential_blocks_in_range(
        self,
        request: &BlocksByRangeRequest,
    ) -> Result<Vec<SignedBeaconBlock>, RequestError> {
        let max = usize::try_from(request.count).unwrap_or(usize::MAX);
        let peer = self.peer;
        let method = self.protocol.method;
        let inner = self.inner.clone();
        let mut blocks = Vec::new();
        for body in self.collect_max_response(max).await? {
            match body {
                ResponseBody::Block(block) => blocks.push(block),
                other => {
                    let error = unexpected(other);
                    inner.report(&peer, method, &error).await;
                    return Err(error);
                }
            }
        }
        if let Err(error) = assert_sequential_blocks_in_range(&blocks, request) {
            inner.report(&peer, method, &error).await;
            return Err(error);
        }
        Ok(blocks)
    }
}

/// Slots must be strictly increasing and inside `[start_slot, start_slot + count)`.
/// A short response is fine.
pub fn assert_sequential_blocks_in_range(
    blocks: &[SignedBeaconBlock],
    request: &BlocksByRangeRequest,
) -> Result<(), RequestError> {
    let end = request.start_slot.saturating_add(request.count);
    let mut previous: Option<u64> = None;
    for block in blocks {
        if block.slot < request.start_slot || block.slot >= end {
            return Err(RequestError::SequenceViolation(format!(
                "slot {} outside [{}, {end})",
                block.slot, request.start_slot
            )));
        }
        if let Some(prev) = previous
            && block.slot <= prev
        {
            return Err(RequestError::SequenceViolation(format!(
                "slot {} after {prev}",
                block.slot
            )));
        }
        previous = Some(block.slot);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainSpec, ForkName, ForkSchedule, LocalChainContext};
    use crate::messages::MetadataV1;
    use crate::peer_score::ReputationConfig;
    use crate::transport::{MemoryNetwork, TransportEvent};

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn block(slot: u64) -> SignedBeaconBlock {
        SignedBeaconBlock {
            slot,
            root: [slot as u8; 32],
            bytes: vec![slot as u8; 4],
        }
    }

    fn range(start_slot: u64, count: u64) -> BlocksByRangeRequest {
        BlocksByRangeRequest {
            start_slot,
            count,
            step: 1,
        }
    }

    #[test]
    fn sequential_range_accepts_sparse_increasing() {
        let req = range(10, 5);
        assert!(assert_sequential_blocks_in_range(&[], &req).is_ok());
        assert!(assert_sequential_blocks_in_range(&[block(10), block(12), block(14)], &req).is_ok());
    }

    #[test]
    fn sequential_range_rejects_violations() {
        let req = range(10, 5);
        for blocks in [
            vec![block(9)],
            vec![block(15)],
            vec![block(11), block(11)],
            vec![block(12), block(11)],
        ] {
            assert!(matches!(
                assert_sequential_blocks_in_range(&blocks, &req),
                Err(RequestError::SequenceViolation(_))
            ));
        }
    }

    #[test]
    fn error_classification_table() {
        use PeerAction::*;
        let status = |status| RequestError::ErrorResponse {
            status,
            message: String::new(),
        };
        let cases = [
            (RequestError::DialTimeout, Method::Status, Some(LowToleranceError)),
            (RequestError::DialError("x".into()), Method::BeaconBlocksByRange, Some(LowToleranceError)),
            (RequestError::UnsupportedProtocol(vec![]), Method::Ping, Some(Fatal)),
            (RequestError::UnsupportedProtocol(vec![]), Method::Metadata, Some(LowToleranceError)),
            (RequestError::UnsupportedProtocol(vec![]), Method::BeaconBlocksByRoot, None),
            (RequestError::WriteTimeout, Method::Status, Some(HighToleranceError)),
            (RequestError::TtfbTimeout, Method::Ping, Some(LowToleranceError)),
            (RequestError::RespTimeout, Method::BeaconBlocksByRange, Some(MidToleranceError)),
            (RequestError::RespTimeout, Method::Status, None),
            (RequestError::StreamError("x".into()), Method::Status, Some(LowToleranceError)),
            (RequestError::StreamError("x".into()), Method::BeaconBlocksByRange, Some(MidToleranceError)),
            (RequestError::InvalidResponse("x".into()), Method::Status, Some(Fatal)),
            (RequestError::SequenceViolation("x".into()), Method::BeaconBlocksByRange, Some(Fatal)),
            (status(RespStatus::InvalidRequest), Method::Status, Some(LowToleranceError)),
            (status(RespStatus::ServerError), Method::Status, Some(MidToleranceError)),
            (status(RespStatus::ResourceUnavailable), Method::Status, None),
            (status(RespStatus::RateLimited), Method::Status, None),
            (status(RespStatus::Unknown(42)), Method::Status, Some(HighToleranceError)),
            (RequestError::Aborted, Method::Status, None),
        ];
        for (error, method, expected) in cases {
            assert_eq!(error.peer_action(method), expected, "{error} on {method}");
        }
    }

    #[tokio::test]
    async fn truncated_chunk_is_a_stream_error() {
        let protocol = Protocol::new(Method::BeaconBlocksByRange, Version::V2);
        let err = codec::read_response_chunk(&mut &[0u8][..], &protocol)
            .await
            .expect_err("truncated");
        let err = RequestError::from(err);
        assert!(matches!(err, RequestError::StreamError(_)), "{err}");
        assert_eq!(
            err.peer_action(protocol.method),
            Some(PeerAction::MidToleranceError)
        );

        let oversized = RequestError::from(CodecError::TooLarge { size: 10, limit: 1 });
        assert_eq!(oversized.peer_action(protocol.method), Some(PeerAction::Fatal));
    }

    #[test]
    fn registration_rejects_unknown_and_duplicates() {
        struct Nop;
        #[async_trait]
        impl ProtocolHandler for Nop {
            async fn handle(&self, _: InboundRequest, _: &mut ResponseSink) -> Result<(), ResponseError> {
                Ok(())
            }
        }
        let mut builder = ReqRespBuilder::new(ReqRespConfig::default(), RateLimiterConfig::default());
        let ping = Protocol::new(Method::Ping, Version::V1);
        builder.register(ping, Arc::new(Nop)).expect("register");
        assert_eq!(
            builder.register(ping, Arc::new(Nop)).err(),
            Some(RegistrationError::Duplicate(ping))
        );
        let ping_v2 = Protocol::new(Method::Ping, Version::V2);
        assert_eq!(
            builder.register(ping_v2, Arc::new(Nop)).err(),
            Some(RegistrationError::Unsupported(ping_v2))
        );
        assert_eq!(builder.protocol_ids(), vec![ping.id()]);
    }

    struct Responder;

    #[async_trait]
    impl ProtocolHandler for Responder {
        async fn handle(
            &self,
            request: InboundRequest,
            sink: &mut ResponseSink,
        ) -> Result<(), ResponseError> {
            match request.body {
                RequestBody::Ping(seq) => sink.send(ResponseBody::Pong(seq + 1)).await,
                RequestBody::Metadata => {
                    sink.send(ResponseBody::MetadataV1(MetadataV1 {
                        seq_number: 3,
                        attnets: 0b101,
                    }))
                    .await
                }
                RequestBody::BlocksByRange(req) => {
                    for slot in req.start_slot..req.start_slot + req.count {
                        if slot % 2 == 0 {
                            sink.send(ResponseBody::Block(block(slot))).await?;
                        }
                    }
                    Ok(())
                }
                RequestBody::Status(_) => Err(ResponseError::resource_unavailable("no status")),
                _ => Err(ResponseError::invalid_request("unsupported")),
            }
        }
    }

    async fn pair(server_protocols: Vec<Protocol>, limiter: RateLimiterConfig) -> (ReqResp, ReqResp, PeerReputation, CancellationToken) {
        let cancel = CancellationToken::new();
        let net = MemoryNetwork::new();
        let chain: Arc<dyn ChainContext> = Arc::new(LocalChainContext::new(
            ChainSpec::mainnet(),
            ForkSchedule::single(ForkName::Altair, [1u8; 32]),
            64,
        ));
        let (reputation, _events) = PeerReputation::spawn(ReputationConfig::default(), cancel.clone());

        let mut server = ReqRespBuilder::new(ReqRespConfig::default(), limiter);
        server
            .register_all(server_protocols, Arc::new(Responder))
            .expect("register");
        let (server_transport, mut server_events) = net.join(peer(2), server.protocol_ids());
        let server = server.build(
            Arc::new(server_transport),
            chain.clone(),
            reputation.clone(),
            cancel.clone(),
        );
        let serving = server.clone();
        tokio::spawn(async move {
            while let Some(event) = server_events.recv().await {
                if let TransportEvent::Inbound(inbound) = event {
                    let engine = serving.clone();
                    tokio::spawn(async move { engine.handle_inbound(inbound).await });
                }
            }
        });

        let client = ReqRespBuilder::new(ReqRespConfig::default(), RateLimiterConfig::default());
        let (client_transport, _client_events) = net.join(peer(1), client.protocol_ids());
        let client = client.build(
            Arc::new(client_transport),
            chain,
            reputation.clone(),
            cancel.clone(),
        );
        (client, server, reputation, cancel)
    }

    #[tokio::test]
    async fn ping_roundtrip() {
        let (client, _server, _rep, _cancel) =
            pair(vec![Protocol::new(Method::Ping, Version::V1)], RateLimiterConfig::default()).await;
        assert_eq!(client.ping(peer(2), 41).await, Ok(42));
    }

    #[tokio::test]
    async fn falls_back_to_v1_metadata() {
        let (client, _server, _rep, _cancel) = pair(
            vec![Protocol::new(Method::Metadata, Version::V1)],
            RateLimiterConfig::default(),
        )
        .await;
        let chunks = client
            .send_request(peer(2), Method::Metadata, &[Version::V2, Version::V1], RequestBody::Metadata)
            .await
            .expect("request");
        assert_eq!(chunks.protocol().version, Version::V1);
        assert_eq!(
            chunks.collect_exact_one().await,
            Ok(ResponseBody::MetadataV1(MetadataV1 {
                seq_number: 3,
                attnets: 0b101
            }))
        );
    }

    #[tokio::test]
    async fn range_request_returns_sparse_blocks() {
        let (client, _server, _rep, _cancel) = pair(
            vec![Protocol::new(Method::BeaconBlocksByRange, Version::V2)],
            RateLimiterConfig::default(),
        )
        .await;
        let blocks = client
            .beacon_blocks_by_range(peer(2), range(10, 6))
            .await
            .expect("blocks");
        let slots: Vec<u64> = blocks.iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![10, 12, 14]);
    }

    #[tokio::test]
    async fn handler_error_reaches_requester_without_penalty() {
        let (client, _server, rep, _cancel) = pair(
            vec![Protocol::new(Method::Status, Version::V1)],
            RateLimiterConfig::default(),
        )
        .await;
        let status = StatusMessage {
            fork_digest: ForkDigest([0; 4]),
            finalized_root: [0; 32],
            finalized_epoch: 0,
            head_root: [0; 32],
            head_slot: 0,
        };
        let err = client.status(peer(2), status).await.expect_err("error chunk");
        assert_eq!(
            err,
            RequestError::ErrorResponse {
                status: RespStatus::ResourceUnavailable,
                message: "no status".to_string()
            }
        );
        assert_eq!(rep.score(peer(2)).await.expect("score"), 0.0);
    }

    #[tokio::test]
    async fn unsupported_ping_is_fatal() {
        let (client, _server, rep, _cancel) = pair(
            vec![Protocol::new(Method::Status, Version::V1)],
            RateLimiterConfig::default(),
        )
        .await;
        let err = client.ping(peer(2), 1).await.expect_err("unsupported");
        assert!(matches!(err, RequestError::UnsupportedProtocol(_)));
        assert!(rep.score(peer(2)).await.expect("score") <= -50.0);
    }

    #[tokio::test]
    async fn over_quota_requests_are_rate_limited() {
        let limiter = RateLimiterConfig {
            request_quota: 2,
            ..RateLimiterConfig::default()
        };
        let (client, _server, _rep, _cancel) =
            pair(vec![Protocol::new(Method::Ping, Version::V1)], limiter).await;
        assert_eq!(client.ping(peer(2), 1).await, Ok(2));
        assert_eq!(client.ping(peer(2), 2).await, Ok(3));
        let err = client.ping(peer(2), 3).await.expect_err("limited");
        assert!(matches!(
            err,
            RequestError::ErrorResponse {
                status: RespStatus::RateLimited,
                ..
            }
        ));
    }
}
