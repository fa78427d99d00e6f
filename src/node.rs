//! # Beacon Network Node
//!
//! Composition root wiring every networking component over one transport and
//! one cancellation tree.
//!
//! ```text
//!                    ┌──────────────┐
//!   TransportEvent ─►│  NodeDriver  │◄─ ClockEvent
//!                    └──────┬───────┘
//!          ┌────────────────┼─────────────────┐
//!          ▼                ▼                 ▼
//!     GossipSub ◄──── SubnetScheduler      ReqResp
//!          │                                  │
//!          └────────► PeerReputation ◄────────┘
//! ```
//!
//! The driver owns the event loop: it routes inbound streams, follows peer
//! connectivity, recomputes topic score parameters every epoch, moves core
//! topics across fork boundaries, and disconnects peers whose reputation or
//! gossip score collapsed.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::chain::{ChainContext, Epoch, FORK_LOOKAHEAD_EPOCHS, ForkDigest, ForkName, LocalChainContext};
use crate::clock::{ClockEvent, SlotClock};
use crate::config::NetworkConfig;
use crate::gossipsub::{GossipEvent, GossipSub, GossipSubContext, PublishError, ReceivedMessage};
use crate::identity::{NodeId, PeerId};
use crate::messages::{MessageId, MetadataV1, MetadataV2, RequestBody, ResponseBody, StatusMessage, goodbye_reason};
use crate::peer_score::{PeerReputation, ReputationEvent, ScoreState};
use crate::protocols::{GOSSIP_PROTOCOL_ID, GossipValidator, Method, Protocol, Version};
use crate::rpc::{InboundRequest, ProtocolHandler, RegistrationError, ReqResp, ReqRespBuilder, ResponseError, ResponseSink};
use crate::scoring::{PeerScoreThresholds, compute_score_params};
use crate::subnets::{CommitteeSubscription, SubnetScheduler};
use crate::topic::{CoreTopicOptions, GossipTopic, GossipType, core_topics_at_fork};
use crate::transport::{StreamGossipSender, TcpTransport, Transport, TransportEvent, read_gossip_stream};

/// Received gossip buffered for the application.
const MESSAGE_CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// Local Node State
// ============================================================================

/// Status and metadata this node reports to its peers.
struct LocalState {
    status: RwLock<StatusMessage>,
    metadata: RwLock<MetadataV2>,
}

impl LocalState {
    fn new(fork_digest: ForkDigest) -> Self {
        Self {
            status: RwLock::new(StatusMessage {
                fork_digest,
                finalized_root: [0u8; 32],
                finalized_epoch: 0,
                head_root: [0u8; 32],
                head_slot: 0,
            }),
            metadata: RwLock::new(MetadataV2 {
                seq_number: 0,
                attnets: 0,
                syncnets: 0,
            }),
        }
    }

    /// Updates the advertised subnets, bumping the sequence number on change.
    fn set_attnets(&self, attnets: u64) -> bool {
        let mut metadata = self.metadata.write();
        if metadata.attnets == attnets {
            return false;
        }
        metadata.attnets = attnets;
        metadata.seq_number += 1;
        true
    }
}

/// Serves status, goodbye, ping and metadata from the node's own state.
struct CoreHandler {
    state: Arc<LocalState>,
}

#[async_trait]
impl ProtocolHandler for CoreHandler {
    async fn handle(&self, request: InboundRequest, sink: &mut ResponseSink) -> Result<(), ResponseError> {
        match request.body {
            RequestBody::Status(remote) => {
                trace!(peer = %request.peer.short(), head_slot = remote.head_slot, "status request");
                let status = self.state.status.read().clone();
                sink.send(ResponseBody::Status(status)).await
            }
            RequestBody::Goodbye(reason) => {
                debug!(peer = %request.peer.short(), reason, "peer said goodbye");
                Ok(())
            }
            RequestBody::Ping(_) => {
                let seq = self.state.metadata.read().seq_number;
                sink.send(ResponseBody::Pong(seq)).await
            }
            RequestBody::Metadata => {
                let metadata = *self.state.metadata.read();
                let body = match request.protocol.version {
                    Version::V1 => ResponseBody::MetadataV1(MetadataV1::from(metadata)),
                    Version::V2 => ResponseBody::MetadataV2(metadata),
                };
                sink.send(body).await
            }
            _ => Err(ResponseError::invalid_request("not served by this handler")),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct NodeBuilder {
    config: NetworkConfig,
    validator: Arc<dyn GossipValidator>,
    reqresp: ReqRespBuilder,
    state: Arc<LocalState>,
    core_topics: CoreTopicOptions,
}

impl NodeBuilder {
    /// Builder with the status, goodbye, ping and metadata protocols served.
    pub fn new(config: NetworkConfig, validator: Arc<dyn GossipValidator>) -> Result<Self> {
        let schedule = config.fork_schedule()?;
        let state = Arc::new(LocalState::new(schedule.digest_at_epoch(0)));
        let mut reqresp = ReqRespBuilder::new(config.reqresp.clone(), config.rate_limiter.clone());
        let core: Arc<dyn ProtocolHandler> = Arc::new(CoreHandler { state: state.clone() });
        reqresp.register_all(
            [
                Protocol::new(Method::Status, Version::V1),
                Protocol::new(Method::Goodbye, Version::V1),
                Protocol::new(Method::Ping, Version::V1),
                Protocol::new(Method::Metadata, Version::V1),
                Protocol::new(Method::Metadata, Version::V2),
            ],
            core,
        )?;
        let core_topics = CoreTopicOptions {
            subscribe_all_subnets: config.subnets.subscribe_all_subnets,
            light_client_server: false,
        };
        Ok(Self {
            config,
            validator,
            reqresp,
            state,
            core_topics,
        })
    }

    /// Serves `protocol` with `handler`, e.g. block or light client requests.
    pub fn register(
        &mut self,
        protocol: Protocol,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<&mut Self, RegistrationError> {
        self.reqresp.register(protocol, handler)?;
        if protocol.method.is_light_client_method() {
            self.core_topics.light_client_server = true;
        }
        Ok(self)
    }

    /// Every protocol id the transport must accept.
    pub fn protocol_ids(&self) -> Vec<String> {
        let mut ids = self.reqresp.protocol_ids();
        ids.push(GOSSIP_PROTOCOL_ID.to_string());
        ids
    }

    /// Listens on the configured address and dials the configured peers.
    pub async fn bind_tcp(self, local: PeerId) -> Result<(Node, mpsc::Receiver<ReceivedMessage>)> {
        let cancel = CancellationToken::new();
        let (tcp, events) = TcpTransport::bind(
            self.config.listen,
            local,
            self.protocol_ids(),
            cancel.child_token(),
        )
        .await
        .with_context(|| format!("binding {}", self.config.listen))?;
        info!(listen = %self.config.listen, port = tcp.listen_port(), "listening");
        let peers = self.config.peers.clone();
        let clock = self.clock();
        let (node, messages) = self
            .start_with(Arc::new(tcp.clone()), events, clock, cancel)
            .await?;
        for addr in peers {
            dial_peer(&tcp, addr).await;
        }
        Ok((node, messages))
    }

    fn clock(&self) -> SlotClock {
        if self.config.genesis_time == 0 {
            SlotClock::from_instant(Instant::now(), &self.config.chain)
        } else {
            SlotClock::from_genesis_time(self.config.genesis_time, &self.config.chain)
        }
    }

    /// Starts the node over an already created transport.
    pub async fn start(
        self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        clock: SlotClock,
    ) -> Result<(Node, mpsc::Receiver<ReceivedMessage>)> {
        self.start_with(transport, events, clock, CancellationToken::new())
            .await
    }

    async fn start_with(
        self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        clock: SlotClock,
        cancel: CancellationToken,
    ) -> Result<(Node, mpsc::Receiver<ReceivedMessage>)> {
        let config = self.config;
        config.validate()?;
        let local = transport.local_peer();
        let node_id = NodeId::from_peer_id(&local);
        let schedule = config.fork_schedule()?;
        let chain = Arc::new(LocalChainContext::new(
            config.chain.clone(),
            schedule.clone(),
            config.active_validators,
        ));
        chain.set_slot(clock.current_slot());
        self.state.status.write().fork_digest = chain.fork_digest_for_epoch(chain.current_epoch());

        let (reputation, reputation_events) =
            PeerReputation::spawn(config.reputation.clone(), cancel.child_token());

        let sender = Arc::new(StreamGossipSender::new(transport.clone()));
        let gossip_cancel = cancel.child_token();
        let (gossip, gossip_events) = GossipSub::spawn(
            config.gossip.clone(),
            PeerScoreThresholds::default(),
            GossipSubContext {
                local,
                schedule,
                sender: sender.clone(),
                validator: self.validator,
                reputation: Some(reputation.clone()),
            },
            gossip_cancel.clone(),
        );

        let reqresp = self.reqresp.build(
            transport.clone(),
            chain.clone(),
            reputation.clone(),
            cancel.child_token(),
        );

        let subnets = SubnetScheduler::spawn(
            config.subnets.clone(),
            node_id,
            chain.clone(),
            Arc::new(gossip.clone()),
            clock.subscribe(),
            cancel.child_token(),
        )
        .await;

        let node = Node {
            local,
            node_id,
            chain,
            transport,
            gossip,
            gossip_cancel,
            reqresp,
            subnets,
            reputation,
            state: self.state,
            cancel: cancel.clone(),
        };

        if let Err(e) = node.refresh_score_params().await {
            cancel.cancel();
            return Err(e);
        }
        let epoch = node.chain.current_epoch();
        for fork in node.chain.fork_schedule().active_forks(epoch) {
            node.subscribe_core_topics(fork, self.core_topics).await;
        }
        node.refresh_metadata().await;

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let driver = NodeDriver {
            node: node.clone(),
            sender,
            core_topics: self.core_topics,
            messages: message_tx,
        };
        let clock_events = clock.subscribe();
        tokio::spawn(driver.run(events, gossip_events, reputation_events, clock_events, cancel.clone()));
        let _clock_task: JoinHandle<()> = clock.spawn(cancel.child_token());

        info!(peer = %local.short(), node_id = ?node_id, epoch, "beacon network node started");
        Ok((node, message_rx))
    }
}

async fn dial_peer(tcp: &TcpTransport, addr: SocketAddr) {
    match tcp.dial(addr).await {
        Ok(peer) => info!(addr = %addr, peer = %peer.short(), "connected to peer"),
        Err(e) => warn!(addr = %addr, error = %e, "dial failed"),
    }
}

// ============================================================================
// Node Handle
// ============================================================================

/// Handle to a running node; cheap to clone.
#[derive(Clone)]
pub struct Node {
    local: PeerId,
    node_id: NodeId,
    chain: Arc<LocalChainContext>,
    transport: Arc<dyn Transport>,
    gossip: GossipSub,
    gossip_cancel: CancellationToken,
    reqresp: ReqResp,
    subnets: SubnetScheduler,
    reputation: PeerReputation,
    state: Arc<LocalState>,
    cancel: CancellationToken,
}

impl Node {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn chain(&self) -> &Arc<LocalChainContext> {
        &self.chain
    }

    pub fn gossip(&self) -> &GossipSub {
        &self.gossip
    }

    pub fn reqresp(&self) -> &ReqResp {
        &self.reqresp
    }

    pub fn subnets(&self) -> &SubnetScheduler {
        &self.subnets
    }

    pub fn reputation(&self) -> &PeerReputation {
        &self.reputation
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.transport.connected_peers()
    }

    /// Publishes on the topic of `kind` at the current fork.
    pub async fn publish(&self, kind: GossipType, data: Vec<u8>) -> Result<MessageId, PublishError> {
        let topic = GossipTopic::new(self.chain.current_fork(), kind);
        self.gossip.publish(topic, data).await
    }

    pub async fn add_committee_subscriptions(&self, subscriptions: Vec<CommitteeSubscription>) -> Result<()> {
        self.subnets.add_committee_subscriptions(subscriptions).await
    }

    /// Replaces the chain status reported to peers.
    pub fn set_status(&self, status: StatusMessage) {
        *self.state.status.write() = status;
    }

    pub fn status(&self) -> StatusMessage {
        self.state.status.read().clone()
    }

    pub fn metadata(&self) -> MetadataV2 {
        *self.state.metadata.read()
    }

    pub fn set_active_validators(&self, count: u64) {
        self.chain.set_active_validators(count);
    }

    /// Exchanges status with `peer`; a peer on another network is sent away.
    pub async fn handshake(&self, peer: PeerId) -> Result<StatusMessage> {
        let remote = self.reqresp.status(peer, self.status()).await?;
        let local_digest = self.state.status.read().fork_digest;
        if remote.fork_digest != local_digest {
            info!(peer = %peer.short(), remote = %remote.fork_digest, local = %local_digest, "irrelevant network");
            self.goodbye_and_disconnect(peer, goodbye_reason::IRRELEVANT_NETWORK).await;
            anyhow::bail!("peer {} is on fork digest {}", peer.short(), remote.fork_digest);
        }
        Ok(remote)
    }

    async fn goodbye_and_disconnect(&self, peer: PeerId, reason: u64) {
        if let Err(e) = self.reqresp.goodbye(peer, reason).await {
            trace!(peer = %peer.short(), error = %e, "goodbye not delivered");
        }
        self.transport.disconnect(&peer).await;
    }

    /// Says goodbye to every peer and stops all components.
    pub async fn shutdown(&self) {
        for peer in self.transport.connected_peers() {
            self.goodbye_and_disconnect(peer, goodbye_reason::CLIENT_SHUTDOWN).await;
        }
        self.cancel.cancel();
        info!("beacon network node stopped");
    }

    /// Derives topic score parameters from the current chain view and installs them.
    async fn refresh_score_params(&self) -> Result<()> {
        let params = compute_score_params(self.chain.as_ref())?;
        if let Err(e) = self.gossip.set_score_params(params).await {
            warn!(error = %e, "could not install score parameters");
        }
        Ok(())
    }

    async fn refresh_metadata(&self) {
        match self.subnets.attnets().await {
            Ok(attnets) => {
                if self.state.set_attnets(attnets) {
                    debug!(attnets = format!("{attnets:#x}"), "metadata updated");
                }
            }
            Err(e) => warn!(error = %e, "could not read long-lived subnets"),
        }
    }

    async fn subscribe_core_topics(&self, fork: ForkName, opts: CoreTopicOptions) {
        for kind in core_topics_at_fork(fork, self.chain.spec(), opts) {
            if let Err(e) = self.gossip.subscribe(GossipTopic::new(fork, kind)).await {
                warn!(fork = %fork, error = %e, "core topic subscribe failed");
            }
        }
    }

    async fn unsubscribe_core_topics(&self, fork: ForkName, opts: CoreTopicOptions) {
        for kind in core_topics_at_fork(fork, self.chain.spec(), opts) {
            if let Err(e) = self.gossip.unsubscribe(GossipTopic::new(fork, kind)).await {
                warn!(fork = %fork, error = %e, "core topic unsubscribe failed");
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

struct NodeDriver {
    node: Node,
    sender: Arc<StreamGossipSender>,
    core_topics: CoreTopicOptions,
    messages: mpsc::Sender<ReceivedMessage>,
}

impl NodeDriver {
    async fn run(
        self,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut gossip_events: mpsc::Receiver<GossipEvent>,
        mut reputation_events: mpsc::Receiver<ReputationEvent>,
        mut clock: broadcast::Receiver<ClockEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("node driver shutting down");
                    break;
                }
                Some(event) = transport_events.recv() => self.on_transport(event).await,
                Some(event) = gossip_events.recv() => self.on_gossip(event).await,
                Some(event) = reputation_events.recv() => self.on_reputation(event).await,
                tick = clock.recv() => match tick {
                    Ok(ClockEvent::Slot(slot)) => self.node.chain.set_slot(slot),
                    Ok(ClockEvent::Epoch(epoch)) => self.on_epoch(epoch).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "node driver lagged behind the slot clock");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn on_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, outbound } => {
                debug!(peer = %peer.short(), outbound, "peer connected");
                if let Err(e) = self.node.gossip.peer_connected(peer, outbound).await {
                    warn!(error = %e, "gossip peer registration failed");
                }
                if outbound {
                    let node = self.node.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.handshake(peer).await {
                            debug!(peer = %peer.short(), error = %e, "status handshake failed");
                        }
                    });
                }
            }
            TransportEvent::PeerDisconnected { peer } => {
                debug!(peer = %peer.short(), "peer disconnected");
                self.sender.forget(&peer);
                self.node.reqresp.peer_disconnected(&peer);
                if let Err(e) = self.node.gossip.peer_disconnected(peer).await {
                    warn!(error = %e, "gossip peer removal failed");
                }
            }
            TransportEvent::Inbound(inbound) => {
                if inbound.protocol == GOSSIP_PROTOCOL_ID {
                    let gossip = self.node.gossip.clone();
                    tokio::spawn(read_gossip_stream(inbound.peer, inbound.stream, move |from, frame| {
                        gossip.handle_frame(from, frame)
                    }));
                } else {
                    let reqresp = self.node.reqresp.clone();
                    tokio::spawn(async move { reqresp.handle_inbound(inbound).await });
                }
            }
        }
    }

    async fn on_gossip(&self, event: GossipEvent) {
        match event {
            GossipEvent::Message(message) => {
                if self.messages.try_send(message).is_err() {
                    debug!("application message queue full, dropping gossip message");
                }
            }
            GossipEvent::Graylisted(peer) => {
                info!(peer = %peer.short(), "disconnecting graylisted peer");
                self.node.transport.disconnect(&peer).await;
            }
        }
    }

    async fn on_reputation(&self, event: ReputationEvent) {
        let ReputationEvent::StateChanged { peer, from, to, reason } = event;
        info!(peer = %peer.short(), ?from, ?to, reason, "peer score state changed");
        let goodbye = match to {
            ScoreState::Healthy => return,
            ScoreState::Disconnected => goodbye_reason::SCORE_TOO_LOW,
            ScoreState::Banned => goodbye_reason::BANNED,
        };
        let node = self.node.clone();
        tokio::spawn(async move { node.goodbye_and_disconnect(peer, goodbye).await });
    }

    async fn on_epoch(&self, epoch: Epoch) {
        let node = &self.node;
        node.chain.set_slot(node.chain.spec().start_slot(epoch).max(node.chain.current_slot()));
        if let Err(e) = node.refresh_score_params().await
            && !node.gossip_cancel.is_cancelled()
        {
            error!(epoch, error = %e, "topic score parameters invalid, stopping gossip");
            node.gossip_cancel.cancel();
        }

        let schedule = node.chain.fork_schedule();
        if let Some(next) = schedule.next_fork(epoch)
            && next.epoch.saturating_sub(FORK_LOOKAHEAD_EPOCHS) == epoch
        {
            info!(fork = %next.name, epoch, "joining topics of upcoming fork");
            node.subscribe_core_topics(next.name, self.core_topics).await;
            if let Err(e) = node.subnets.subscribe_to_next_fork(next.name).await {
                warn!(error = %e, "subnet fork subscription failed");
            }
        }
        let forks = schedule.forks();
        for pair in forks.windows(2) {
            let (prev, current) = (&pair[0], &pair[1]);
            if current.epoch.saturating_add(FORK_LOOKAHEAD_EPOCHS) == epoch {
                info!(fork = %prev.name, epoch, "leaving topics of previous fork");
                node.unsubscribe_core_topics(prev.name, self.core_topics).await;
                if let Err(e) = node.subnets.unsubscribe_from_prev_fork(prev.name).await {
                    warn!(error = %e, "subnet fork unsubscription failed");
                }
            }
        }
        let digest = node.chain.fork_digest_for_epoch(epoch);
        node.state.status.write().fork_digest = digest;

        node.refresh_metadata().await;
    }
}
