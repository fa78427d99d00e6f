//! # Gossip Engine
//!
//! Topic-based pub/sub over a degree-bounded mesh, with gossipsub v1.1 peer
//! scoring driven by parameters from [`crate::scoring`].
//!
//! ## Message Flow
//!
//! | Step | Where | Notes |
//! |------|-------|-------|
//! | Frame arrives | actor | graylisted peers are ignored |
//! | Topic lookup | [`TopicCache`] | unknown topics are dropped, no score impact |
//! | Message id | fast LRU, then canonical | both paths yield the same id |
//! | Duplicate check | delivery records | near-first duplicates credit P3 |
//! | Validation | validation lane task | [`GossipValidator`] runs off the actor |
//! | Outcome | actor | Accept forwards + delivers, Reject charges P4 |
//!
//! ## Mesh
//!
//! Each heartbeat the mesh of every subscribed topic is brought back into
//! `[D_low, D_high]`: negative-score peers are pruned, missing peers are
//! grafted from known topic peers (never during PRUNE backoff), and an
//! oversized mesh is cut back to `D` dropping the lowest scores first while
//! keeping at least `D_out` outbound peers.
//!
//! ## Scoring
//!
//! | Component | Counter | Contribution |
//! |-----------|---------|--------------|
//! | P1 | time in mesh | `min(t / quantum, cap) * w` |
//! | P2 | first deliveries (capped) | `count * w` |
//! | P3 | mesh deliveries (capped) | `deficit^2 * w` after activation |
//! | P3b | mesh failure penalty | `penalty * w` |
//! | P4 | invalid deliveries | `count^2 * w` |
//! | P5 | application score | `score * w` |
//! | P7 | behaviour penalty | `excess^2 * w` above threshold |
//!
//! Topic contributions are multiplied by the topic weight and their sum is
//! capped by `topic_score_cap`. Counters decay once per `decay_interval`.
//! Scores of disconnected peers are kept for `retain_score`.
//!
//! ## Outbound
//!
//! Every connected peer gets a writer task with a byte budget. Frames that
//! would exceed the budget are dropped; a slow peer never stalls the actor.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::chain::ForkSchedule;
use crate::identity::PeerId;
use crate::messages::{
    self, FastMessageId, GossipFrame, MAX_PAYLOAD_SIZE, MESSAGE_ID_LEN, MessageId,
};
use crate::peer_score::PeerReputation;
use crate::protocols::{GossipSender, GossipSubscriber, GossipValidator};
use crate::scoring::{
    GOSSIP_D, GOSSIP_D_HIGH, GOSSIP_D_LOW, PeerScoreParams, PeerScoreThresholds, TopicScoreParams,
};
use crate::topic::{GossipTopic, TopicCache, TopicError};

// ============================================================================
// Limits
// ============================================================================

/// SECURITY: Bounds per-peer topic bookkeeping.
pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 512;

/// SECURITY: Bounds score state, including retained scores of departed peers.
pub const MAX_SCORED_PEERS: usize = 10_000;

/// SECURITY: Bounds PRUNE backoff tracking.
const MAX_BACKOFF_ENTRIES: usize = 10_000;

/// SECURITY: Bounds outstanding IWANT promises.
const MAX_PROMISES: usize = 5_000;

/// Ids requested per IWANT and served per IWANT.
const MAX_IWANT_LENGTH: usize = 500;

/// Opportunistic grafting adds at most this many peers per heartbeat.
const OPPORTUNISTIC_GRAFT_PEERS: usize = 2;

const COMMAND_CHANNEL_CAPACITY: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSubConfig {
    /// Target mesh degree (D).
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    /// Outbound peers kept in the mesh when pruning (D_out).
    pub mesh_outbound_min: usize,
    /// Peers receiving IHAVE gossip per topic per heartbeat (D_lazy).
    pub gossip_lazy: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub prune_backoff: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub fanout_ttl: Duration,
    /// Heartbeats a cached message is advertised in IHAVE.
    pub gossip_history: u32,
    pub message_cache_size: usize,
    pub seen_cache_size: usize,
    pub fast_id_cache_size: usize,
    pub max_ihave_length: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub iwant_followup_time: Duration,
    pub validation_queue_size: usize,
    pub max_outbound_buffer_size: usize,
    pub max_transmit_size: usize,
    pub allow_publish_to_zero_peers: bool,
    /// Publish to every topic peer above the publish threshold, not only the mesh.
    pub flood_publish: bool,
}

impl Default for GossipSubConfig {
    fn default() -> Self {
        Self {
            mesh_n: GOSSIP_D,
            mesh_n_low: GOSSIP_D_LOW,
            mesh_n_high: GOSSIP_D_HIGH,
            mesh_outbound_min: 2,
            gossip_lazy: 6,
            heartbeat_interval: Duration::from_millis(700),
            prune_backoff: Duration::from_secs(60),
            fanout_ttl: Duration::from_secs(60),
            gossip_history: 3,
            message_cache_size: 10_000,
            seen_cache_size: 65_536,
            fast_id_cache_size: 65_536,
            max_ihave_length: 100,
            iwant_followup_time: Duration::from_secs(3),
            validation_queue_size: 4096,
            max_outbound_buffer_size: 16 * 1024 * 1024,
            max_transmit_size: MAX_PAYLOAD_SIZE,
            allow_publish_to_zero_peers: false,
            flood_publish: true,
        }
    }
}

// ============================================================================
// Public Types
// ============================================================================

/// A message waiting for application validation.
#[derive(Clone, Debug)]
pub struct PendingGossipMessage {
    pub topic: GossipTopic,
    pub topic_str: String,
    pub msg_id: MessageId,
    pub from: PeerId,
    /// Decompressed payload.
    pub data: Vec<u8>,
    pub seen_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Accept,
    Ignore,
    Reject,
}

/// An accepted message, delivered once per message id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: GossipTopic,
    pub msg_id: MessageId,
    pub from: PeerId,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipEvent {
    Message(ReceivedMessage),
    /// Score fell below the graylist threshold; the peer should be disconnected.
    Graylisted(PeerId),
}

#[derive(Debug, Error, PartialEq)]
pub enum PublishError {
    #[error("no peers to publish on {0}")]
    NoPeers(String),
    #[error("message of {size} bytes exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("message already published")]
    Duplicate,
    #[error("topic: {0}")]
    UnknownTopic(#[from] TopicError),
    #[error("gossip actor closed")]
    Closed,
}

// ============================================================================
// Peer Scoring
// ============================================================================

#[derive(Debug, Clone, Default)]
struct TopicScore {
    mesh_time: Option<Instant>,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

impl TopicScore {
    fn score(&self, params: &TopicScoreParams, now: Instant) -> f64 {
        let mut score = 0.0;

        if let Some(joined) = self.mesh_time {
            let quantum = params.time_in_mesh_quantum.as_secs_f64();
            if quantum > 0.0 {
                let p1 = (now.duration_since(joined).as_secs_f64() / quantum)
                    .min(params.time_in_mesh_cap);
                score += p1 * params.time_in_mesh_weight;
            }
        }

        score += self.first_message_deliveries * params.first_message_deliveries_weight;

        if self.mesh_active(params, now)
            && self.mesh_message_deliveries < params.mesh_message_deliveries_threshold
        {
            let deficit = params.mesh_message_deliveries_threshold - self.mesh_message_deliveries;
            score += deficit * deficit * params.mesh_message_deliveries_weight;
        }

        score += self.mesh_failure_penalty * params.mesh_failure_penalty_weight;

        score += self.invalid_message_deliveries
            * self.invalid_message_deliveries
            * params.invalid_message_deliveries_weight;

        score * params.topic_weight
    }

    /// In the mesh for longer than the activation window.
    fn mesh_active(&self, params: &TopicScoreParams, now: Instant) -> bool {
        self.mesh_time
            .is_some_and(|t| now.duration_since(t) >= params.mesh_message_deliveries_activation)
    }

    fn decay(&mut self, params: &TopicScoreParams, decay_to_zero: f64) {
        let decay = |value: &mut f64, factor: f64| {
            *value *= factor;
            if *value < decay_to_zero {
                *value = 0.0;
            }
        };
        decay(
            &mut self.first_message_deliveries,
            params.first_message_deliveries_decay,
        );
        decay(
            &mut self.mesh_message_deliveries,
            params.mesh_message_deliveries_decay,
        );
        decay(&mut self.mesh_failure_penalty, params.mesh_failure_penalty_decay);
        decay(
            &mut self.invalid_message_deliveries,
            params.invalid_message_deliveries_decay,
        );
    }
}

#[derive(Debug, Clone, Default)]
struct GossipPeerScore {
    topics: HashMap<String, TopicScore>,
    app_specific_score: f64,
    behaviour_penalty: f64,
    /// Set while the peer is disconnected; the entry is dropped after `retain_score`.
    disconnected_at: Option<Instant>,
}

impl GossipPeerScore {
    fn score(&self, params: &PeerScoreParams, now: Instant) -> f64 {
        let mut topic_score = 0.0;
        for (topic, counters) in &self.topics {
            if let Some(topic_params) = params.topics.get(topic) {
                topic_score += counters.score(topic_params, now);
            }
        }
        if params.topic_score_cap > 0.0 {
            topic_score = topic_score.min(params.topic_score_cap);
        }

        let mut score = topic_score + self.app_specific_score * params.app_specific_weight;

        let excess = self.behaviour_penalty - params.behaviour_penalty_threshold;
        if excess > 0.0 {
            score += excess * excess * params.behaviour_penalty_weight;
        }
        score
    }

    fn decay(&mut self, params: &PeerScoreParams) {
        for (topic, counters) in self.topics.iter_mut() {
            if let Some(topic_params) = params.topics.get(topic) {
                counters.decay(topic_params, params.decay_to_zero);
            }
        }
        self.behaviour_penalty *= params.behaviour_penalty_decay;
        if self.behaviour_penalty < params.decay_to_zero {
            self.behaviour_penalty = 0.0;
        }
    }

    fn mesh_joined(&mut self, topic: &str, now: Instant) {
        let counters = self.topics.entry(topic.to_string()).or_default();
        counters.mesh_time = Some(now);
        counters.mesh_message_deliveries = 0.0;
    }

    /// Leaving the mesh with a delivery deficit turns the deficit into a
    /// sticky failure penalty.
    fn mesh_left(&mut self, topic: &str, params: Option<&TopicScoreParams>, now: Instant) {
        let Some(counters) = self.topics.get_mut(topic) else {
            return;
        };
        if let Some(params) = params
            && counters.mesh_active(params, now)
            && counters.mesh_message_deliveries < params.mesh_message_deliveries_threshold
        {
            let deficit = params.mesh_message_deliveries_threshold - counters.mesh_message_deliveries;
            counters.mesh_failure_penalty += deficit * deficit;
        }
        counters.mesh_time = None;
        counters.mesh_message_deliveries = 0.0;
    }

    fn first_message_delivered(&mut self, topic: &str, params: Option<&TopicScoreParams>) {
        let counters = self.topics.entry(topic.to_string()).or_default();
        counters.first_message_deliveries += 1.0;
        if let Some(params) = params {
            counters.first_message_deliveries = counters
                .first_message_deliveries
                .min(params.first_message_deliveries_cap);
        }
        Self::count_mesh_delivery(counters, params);
    }

    fn mesh_message_delivered(&mut self, topic: &str, params: Option<&TopicScoreParams>) {
        if let Some(counters) = self.topics.get_mut(topic) {
            Self::count_mesh_delivery(counters, params);
        }
    }

    fn count_mesh_delivery(counters: &mut TopicScore, params: Option<&TopicScoreParams>) {
        if counters.mesh_time.is_none() {
            return;
        }
        counters.mesh_message_deliveries += 1.0;
        if let Some(params) = params {
            counters.mesh_message_deliveries = counters
                .mesh_message_deliveries
                .min(params.mesh_message_deliveries_cap);
        }
    }

    fn invalid_message(&mut self, topic: &str) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .invalid_message_deliveries += 1.0;
    }

    fn add_behaviour_penalty(&mut self, penalty: f64) {
        self.behaviour_penalty += penalty;
    }
}

// ============================================================================
// Delivery Tracking
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeliveryStatus {
    Pending,
    Valid,
    Invalid,
    Ignored,
}

struct DeliveryRecord {
    topic: String,
    first_seen: Instant,
    validated: Option<Instant>,
    status: DeliveryStatus,
    /// Every peer that sent this message, first sender included.
    peers: HashSet<PeerId>,
    /// Raw frame payload, kept until validation completes.
    raw: Option<Vec<u8>>,
}

struct CachedMessage {
    topic: String,
    data: Vec<u8>,
    inserted: Instant,
}

/// Outbound frame queue for one peer.
struct PeerWriter {
    tx: mpsc::UnboundedSender<GossipFrame>,
    queued_bytes: Arc<AtomicUsize>,
}

fn frame_size(frame: &GossipFrame) -> usize {
    match frame {
        GossipFrame::Publish { topic, data } => topic.len() + data.len(),
        GossipFrame::IHave { topic, ids } => topic.len() + ids.len() * MESSAGE_ID_LEN,
        GossipFrame::IWant { ids } => ids.len() * MESSAGE_ID_LEN,
        GossipFrame::Subscribe { topic }
        | GossipFrame::Unsubscribe { topic }
        | GossipFrame::Graft { topic }
        | GossipFrame::Prune { topic, .. } => topic.len() + 8,
    }
}

fn spawn_writer(
    peer: PeerId,
    sender: Arc<dyn GossipSender>,
    cancel: CancellationToken,
) -> PeerWriter {
    let (tx, mut rx) = mpsc::unbounded_channel::<GossipFrame>();
    let queued_bytes = Arc::new(AtomicUsize::new(0));
    let queued = queued_bytes.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let size = frame_size(&frame);
            let kind = frame.kind();
            if let Err(e) = sender.send_gossip(&peer, frame).await {
                debug!(peer = %peer.short(), frame = kind, error = %e, "gossip send failed");
            }
            queued.fetch_sub(size, Ordering::AcqRel);
        }
        trace!(peer = %peer.short(), "gossip writer stopped");
    });
    PeerWriter { tx, queued_bytes }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Subscribe(GossipTopic, oneshot::Sender<Result<()>>),
    Unsubscribe(GossipTopic, oneshot::Sender<Result<()>>),
    Publish(GossipTopic, Vec<u8>, oneshot::Sender<Result<MessageId, PublishError>>),
    PeerConnected { peer: PeerId, outbound: bool },
    PeerDisconnected(PeerId),
    Frame(PeerId, GossipFrame),
    Validated(Box<PendingGossipMessage>, ValidationResult),
    SetScoreParams(Box<PeerScoreParams>),
    SetApplicationScore(PeerId, f64),
    Subscriptions(oneshot::Sender<Vec<GossipTopic>>),
    MeshPeers(GossipTopic, oneshot::Sender<Vec<PeerId>>),
    PeerScore(PeerId, oneshot::Sender<f64>),
    Heartbeat(oneshot::Sender<()>),
}

// ============================================================================
// GossipSub Handle (public API - cheap to clone)
// ============================================================================

/// External collaborators of the gossip engine.
pub struct GossipSubContext {
    pub local: PeerId,
    pub schedule: ForkSchedule,
    pub sender: Arc<dyn GossipSender>,
    pub validator: Arc<dyn GossipValidator>,
    /// Receives every peer's gossip score once per heartbeat.
    pub reputation: Option<PeerReputation>,
}

#[derive(Clone)]
pub struct GossipSub {
    cmd_tx: mpsc::Sender<Command>,
}

impl GossipSub {
    pub fn spawn(
        config: GossipSubConfig,
        thresholds: PeerScoreThresholds,
        ctx: GossipSubContext,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<GossipEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (validation_tx, validation_rx) = mpsc::channel(config.validation_queue_size.max(1));

        tokio::spawn(run_validation_lane(
            ctx.validator.clone(),
            validation_rx,
            cmd_tx.downgrade(),
            cancel.clone(),
        ));

        let actor = GossipSubActor::new(config, thresholds, ctx, event_tx, validation_tx, cancel.clone());
        tokio::spawn(actor.run(cmd_rx, cancel));
        (Self { cmd_tx }, event_rx)
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| anyhow::anyhow!("GossipSub actor closed"))
    }

    pub async fn subscribe(&self, topic: GossipTopic) -> Result<()> {
        self.request(|tx| Command::Subscribe(topic, tx)).await?
    }

    pub async fn unsubscribe(&self, topic: GossipTopic) -> Result<()> {
        self.request(|tx| Command::Unsubscribe(topic, tx)).await?
    }

    /// Publishes an uncompressed payload.
    pub async fn publish(&self, topic: GossipTopic, data: Vec<u8>) -> Result<MessageId, PublishError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish(topic, data, tx))
            .await
            .map_err(|_| PublishError::Closed)?;
        rx.await.map_err(|_| PublishError::Closed)?
    }

    pub async fn peer_connected(&self, peer: PeerId, outbound: bool) -> Result<()> {
        self.send(Command::PeerConnected { peer, outbound }).await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) -> Result<()> {
        self.send(Command::PeerDisconnected(peer)).await
    }

    /// Feeds one inbound frame. Never blocks: a full queue drops the frame.
    pub fn handle_frame(&self, from: PeerId, frame: GossipFrame) -> bool {
        match self.cmd_tx.try_send(Command::Frame(from, frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(peer = %from.short(), "gossip command queue full, dropping frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Replaces the whole score parameter set.
    pub async fn set_score_params(&self, params: PeerScoreParams) -> Result<()> {
        self.send(Command::SetScoreParams(Box::new(params))).await
    }

    pub async fn set_application_score(&self, peer: PeerId, score: f64) -> Result<()> {
        self.send(Command::SetApplicationScore(peer, score)).await
    }

    pub async fn subscriptions(&self) -> Result<Vec<GossipTopic>> {
        self.request(Command::Subscriptions).await
    }

    pub async fn mesh_peers(&self, topic: GossipTopic) -> Result<Vec<PeerId>> {
        self.request(|tx| Command::MeshPeers(topic, tx)).await
    }

    pub async fn peer_score(&self, peer: PeerId) -> Result<f64> {
        self.request(|tx| Command::PeerScore(peer, tx)).await
    }

    /// Runs one heartbeat now instead of waiting for the interval.
    pub async fn heartbeat(&self) -> Result<()> {
        self.request(Command::Heartbeat).await
    }
}

#[async_trait]
impl GossipSubscriber for GossipSub {
    async fn subscribe_topic(&self, topic: GossipTopic) -> Result<()> {
        self.subscribe(topic).await
    }

    async fn unsubscribe_topic(&self, topic: GossipTopic) -> Result<()> {
        self.unsubscribe(topic).await
    }

    async fn mesh_peer_count(&self, topic: GossipTopic) -> Result<usize> {
        Ok(self.mesh_peers(topic).await?.len())
    }
}

// ============================================================================
// Validation Lane
// ============================================================================

async fn run_validation_lane(
    validator: Arc<dyn GossipValidator>,
    mut rx: mpsc::Receiver<PendingGossipMessage>,
    actor: mpsc::WeakSender<Command>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let result = match validator.validate(&msg).await {
            Ok(result) => result,
            Err(e) => {
                debug!(topic = %msg.topic, error = %e, "validator error, ignoring message");
                ValidationResult::Ignore
            }
        };
        let Some(actor) = actor.upgrade() else {
            break;
        };
        if actor
            .send(Command::Validated(Box::new(msg), result))
            .await
            .is_err()
        {
            break;
        }
    }
    trace!("validation lane stopped");
}

// ============================================================================
// GossipSub Actor (owns state)
// ============================================================================

type BackoffKey = (PeerId, String);

struct GossipSubActor {
    config: GossipSubConfig,
    thresholds: PeerScoreThresholds,
    params: PeerScoreParams,
    local: PeerId,
    schedule: ForkSchedule,
    sender: Arc<dyn GossipSender>,
    reputation: Option<PeerReputation>,
    events: mpsc::Sender<GossipEvent>,
    validation_tx: mpsc::Sender<PendingGossipMessage>,
    cancel: CancellationToken,

    topic_cache: TopicCache,
    /// Subscribed topics and their mesh.
    mesh: HashMap<String, HashSet<PeerId>>,
    /// Peers used for publishing on unsubscribed topics, with last use.
    fanout: HashMap<String, (HashSet<PeerId>, Instant)>,
    topic_peers: HashMap<String, HashSet<PeerId>>,
    peer_topics: HashMap<PeerId, HashSet<String>>,
    outbound: HashSet<PeerId>,
    writers: HashMap<PeerId, PeerWriter>,

    scores: LruCache<PeerId, GossipPeerScore>,
    last_decay: Instant,
    backoff: LruCache<BackoffKey, Instant>,
    fast_ids: LruCache<FastMessageId, MessageId>,
    deliveries: LruCache<MessageId, DeliveryRecord>,
    mcache: LruCache<MessageId, CachedMessage>,
    promises: HashMap<MessageId, (PeerId, Instant)>,
}

impl GossipSubActor {
    fn new(
        config: GossipSubConfig,
        thresholds: PeerScoreThresholds,
        ctx: GossipSubContext,
        events: mpsc::Sender<GossipEvent>,
        validation_tx: mpsc::Sender<PendingGossipMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let cap = |n: usize| NonZeroUsize::new(n.max(1)).expect("capacity is at least 1");
        Self {
            scores: LruCache::new(cap(MAX_SCORED_PEERS)),
            backoff: LruCache::new(cap(MAX_BACKOFF_ENTRIES)),
            fast_ids: LruCache::new(cap(config.fast_id_cache_size)),
            deliveries: LruCache::new(cap(config.seen_cache_size)),
            mcache: LruCache::new(cap(config.message_cache_size)),
            config,
            thresholds,
            params: PeerScoreParams::default(),
            local: ctx.local,
            schedule: ctx.schedule,
            sender: ctx.sender,
            reputation: ctx.reputation,
            events,
            validation_tx,
            cancel,
            topic_cache: TopicCache::new(),
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            topic_peers: HashMap::new(),
            peer_topics: HashMap::new(),
            outbound: HashSet::new(),
            writers: HashMap::new(),
            last_decay: Instant::now(),
            promises: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("GossipSub actor cancelled");
                    break;
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("GossipSub handle dropped, actor quitting");
                        break;
                    };
                    self.handle_command(cmd).await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe(topic, reply) => {
                let _ = reply.send(self.handle_subscribe_cmd(topic));
            }
            Command::Unsubscribe(topic, reply) => {
                let _ = reply.send(self.handle_unsubscribe_cmd(topic));
            }
            Command::Publish(topic, data, reply) => {
                let _ = reply.send(self.handle_publish_cmd(topic, data));
            }
            Command::PeerConnected { peer, outbound } => self.handle_peer_connected(peer, outbound),
            Command::PeerDisconnected(peer) => self.handle_peer_disconnected(peer),
            Command::Frame(from, frame) => self.handle_frame(from, frame),
            Command::Validated(msg, result) => self.handle_validated(*msg, result),
            Command::SetScoreParams(params) => {
                debug!(topics = params.topics.len(), "installing gossip score parameters");
                self.params = *params;
            }
            Command::SetApplicationScore(peer, score) => {
                self.score_entry(&peer).app_specific_score = score;
            }
            Command::Subscriptions(reply) => {
                let topics = self
                    .mesh
                    .keys()
                    .filter_map(|t| self.topic_cache.get_topic(t))
                    .collect();
                let _ = reply.send(topics);
            }
            Command::MeshPeers(topic, reply) => {
                let peers = match self.topic_cache.set_topic(&self.schedule, topic) {
                    Ok(topic_str) => self
                        .mesh
                        .get(&topic_str)
                        .map(|m| m.iter().copied().collect())
                        .unwrap_or_default(),
                    Err(_) => Vec::new(),
                };
                let _ = reply.send(peers);
            }
            Command::PeerScore(peer, reply) => {
                let _ = reply.send(self.peer_score(&peer, Instant::now()));
            }
            Command::Heartbeat(reply) => {
                self.heartbeat().await;
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Score helpers
    // ------------------------------------------------------------------------

    fn score_entry(&mut self, peer: &PeerId) -> &mut GossipPeerScore {
        self.scores.get_or_insert_mut(*peer, GossipPeerScore::default)
    }

    fn peer_score(&self, peer: &PeerId, now: Instant) -> f64 {
        self.scores
            .peek(peer)
            .map(|s| s.score(&self.params, now))
            .unwrap_or(0.0)
    }

    fn is_graylisted(&self, peer: &PeerId, now: Instant) -> bool {
        self.peer_score(peer, now) < self.thresholds.graylist_threshold
    }

    fn score_mesh_joined(&mut self, peer: &PeerId, topic: &str, now: Instant) {
        self.score_entry(peer).mesh_joined(topic, now);
    }

    fn score_mesh_left(&mut self, peer: &PeerId, topic: &str, now: Instant) {
        let params = self.params.topics.get(topic);
        if let Some(score) = self.scores.get_mut(peer) {
            score.mesh_left(topic, params, now);
        }
    }

    fn score_first_delivery(&mut self, peer: &PeerId, topic: &str) {
        let params = self.params.topics.get(topic);
        self.scores
            .get_or_insert_mut(*peer, GossipPeerScore::default)
            .first_message_delivered(topic, params);
    }

    fn score_mesh_delivery(&mut self, peer: &PeerId, topic: &str) {
        let params = self.params.topics.get(topic);
        if let Some(score) = self.scores.get_mut(peer) {
            score.mesh_message_delivered(topic, params);
        }
    }

    fn score_invalid(&mut self, peer: &PeerId, topic: &str) {
        self.score_entry(peer).invalid_message(topic);
    }

    fn delivery_window(&self, topic: &str) -> Duration {
        self.params
            .topics
            .get(topic)
            .map(|p| p.mesh_message_deliveries_window)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn queue_frame(&mut self, peer: &PeerId, frame: GossipFrame) {
        let Some(writer) = self.writers.get(peer) else {
            trace!(peer = %peer.short(), frame = frame.kind(), "no writer for peer");
            return;
        };
        let size = frame_size(&frame);
        let queued = writer.queued_bytes.load(Ordering::Acquire);
        if queued + size > self.config.max_outbound_buffer_size {
            warn!(
                peer = %peer.short(),
                frame = frame.kind(),
                queued,
                "outbound gossip budget exceeded, dropping frame"
            );
            return;
        }
        writer.queued_bytes.fetch_add(size, Ordering::AcqRel);
        if writer.tx.send(frame).is_err() {
            writer.queued_bytes.fetch_sub(size, Ordering::AcqRel);
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    fn handle_subscribe_cmd(&mut self, topic: GossipTopic) -> Result<()> {
        let topic_str = self.topic_cache.set_topic(&self.schedule, topic)?;
        if self.mesh.contains_key(&topic_str) {
            return Ok(());
        }

        let now = Instant::now();
        let peers: Vec<PeerId> = self.writers.keys().copied().collect();
        for peer in &peers {
            self.queue_frame(peer, GossipFrame::Subscribe { topic: topic_str.clone() });
        }

        let mut candidates: Vec<PeerId> = self
            .fanout
            .remove(&topic_str)
            .map(|(peers, _)| peers.into_iter().collect())
            .unwrap_or_default();
        let mut rest: Vec<PeerId> = self
            .topic_peers
            .get(&topic_str)
            .map(|p| p.iter().copied().filter(|p| !candidates.contains(p)).collect())
            .unwrap_or_default();
        rest.shuffle(&mut rand::thread_rng());
        candidates.extend(rest);

        let mut mesh = HashSet::new();
        for peer in candidates {
            if mesh.len() >= self.config.mesh_n {
                break;
            }
            if self.peer_score(&peer, now) < 0.0 || self.in_backoff(&peer, &topic_str, now) {
                continue;
            }
            mesh.insert(peer);
        }
        for peer in &mesh {
            self.queue_frame(peer, GossipFrame::Graft { topic: topic_str.clone() });
            self.score_mesh_joined(peer, &topic_str, now);
        }

        debug!(topic = %topic, mesh = mesh.len(), "subscribed");
        self.mesh.insert(topic_str, mesh);
        Ok(())
    }

    fn handle_unsubscribe_cmd(&mut self, topic: GossipTopic) -> Result<()> {
        let topic_str = self.topic_cache.set_topic(&self.schedule, topic)?;
        let Some(mesh) = self.mesh.remove(&topic_str) else {
            return Ok(());
        };

        let now = Instant::now();
        let backoff_secs = self.config.prune_backoff.as_secs();
        for peer in &mesh {
            self.queue_frame(
                peer,
                GossipFrame::Prune {
                    topic: topic_str.clone(),
                    backoff_secs,
                },
            );
            self.score_mesh_left(peer, &topic_str, now);
            self.record_backoff(peer, &topic_str, self.config.prune_backoff, now);
        }
        let peers: Vec<PeerId> = self.writers.keys().copied().collect();
        for peer in &peers {
            self.queue_frame(peer, GossipFrame::Unsubscribe { topic: topic_str.clone() });
        }
        debug!(topic = %topic, pruned = mesh.len(), "unsubscribed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------------

    fn handle_publish_cmd(&mut self, topic: GossipTopic, data: Vec<u8>) -> Result<MessageId, PublishError> {
        if data.len() > self.config.max_transmit_size {
            return Err(PublishError::TooLarge {
                size: data.len(),
                limit: self.config.max_transmit_size,
            });
        }
        let topic_str = self.topic_cache.set_topic(&self.schedule, topic)?;
        let raw = messages::compress(&data);
        let msg_id = messages::message_id(&topic_str, &raw);
        if self.deliveries.contains(&msg_id) {
            return Err(PublishError::Duplicate);
        }

        let now = Instant::now();
        let peers = self.publish_peers(&topic_str, now);
        if peers.is_empty() && !self.config.allow_publish_to_zero_peers {
            return Err(PublishError::NoPeers(topic_str));
        }

        self.deliveries.put(
            msg_id,
            DeliveryRecord {
                topic: topic_str.clone(),
                first_seen: now,
                validated: Some(now),
                status: DeliveryStatus::Valid,
                peers: HashSet::new(),
                raw: None,
            },
        );
        self.mcache.put(
            msg_id,
            CachedMessage {
                topic: topic_str.clone(),
                data: raw.clone(),
                inserted: now,
            },
        );
        for peer in &peers {
            self.queue_frame(
                peer,
                GossipFrame::Publish {
                    topic: topic_str.clone(),
                    data: raw.clone(),
                },
            );
        }
        debug!(topic = %topic, ?msg_id, peers = peers.len(), "published");
        Ok(msg_id)
    }

    /// Mesh (plus flood targets) for subscribed topics, fanout otherwise.
    fn publish_peers(&mut self, topic_str: &str, now: Instant) -> HashSet<PeerId> {
        let publish_threshold = self.thresholds.publish_threshold;
        let above = |actor: &Self, p: &PeerId| actor.peer_score(p, now) >= publish_threshold;

        if let Some(mesh) = self.mesh.get(topic_str) {
            let mut peers: HashSet<PeerId> = mesh.iter().copied().filter(|p| above(self, p)).collect();
            if self.config.flood_publish
                && let Some(known) = self.topic_peers.get(topic_str)
            {
                peers.extend(known.iter().copied().filter(|p| above(self, p)));
            }
            return peers;
        }

        if let Some((fanout, _)) = self.fanout.get(topic_str) {
            let peers: HashSet<PeerId> = fanout.iter().copied().filter(|p| above(self, p)).collect();
            if !peers.is_empty() {
                if let Some(entry) = self.fanout.get_mut(topic_str) {
                    entry.1 = now;
                }
                return peers;
            }
        }

        let mut known: Vec<PeerId> = self
            .topic_peers
            .get(topic_str)
            .map(|p| p.iter().copied().filter(|p| above(self, p)).collect())
            .unwrap_or_default();
        known.shuffle(&mut rand::thread_rng());
        known.truncate(self.config.mesh_n);
        let peers: HashSet<PeerId> = known.into_iter().collect();
        if !peers.is_empty() {
            self.fanout.insert(topic_str.to_string(), (peers.clone(), now));
        }
        peers
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    fn handle_peer_connected(&mut self, peer: PeerId, outbound: bool) {
        if peer == self.local || self.writers.contains_key(&peer) {
            return;
        }
        let writer = spawn_writer(peer, self.sender.clone(), self.cancel.child_token());
        self.writers.insert(peer, writer);
        if outbound {
            self.outbound.insert(peer);
        }
        self.score_entry(&peer).disconnected_at = None;

        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in topics {
            self.queue_frame(&peer, GossipFrame::Subscribe { topic });
        }
        trace!(peer = %peer.short(), outbound, "gossip peer connected");
    }

    fn handle_peer_disconnected(&mut self, peer: PeerId) {
        let now = Instant::now();
        self.writers.remove(&peer);
        self.outbound.remove(&peer);

        let topics: Vec<String> = self
            .mesh
            .iter()
            .filter(|(_, m)| m.contains(&peer))
            .map(|(t, _)| t.clone())
            .collect();
        for topic in topics {
            if let Some(mesh) = self.mesh.get_mut(&topic) {
                mesh.remove(&peer);
            }
            self.score_mesh_left(&peer, &topic, now);
        }
        for (peers, _) in self.fanout.values_mut() {
            peers.remove(&peer);
        }
        if let Some(topics) = self.peer_topics.remove(&peer) {
            for topic in topics {
                if let Some(peers) = self.topic_peers.get_mut(&topic) {
                    peers.remove(&peer);
                    if peers.is_empty() {
                        self.topic_peers.remove(&topic);
                    }
                }
            }
        }
        if let Some(score) = self.scores.get_mut(&peer) {
            score.disconnected_at = Some(now);
        }
        trace!(peer = %peer.short(), "gossip peer disconnected");
    }

    // ------------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------------

    fn handle_frame(&mut self, from: PeerId, frame: GossipFrame) {
        let now = Instant::now();
        if !self.writers.contains_key(&from) {
            trace!(peer = %from.short(), "frame from unknown peer");
            return;
        }
        if self.is_graylisted(&from, now) {
            trace!(peer = %from.short(), frame = frame.kind(), "ignoring graylisted peer");
            return;
        }
        match frame {
            GossipFrame::Subscribe { topic } => self.handle_subscribe(from, topic),
            GossipFrame::Unsubscribe { topic } => self.handle_unsubscribe(from, &topic, now),
            GossipFrame::Publish { topic, data } => self.handle_publish(from, topic, data, now),
            GossipFrame::Graft { topic } => self.handle_graft(from, topic, now),
            GossipFrame::Prune { topic, backoff_secs } => {
                self.handle_prune(from, &topic, backoff_secs, now)
            }
            GossipFrame::IHave { topic, ids } => self.handle_ihave(from, &topic, ids, now),
            GossipFrame::IWant { ids } => self.handle_iwant(from, ids, now),
        }
    }

    fn handle_subscribe(&mut self, from: PeerId, topic: String) {
        let topics = self.peer_topics.entry(from).or_default();
        if topics.len() >= MAX_SUBSCRIPTIONS_PER_PEER && !topics.contains(&topic) {
            debug!(peer = %from.short(), "peer subscription limit reached");
            return;
        }
        topics.insert(topic.clone());
        self.topic_peers.entry(topic).or_default().insert(from);
    }

    fn handle_unsubscribe(&mut self, from: PeerId, topic: &str, now: Instant) {
        if let Some(topics) = self.peer_topics.get_mut(&from) {
            topics.remove(topic);
        }
        if let Some(peers) = self.topic_peers.get_mut(topic) {
            peers.remove(&from);
        }
        if let Some(mesh) = self.mesh.get_mut(topic)
            && mesh.remove(&from)
        {
            self.score_mesh_left(&from, topic, now);
        }
    }

    fn handle_graft(&mut self, from: PeerId, topic: String, now: Instant) {
        let backoff_secs = self.config.prune_backoff.as_secs();
        let prune = GossipFrame::Prune {
            topic: topic.clone(),
            backoff_secs,
        };

        let Some(mesh) = self.mesh.get(&topic) else {
            self.queue_frame(&from, prune);
            return;
        };
        if mesh.contains(&from) {
            return;
        }

        if self.in_backoff(&from, &topic, now) {
            debug!(peer = %from.short(), topic = %topic, "GRAFT during backoff");
            self.score_entry(&from).add_behaviour_penalty(1.0);
            self.record_backoff(&from, &topic, self.config.prune_backoff, now);
            self.queue_frame(&from, prune);
            return;
        }
        let full = mesh.len() >= self.config.mesh_n_high && !self.outbound.contains(&from);
        if self.peer_score(&from, now) < 0.0 || full {
            self.record_backoff(&from, &topic, self.config.prune_backoff, now);
            self.queue_frame(&from, prune);
            return;
        }

        if let Some(mesh) = self.mesh.get_mut(&topic) {
            mesh.insert(from);
        }
        self.score_mesh_joined(&from, &topic, now);
        trace!(peer = %from.short(), topic = %topic, "accepted GRAFT");
    }

    fn handle_prune(&mut self, from: PeerId, topic: &str, backoff_secs: u64, now: Instant) {
        if let Some(mesh) = self.mesh.get_mut(topic)
            && mesh.remove(&from)
        {
            self.score_mesh_left(&from, topic, now);
        }
        let backoff = Duration::from_secs(backoff_secs).max(self.config.prune_backoff);
        self.record_backoff(&from, topic, backoff, now);
    }

    fn handle_ihave(&mut self, from: PeerId, topic: &str, ids: Vec<MessageId>, now: Instant) {
        if self.peer_score(&from, now) < self.thresholds.gossip_threshold {
            return;
        }
        if !self.mesh.contains_key(topic) {
            return;
        }
        let wanted: Vec<MessageId> = ids
            .into_iter()
            .take(self.config.max_ihave_length)
            .filter(|id| !self.deliveries.contains(id) && !self.promises.contains_key(id))
            .take(MAX_IWANT_LENGTH)
            .collect();
        if wanted.is_empty() {
            return;
        }
        for id in &wanted {
            if self.promises.len() >= MAX_PROMISES {
                break;
            }
            self.promises.insert(*id, (from, now));
        }
        self.queue_frame(&from, GossipFrame::IWant { ids: wanted });
    }

    fn handle_iwant(&mut self, from: PeerId, ids: Vec<MessageId>, now: Instant) {
        if self.peer_score(&from, now) < self.thresholds.gossip_threshold {
            return;
        }
        let frames: Vec<GossipFrame> = ids
            .iter()
            .take(MAX_IWANT_LENGTH)
            .filter_map(|id| self.mcache.peek(id))
            .map(|cached| GossipFrame::Publish {
                topic: cached.topic.clone(),
                data: cached.data.clone(),
            })
            .collect();
        for frame in frames {
            self.queue_frame(&from, frame);
        }
    }

    fn handle_publish(&mut self, from: PeerId, topic_str: String, data: Vec<u8>, now: Instant) {
        if data.len() > self.config.max_transmit_size {
            debug!(peer = %from.short(), size = data.len(), "oversized gossip message");
            return;
        }
        let Some(topic) = self.topic_cache.get_topic(&topic_str) else {
            trace!(peer = %from.short(), topic = %topic_str, "dropping message on unknown topic");
            return;
        };
        if !self.mesh.contains_key(&topic_str) {
            trace!(topic = %topic, "dropping message on unsubscribed topic");
            return;
        }

        let msg_id = self.resolve_message_id(&topic_str, &data);
        self.promises.remove(&msg_id);

        if let Some(record) = self.deliveries.get_mut(&msg_id) {
            if !record.peers.insert(from) {
                return;
            }
            let (status, validated) = (record.status, record.validated);
            match status {
                DeliveryStatus::Valid => {
                    let window = self.delivery_window(&topic_str);
                    if validated.is_some_and(|v| now.duration_since(v) <= window) {
                        self.score_mesh_delivery(&from, &topic_str);
                    }
                }
                DeliveryStatus::Invalid => self.score_invalid(&from, &topic_str),
                DeliveryStatus::Pending | DeliveryStatus::Ignored => {}
            }
            return;
        }

        let uncompressed = match messages::decompress(&data, MAX_PAYLOAD_SIZE) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(peer = %from.short(), topic = %topic, error = %e, "undecodable gossip payload");
                self.deliveries.put(
                    msg_id,
                    DeliveryRecord {
                        topic: topic_str.clone(),
                        first_seen: now,
                        validated: None,
                        status: DeliveryStatus::Invalid,
                        peers: HashSet::from([from]),
                        raw: None,
                    },
                );
                self.score_invalid(&from, &topic_str);
                return;
            }
        };

        let pending = PendingGossipMessage {
            topic,
            topic_str: topic_str.clone(),
            msg_id,
            from,
            data: uncompressed,
            seen_at: now,
        };
        let mut record = DeliveryRecord {
            topic: topic_str,
            first_seen: now,
            validated: None,
            status: DeliveryStatus::Pending,
            peers: HashSet::from([from]),
            raw: Some(data),
        };
        match self.validation_tx.try_send(pending) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(topic = %topic, ?msg_id, "validation queue full, dropping message");
                record.status = DeliveryStatus::Ignored;
                record.raw = None;
            }
            Err(TrySendError::Closed(_)) => {
                warn!("validation lane closed");
                record.status = DeliveryStatus::Ignored;
                record.raw = None;
            }
        }
        self.deliveries.put(msg_id, record);
    }

    fn resolve_message_id(&mut self, topic: &str, data: &[u8]) -> MessageId {
        let fast = messages::fast_message_id(topic, data);
        if let Some(id) = self.fast_ids.get(&fast) {
            return *id;
        }
        let id = messages::message_id(topic, data);
        self.fast_ids.put(fast, id);
        id
    }

    fn handle_validated(&mut self, msg: PendingGossipMessage, result: ValidationResult) {
        let now = Instant::now();
        let window = self.delivery_window(&msg.topic_str);
        let Some(record) = self.deliveries.get_mut(&msg.msg_id) else {
            trace!(msg_id = ?msg.msg_id, "validation result for evicted message");
            return;
        };
        if record.status != DeliveryStatus::Pending {
            return;
        }
        let peers: Vec<PeerId> = record.peers.iter().copied().collect();
        let first_seen = record.first_seen;
        let raw = record.raw.take();
        record.status = match result {
            ValidationResult::Accept => DeliveryStatus::Valid,
            ValidationResult::Reject => DeliveryStatus::Invalid,
            ValidationResult::Ignore => DeliveryStatus::Ignored,
        };
        if result == ValidationResult::Accept {
            record.validated = Some(now);
        }

        match result {
            ValidationResult::Accept => {
                self.score_first_delivery(&msg.from, &msg.topic_str);
                if now.duration_since(first_seen) <= window {
                    for peer in peers.iter().filter(|p| **p != msg.from) {
                        self.score_mesh_delivery(peer, &msg.topic_str);
                    }
                }
                if let Some(raw) = raw {
                    self.forward(&msg, &peers, raw, now);
                }
                let delivered = ReceivedMessage {
                    topic: msg.topic,
                    msg_id: msg.msg_id,
                    from: msg.from,
                    data: msg.data,
                };
                if let Err(e) = self.events.try_send(GossipEvent::Message(delivered)) {
                    warn!(error = %e, "gossip event channel full, dropping message");
                }
            }
            ValidationResult::Reject => {
                debug!(peer = %msg.from.short(), topic = %msg.topic, "rejected gossip message");
                for peer in &peers {
                    self.score_invalid(peer, &msg.topic_str);
                }
            }
            ValidationResult::Ignore => {
                trace!(topic = %msg.topic, "ignored gossip message");
            }
        }
    }

    fn forward(&mut self, msg: &PendingGossipMessage, seen_from: &[PeerId], raw: Vec<u8>, now: Instant) {
        self.mcache.put(
            msg.msg_id,
            CachedMessage {
                topic: msg.topic_str.clone(),
                data: raw.clone(),
                inserted: now,
            },
        );
        let targets: Vec<PeerId> = self
            .mesh
            .get(&msg.topic_str)
            .map(|mesh| {
                mesh.iter()
                    .copied()
                    .filter(|p| !seen_from.contains(p))
                    .collect()
            })
            .unwrap_or_default();
        for peer in targets {
            if self.peer_score(&peer, now) < self.thresholds.publish_threshold {
                continue;
            }
            self.queue_frame(
                &peer,
                GossipFrame::Publish {
                    topic: msg.topic_str.clone(),
                    data: raw.clone(),
                },
            );
        }
    }

    // ------------------------------------------------------------------------
    // Backoff
    // ------------------------------------------------------------------------

    fn record_backoff(&mut self, peer: &PeerId, topic: &str, backoff: Duration, now: Instant) {
        let key = (*peer, topic.to_string());
        let until = now + backoff;
        let current = self.backoff.peek(&key).copied();
        if current.is_none_or(|c| c < until) {
            self.backoff.put(key, until);
        }
    }

    fn in_backoff(&self, peer: &PeerId, topic: &str, now: Instant) -> bool {
        self.backoff
            .peek(&(*peer, topic.to_string()))
            .is_some_and(|until| *until > now)
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_decay) >= self.params.decay_interval {
            self.decay_scores(now);
            self.last_decay = now;
        }

        let graylisted: Vec<PeerId> = self
            .writers
            .keys()
            .copied()
            .filter(|p| self.is_graylisted(p, now))
            .collect();
        for peer in graylisted {
            debug!(peer = %peer.short(), "peer graylisted");
            if self.events.try_send(GossipEvent::Graylisted(peer)).is_err() {
                warn!(peer = %peer.short(), "gossip event channel full, graylist notice dropped");
            }
        }

        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in &topics {
            self.maintain_mesh(topic, now);
            self.emit_gossip(topic, now);
        }

        self.fanout
            .retain(|_, (_, last_pub)| now.duration_since(*last_pub) < self.config.fanout_ttl);
        self.expire_promises(now);
        self.push_scores(now).await;
    }

    fn decay_scores(&mut self, now: Instant) {
        let retain = self.params.retain_score;
        let mut expired = Vec::new();
        for (peer, score) in self.scores.iter_mut() {
            if score
                .disconnected_at
                .is_some_and(|t| now.duration_since(t) >= retain)
            {
                expired.push(*peer);
                continue;
            }
            score.decay(&self.params);
        }
        for peer in expired {
            self.scores.pop(&peer);
        }
    }

    fn maintain_mesh(&mut self, topic: &str, now: Instant) {
        let Some(mesh) = self.mesh.get(topic) else {
            return;
        };
        let mut scored: Vec<(PeerId, f64)> = mesh
            .iter()
            .map(|p| (*p, self.peer_score(p, now)))
            .collect();

        let mut pruned: Vec<PeerId> = scored
            .iter()
            .filter(|(_, s)| *s < 0.0)
            .map(|(p, _)| *p)
            .collect();
        scored.retain(|(_, s)| *s >= 0.0);

        let mut grafted = Vec::new();
        if scored.len() < self.config.mesh_n_low {
            let needed = self.config.mesh_n - scored.len();
            grafted = self.graft_candidates(topic, &scored, &pruned, now, |_| true);
            grafted.truncate(needed);
        }

        if scored.len() > self.config.mesh_n_high {
            let mut by_score = scored.clone();
            by_score.shuffle(&mut rand::thread_rng());
            by_score.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let mut keep: Vec<PeerId> = by_score
                .iter()
                .take(self.config.mesh_n)
                .map(|(p, _)| *p)
                .collect();
            let outbound_kept = keep.iter().filter(|p| self.outbound.contains(p)).count();
            if outbound_kept < self.config.mesh_outbound_min {
                let missing = self.config.mesh_outbound_min - outbound_kept;
                let extra: Vec<PeerId> = by_score
                    .iter()
                    .skip(self.config.mesh_n)
                    .map(|(p, _)| *p)
                    .filter(|p| self.outbound.contains(p))
                    .take(missing)
                    .collect();
                for peer in extra {
                    if let Some(pos) = keep.iter().rposition(|p| !self.outbound.contains(p)) {
                        keep.remove(pos);
                    }
                    keep.push(peer);
                }
            }
            pruned.extend(scored.iter().map(|(p, _)| *p).filter(|p| !keep.contains(p)));
        } else if !scored.is_empty() && scored.len() >= self.config.mesh_n_low {
            let mut scores: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();
            scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let median = scores[scores.len() / 2];
            if median < self.thresholds.opportunistic_graft_threshold {
                let mut better =
                    self.graft_candidates(topic, &scored, &pruned, now, |s| s > median);
                better.truncate(OPPORTUNISTIC_GRAFT_PEERS);
                if !better.is_empty() {
                    debug!(topic = %topic, median, grafted = better.len(), "opportunistic graft");
                }
                grafted.extend(better);
            }
        }

        let backoff_secs = self.config.prune_backoff.as_secs();
        for peer in &pruned {
            if let Some(mesh) = self.mesh.get_mut(topic) {
                mesh.remove(peer);
            }
            self.score_mesh_left(peer, topic, now);
            self.record_backoff(peer, topic, self.config.prune_backoff, now);
            self.queue_frame(
                peer,
                GossipFrame::Prune {
                    topic: topic.to_string(),
                    backoff_secs,
                },
            );
        }
        for peer in &grafted {
            if let Some(mesh) = self.mesh.get_mut(topic) {
                mesh.insert(*peer);
            }
            self.score_mesh_joined(peer, topic, now);
            self.queue_frame(peer, GossipFrame::Graft { topic: topic.to_string() });
        }
        if !pruned.is_empty() || !grafted.is_empty() {
            debug!(
                topic = %topic,
                pruned = pruned.len(),
                grafted = grafted.len(),
                mesh = self.mesh.get(topic).map_or(0, |m| m.len()),
                "mesh maintenance"
            );
        }
    }

    /// Known topic peers outside the mesh that may be grafted, shuffled.
    fn graft_candidates(
        &self,
        topic: &str,
        mesh: &[(PeerId, f64)],
        excluded: &[PeerId],
        now: Instant,
        accept: impl Fn(f64) -> bool,
    ) -> Vec<PeerId> {
        let mut candidates: Vec<PeerId> = self
            .topic_peers
            .get(topic)
            .map(|peers| {
                peers
                    .iter()
                    .copied()
                    .filter(|p| !mesh.iter().any(|(m, _)| m == p) && !excluded.contains(p))
                    .filter(|p| !self.in_backoff(p, topic, now))
                    .filter(|p| {
                        let score = self.peer_score(p, now);
                        score >= 0.0 && accept(score)
                    })
                    .collect()
            })
            .unwrap_or_default();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    fn emit_gossip(&mut self, topic: &str, now: Instant) {
        let history = self.config.heartbeat_interval * self.config.gossip_history;
        let ids: Vec<MessageId> = self
            .mcache
            .iter()
            .filter(|(_, m)| m.topic == topic && now.duration_since(m.inserted) <= history)
            .map(|(id, _)| *id)
            .take(self.config.max_ihave_length)
            .collect();
        if ids.is_empty() {
            return;
        }

        let mesh = self.mesh.get(topic);
        let mut targets: Vec<PeerId> = self
            .topic_peers
            .get(topic)
            .map(|peers| {
                peers
                    .iter()
                    .copied()
                    .filter(|p| !mesh.is_some_and(|m| m.contains(p)))
                    .filter(|p| self.peer_score(p, now) >= self.thresholds.gossip_threshold)
                    .collect()
            })
            .unwrap_or_default();
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(self.config.gossip_lazy);

        for peer in targets {
            self.queue_frame(
                &peer,
                GossipFrame::IHave {
                    topic: topic.to_string(),
                    ids: ids.clone(),
                },
            );
        }
    }

    /// Unfulfilled IWANT requests count as broken promises.
    fn expire_promises(&mut self, now: Instant) {
        let followup = self.config.iwant_followup_time;
        let mut broken = Vec::new();
        self.promises.retain(|_, (peer, asked)| {
            if now.duration_since(*asked) >= followup {
                broken.push(*peer);
                false
            } else {
                true
            }
        });
        for peer in broken {
            trace!(peer = %peer.short(), "broken IWANT promise");
            self.score_entry(&peer).add_behaviour_penalty(1.0);
        }
    }

    async fn push_scores(&mut self, now: Instant) {
        let Some(reputation) = &self.reputation else {
            return;
        };
        let scores: Vec<(PeerId, f64)> = self
            .writers
            .keys()
            .map(|p| (*p, self.peer_score(p, now)))
            .collect();
        if scores.is_empty() {
            return;
        }
        if let Err(e) = reputation.update_gossip_scores(scores).await {
            debug!(error = %e, "could not push gossip scores");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ForkName;
    use crate::topic::{GossipType, stringify_topic};

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    struct ChannelSender(mpsc::UnboundedSender<(PeerId, GossipFrame)>);

    #[async_trait]
    impl GossipSender for ChannelSender {
        async fn send_gossip(&self, to: &PeerId, frame: GossipFrame) -> Result<()> {
            let _ = self.0.send((*to, frame));
            Ok(())
        }
    }

    struct FixedValidator(ValidationResult);

    #[async_trait]
    impl GossipValidator for FixedValidator {
        async fn validate(&self, _message: &PendingGossipMessage) -> Result<ValidationResult> {
            Ok(self.0)
        }
    }

    struct Harness {
        gossip: GossipSub,
        events: mpsc::Receiver<GossipEvent>,
        sent: mpsc::UnboundedReceiver<(PeerId, GossipFrame)>,
        schedule: ForkSchedule,
        _cancel: CancellationToken,
    }

    fn harness(config: GossipSubConfig, verdict: ValidationResult) -> Harness {
        let (tx, sent) = mpsc::unbounded_channel();
        let schedule = ForkSchedule::single(ForkName::Phase0, [0u8; 32]);
        let cancel = CancellationToken::new();
        let (gossip, events) = GossipSub::spawn(
            config,
            PeerScoreThresholds::default(),
            GossipSubContext {
                local: peer(0),
                schedule: schedule.clone(),
                sender: Arc::new(ChannelSender(tx)),
                validator: Arc::new(FixedValidator(verdict)),
                reputation: None,
            },
            cancel.clone(),
        );
        Harness {
            gossip,
            events,
            sent,
            schedule,
            _cancel: cancel,
        }
    }

    fn block_topic() -> GossipTopic {
        GossipTopic::new(ForkName::Phase0, GossipType::BeaconBlock)
    }

    fn strict_params(topic: &str) -> PeerScoreParams {
        let mut params = PeerScoreParams::default();
        params.topics.insert(
            topic.to_string(),
            TopicScoreParams {
                topic_weight: 1.0,
                time_in_mesh_weight: 0.0,
                first_message_deliveries_weight: 0.0,
                invalid_message_deliveries_weight: -10.0,
                invalid_message_deliveries_decay: 0.9,
                ..TopicScoreParams::default()
            },
        );
        params
    }

    async fn next_frame(h: &mut Harness) -> (PeerId, GossipFrame) {
        tokio::time::timeout(Duration::from_secs(1), h.sent.recv())
            .await
            .expect("frame within timeout")
            .expect("sender open")
    }

    #[test]
    fn config_defaults_match_mesh_degree() {
        let config = GossipSubConfig::default();
        assert_eq!(config.mesh_n, 8);
        assert_eq!(config.mesh_n_low, 6);
        assert_eq!(config.mesh_n_high, 12);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(700));
        assert_eq!(config.max_outbound_buffer_size, 16 * 1024 * 1024);
        assert!(!config.allow_publish_to_zero_peers);
    }

    #[test]
    fn topic_score_components() {
        let now = Instant::now();
        let params = TopicScoreParams {
            topic_weight: 0.5,
            time_in_mesh_weight: 1.0,
            time_in_mesh_quantum: Duration::from_secs(1),
            time_in_mesh_cap: 10.0,
            first_message_deliveries_weight: 2.0,
            mesh_message_deliveries_weight: -1.0,
            mesh_message_deliveries_threshold: 4.0,
            mesh_message_deliveries_cap: 8.0,
            mesh_message_deliveries_activation: Duration::from_secs(5),
            invalid_message_deliveries_weight: -3.0,
            ..TopicScoreParams::default()
        };
        let score = TopicScore {
            mesh_time: Some(now),
            first_message_deliveries: 3.0,
            mesh_message_deliveries: 1.0,
            mesh_failure_penalty: 0.0,
            invalid_message_deliveries: 2.0,
        };
        // Not yet activated: P1 = 2, P2 = 6, P4 = -12.
        let early = score.score(&params, now + Duration::from_secs(2));
        assert!((early - 0.5 * (2.0 + 6.0 - 12.0)).abs() < 1e-9);

        // Activated, P1 capped at 10, deficit 3 gives P3 = -9.
        let late = score.score(&params, now + Duration::from_secs(60));
        assert!((late - 0.5 * (10.0 + 6.0 - 9.0 - 12.0)).abs() < 1e-9);
    }

    #[test]
    fn leaving_mesh_with_deficit_is_penalized() {
        let now = Instant::now();
        let params = TopicScoreParams {
            mesh_message_deliveries_threshold: 3.0,
            mesh_message_deliveries_activation: Duration::from_secs(1),
            ..TopicScoreParams::default()
        };
        let mut score = GossipPeerScore::default();
        score.mesh_joined("t", now);
        score.mesh_message_delivered("t", Some(&params));
        score.mesh_left("t", Some(&params), now + Duration::from_secs(2));
        let counters = &score.topics["t"];
        assert_eq!(counters.mesh_failure_penalty, 4.0);
        assert!(counters.mesh_time.is_none());

        let mut early = GossipPeerScore::default();
        early.mesh_joined("t", now);
        early.mesh_left("t", Some(&params), now);
        assert_eq!(early.topics["t"].mesh_failure_penalty, 0.0);
    }

    #[test]
    fn delivery_counters_are_capped() {
        let params = TopicScoreParams {
            first_message_deliveries_cap: 2.0,
            mesh_message_deliveries_cap: 3.0,
            ..TopicScoreParams::default()
        };
        let mut score = GossipPeerScore::default();
        score.mesh_joined("t", Instant::now());
        for _ in 0..10 {
            score.first_message_delivered("t", Some(&params));
        }
        assert_eq!(score.topics["t"].first_message_deliveries, 2.0);
        assert_eq!(score.topics["t"].mesh_message_deliveries, 3.0);
    }

    #[test]
    fn topic_cap_and_behaviour_penalty() {
        let now = Instant::now();
        let mut params = PeerScoreParams {
            topic_score_cap: 5.0,
            behaviour_penalty_threshold: 1.0,
            behaviour_penalty_weight: -2.0,
            ..PeerScoreParams::default()
        };
        params.topics.insert(
            "t".to_string(),
            TopicScoreParams {
                topic_weight: 1.0,
                first_message_deliveries_weight: 1.0,
                first_message_deliveries_cap: 100.0,
                ..TopicScoreParams::default()
            },
        );
        let mut score = GossipPeerScore::default();
        for _ in 0..50 {
            score.first_message_delivered("t", params.topics.get("t"));
        }
        assert_eq!(score.score(&params, now), 5.0);

        score.add_behaviour_penalty(4.0);
        assert_eq!(score.score(&params, now), 5.0 - 2.0 * 9.0);
    }

    #[test]
    fn decay_zeroes_small_counters() {
        let mut params = PeerScoreParams::default();
        params.topics.insert(
            "t".to_string(),
            TopicScoreParams {
                first_message_deliveries_decay: 0.5,
                ..TopicScoreParams::default()
            },
        );
        let mut score = GossipPeerScore::default();
        score.first_message_delivered("t", None);
        for _ in 0..10 {
            score.decay(&params);
        }
        assert_eq!(score.topics["t"].first_message_deliveries, 0.0);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let mut h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        h.gossip.peer_connected(peer(1), true).await.expect("connect");
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        h.gossip.subscribe(block_topic()).await.expect("subscribe again");

        assert_eq!(h.gossip.subscriptions().await.expect("subs"), vec![block_topic()]);
        let (to, frame) = next_frame(&mut h).await;
        assert_eq!(to, peer(1));
        assert!(matches!(frame, GossipFrame::Subscribe { .. }));
        assert!(h.sent.try_recv().is_err());

        h.gossip.unsubscribe(block_topic()).await.expect("unsubscribe");
        h.gossip.unsubscribe(block_topic()).await.expect("unsubscribe again");
        assert!(h.gossip.subscriptions().await.expect("subs").is_empty());
    }

    #[tokio::test]
    async fn publish_without_peers_fails_unless_allowed() {
        let h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        let result = h.gossip.publish(block_topic(), vec![1, 2, 3]).await;
        assert!(matches!(result, Err(PublishError::NoPeers(_))));

        let config = GossipSubConfig {
            allow_publish_to_zero_peers: true,
            ..GossipSubConfig::default()
        };
        let h = harness(config, ValidationResult::Accept);
        h.gossip
            .publish(block_topic(), vec![1, 2, 3])
            .await
            .expect("zero-peer publish allowed");
        assert_eq!(
            h.gossip.publish(block_topic(), vec![1, 2, 3]).await,
            Err(PublishError::Duplicate)
        );
    }

    #[tokio::test]
    async fn publish_reaches_topic_peers() {
        let mut h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");
        h.gossip.handle_frame(peer(1), GossipFrame::Subscribe { topic: topic_str.clone() });

        let id = h.gossip.publish(block_topic(), vec![7; 64]).await.expect("publish");
        let (to, frame) = next_frame(&mut h).await;
        assert_eq!(to, peer(1));
        match frame {
            GossipFrame::Publish { topic, data } => {
                assert_eq!(topic, topic_str);
                assert_eq!(messages::message_id(&topic, &data), id);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_message_is_delivered_once() {
        let mut h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");
        h.gossip.peer_connected(peer(2), false).await.expect("connect");

        let raw = messages::compress(b"block");
        for from in [peer(1), peer(2), peer(1)] {
            h.gossip.handle_frame(
                from,
                GossipFrame::Publish {
                    topic: topic_str.clone(),
                    data: raw.clone(),
                },
            );
        }

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        match event {
            GossipEvent::Message(msg) => {
                assert_eq!(msg.from, peer(1));
                assert_eq!(msg.data, b"block".to_vec());
                assert_eq!(msg.topic, block_topic());
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.gossip.heartbeat().await.expect("heartbeat");
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_topic_is_dropped_without_penalty() {
        let mut h = harness(GossipSubConfig::default(), ValidationResult::Reject);
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");
        h.gossip.handle_frame(
            peer(1),
            GossipFrame::Publish {
                topic: "/eth2/00000000/future_type/lz4_bincode".to_string(),
                data: messages::compress(b"x"),
            },
        );
        h.gossip.heartbeat().await.expect("heartbeat");
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.gossip.peer_score(peer(1)).await.expect("score"), 0.0);
    }

    #[tokio::test]
    async fn rejected_messages_lower_score() {
        let h = harness(GossipSubConfig::default(), ValidationResult::Reject);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip
            .set_score_params(strict_params(&topic_str))
            .await
            .expect("params");
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");

        for n in 0..3u8 {
            h.gossip.handle_frame(
                peer(1),
                GossipFrame::Publish {
                    topic: topic_str.clone(),
                    data: messages::compress(&[n; 8]),
                },
            );
        }

        let mut score = 0.0;
        for _ in 0..50 {
            score = h.gossip.peer_score(peer(1)).await.expect("score");
            if score <= -90.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(score, -90.0);
    }

    #[tokio::test]
    async fn undecodable_payload_counts_as_invalid() {
        let h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip
            .set_score_params(strict_params(&topic_str))
            .await
            .expect("params");
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");
        h.gossip.handle_frame(
            peer(1),
            GossipFrame::Publish {
                topic: topic_str,
                data: vec![0xff; 3],
            },
        );
        assert_eq!(h.gossip.peer_score(peer(1)).await.expect("score"), -10.0);
    }

    #[tokio::test]
    async fn graft_and_prune_update_mesh() {
        let mut h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");
        let _ = next_frame(&mut h).await;

        h.gossip.handle_frame(peer(1), GossipFrame::Graft { topic: topic_str.clone() });
        assert_eq!(h.gossip.mesh_peer_count(block_topic()).await.expect("count"), 1);

        h.gossip.handle_frame(
            peer(1),
            GossipFrame::Prune {
                topic: topic_str.clone(),
                backoff_secs: 60,
            },
        );
        assert_eq!(h.gossip.mesh_peer_count(block_topic()).await.expect("count"), 0);

        // GRAFT inside the backoff window is refused with a PRUNE.
        h.gossip.handle_frame(peer(1), GossipFrame::Graft { topic: topic_str.clone() });
        assert_eq!(h.gossip.mesh_peer_count(block_topic()).await.expect("count"), 0);
        let (_, frame) = next_frame(&mut h).await;
        assert!(matches!(frame, GossipFrame::Prune { .. }));
    }

    #[tokio::test]
    async fn heartbeat_grafts_known_topic_peers() {
        let h = harness(GossipSubConfig::default(), ValidationResult::Accept);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip.subscribe(block_topic()).await.expect("subscribe");
        for n in 1..=10 {
            h.gossip.peer_connected(peer(n), n % 2 == 0).await.expect("connect");
            h.gossip.handle_frame(peer(n), GossipFrame::Subscribe { topic: topic_str.clone() });
        }
        h.gossip.heartbeat().await.expect("heartbeat");
        assert_eq!(
            h.gossip.mesh_peer_count(block_topic()).await.expect("count"),
            GOSSIP_D
        );
    }

    #[tokio::test]
    async fn outbound_budget_drops_excess_frames() {
        let config = GossipSubConfig {
            max_outbound_buffer_size: 0,
            allow_publish_to_zero_peers: true,
            ..GossipSubConfig::default()
        };
        let mut h = harness(config, ValidationResult::Accept);
        let topic_str = stringify_topic(&h.schedule, &block_topic()).expect("topic");
        h.gossip.peer_connected(peer(1), false).await.expect("connect");
        h.gossip.handle_frame(peer(1), GossipFrame::Subscribe { topic: topic_str });
        h.gossip.publish(block_topic(), vec![1; 32]).await.expect("publish");
        h.gossip.heartbeat().await.expect("heartbeat");
        assert!(h.sent.try_recv().is_err());
    }
}
