//! # Peer Reputation Store
//!
//! Protocol-independent reputation for every peer the node talks to. The
//! request/response engine feeds it [`PeerAction`]s; the gossip engine feeds
//! it its per-peer gossip score every heartbeat. The combined score decides
//! whether a peer stays connected.
//!
//! ## Score Model
//!
//! | Constant | Value |
//! |----------|-------|
//! | default score | 0 |
//! | score range | `[-100, 100]` |
//! | disconnect at or below | -20 |
//! | ban at or below | -50 |
//! | half-life | 10 min |
//! | no decay after a ban | 30 min |
//! | pruned when `abs(score)` below | 1 |
//!
//! The combined score is the local score plus the gossip score scaled so that
//! a peer exactly at the gossip graylist threshold lands one point above the
//! disconnect threshold. Once the local score falls to -60 the gossip score is
//! ignored entirely, so good gossip behaviour cannot rescue a peer that keeps
//! failing requests. Negative gossip scores of the best-ranked few peers can be
//! ignored to tolerate transient mesh hiccups.
//!
//! ## Concurrency
//!
//! The store is an actor: every mutation is serialized through its command
//! channel, readers get a consistent snapshot per call.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::identity::PeerId;

pub const DEFAULT_SCORE: f64 = 0.0;
pub const MIN_SCORE_BEFORE_DISCONNECT: f64 = -20.0;
pub const MIN_SCORE_BEFORE_BAN: f64 = -50.0;
/// Local score at which gossip score stops counting.
pub const MIN_LOCAL_SCORE_BEFORE_BAN: f64 = -60.0;
pub const MAX_SCORE: f64 = 100.0;
pub const MIN_SCORE: f64 = -100.0;
/// Entries whose absolute score decays below this are dropped.
pub const SCORE_THRESHOLD: f64 = 1.0;

/// Gossip graylist threshold the weights are calibrated against.
pub const DEFAULT_GRAYLIST_THRESHOLD: f64 = -16000.0;

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Actions and States
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerAction {
    /// Immediately bans the peer.
    Fatal,
    /// About ten occurrences lead to a ban.
    LowToleranceError,
    /// About fifty occurrences lead to a ban.
    MidToleranceError,
    /// Needs a few hundred occurrences without decay to matter.
    HighToleranceError,
}

impl PeerAction {
    pub fn score_delta(&self) -> f64 {
        match self {
            PeerAction::Fatal => -(MAX_SCORE - MIN_SCORE),
            PeerAction::LowToleranceError => -10.0,
            PeerAction::MidToleranceError => -5.0,
            PeerAction::HighToleranceError => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScoreState {
    Healthy,
    Disconnected,
    Banned,
}

impl ScoreState {
    pub fn from_score(score: f64) -> Self {
        if score <= MIN_SCORE_BEFORE_BAN {
            ScoreState::Banned
        } else if score <= MIN_SCORE_BEFORE_DISCONNECT {
            ScoreState::Disconnected
        } else {
            ScoreState::Healthy
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub halflife: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub banned_before_decay: Duration,
    pub max_entries: usize,
    /// How often scores decay and tiny entries are pruned.
    #[serde(with = "crate::config::duration_ms")]
    pub update_interval: Duration,
    pub graylist_threshold: f64,
    /// Negative gossip scores above this may be ignored for the best peers.
    pub negative_gossip_score_ignore_threshold: f64,
    /// How many peers may have their negative gossip score ignored.
    pub max_ignored_negative_peers: usize,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            halflife: Duration::from_secs(10 * 60),
            banned_before_decay: Duration::from_secs(30 * 60),
            max_entries: 1000,
            update_interval: Duration::from_secs(30),
            graylist_threshold: DEFAULT_GRAYLIST_THRESHOLD,
            negative_gossip_score_ignore_threshold: -1000.0,
            max_ignored_negative_peers: 10,
        }
    }
}

impl ReputationConfig {
    fn gossip_weight(&self) -> f64 {
        (MIN_SCORE_BEFORE_DISCONNECT + 1.0) / self.graylist_threshold
    }
}

// ============================================================================
// Per-Peer Score
// ============================================================================

#[derive(Clone, Debug)]
pub struct PeerScore {
    local_score: f64,
    gossip_score: f64,
    ignore_negative_gossip_score: bool,
    score: f64,
    /// In the future while a fresh ban is held without decay.
    last_update: Instant,
}

impl PeerScore {
    pub fn new(now: Instant) -> Self {
        Self {
            local_score: DEFAULT_SCORE,
            gossip_score: DEFAULT_SCORE,
            ignore_negative_gossip_score: false,
            score: DEFAULT_SCORE,
            last_update: now,
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn local_score(&self) -> f64 {
        self.local_score
    }

    pub fn gossip_score(&self) -> f64 {
        self.gossip_score
    }

    pub fn state(&self) -> ScoreState {
        ScoreState::from_score(self.score)
    }

    /// Adds `delta` to the local score; a transition into `Banned` freezes decay.
    pub fn add(&mut self, delta: f64, now: Instant, config: &ReputationConfig) {
        let previous = self.state();
        self.local_score = (self.local_score + delta).clamp(MIN_SCORE, MAX_SCORE);
        self.recompute(config);
        if previous != ScoreState::Banned && self.state() == ScoreState::Banned {
            self.last_update = now + config.banned_before_decay;
        }
    }

    /// Exponential decay of the local score toward zero.
    pub fn update(&mut self, now: Instant, config: &ReputationConfig) {
        if now <= self.last_update {
            return;
        }
        let elapsed = (now - self.last_update).as_secs_f64();
        let decay = (-std::f64::consts::LN_2 * elapsed / config.halflife.as_secs_f64()).exp();
        self.local_score *= decay;
        self.last_update = now;
        self.recompute(config);
    }

    /// Ignored while a fresh ban is being held.
    pub fn update_gossip_score(
        &mut self,
        gossip_score: f64,
        ignore_negative: bool,
        now: Instant,
        config: &ReputationConfig,
    ) {
        if self.last_update <= now {
            self.gossip_score = gossip_score;
            self.ignore_negative_gossip_score = ignore_negative;
            self.recompute(config);
        }
    }

    fn recompute(&mut self, config: &ReputationConfig) {
        self.score = self.local_score;
        if self.local_score <= MIN_LOCAL_SCORE_BEFORE_BAN {
            return;
        }
        if self.gossip_score >= 0.0 || !self.ignore_negative_gossip_score {
            self.score += self.gossip_score * config.gossip_weight();
        }
    }
}

// ============================================================================
// Reputation Actor
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum ReputationEvent {
    StateChanged {
        peer: PeerId,
        from: ScoreState,
        to: ScoreState,
        reason: &'static str,
    },
}

enum Command {
    ApplyAction(PeerId, PeerAction, &'static str),
    UpdateGossipScores(Vec<(PeerId, f64)>),
    Score(PeerId, oneshot::Sender<f64>),
    State(PeerId, oneshot::Sender<ScoreState>),
    Snapshot(oneshot::Sender<Vec<(PeerId, f64)>>),
    Tick,
}

/// Handle to the reputation actor; cheap to clone.
#[derive(Clone)]
pub struct PeerReputation {
    cmd_tx: mpsc::Sender<Command>,
}

impl PeerReputation {
    pub fn spawn(
        config: ReputationConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<ReputationEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let actor = ReputationActor::new(config, event_tx);
        tokio::spawn(actor.run(cmd_rx, cancel));
        (Self { cmd_tx }, event_rx)
    }

    async fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow::anyhow!("PeerReputation actor closed"))
    }

    pub async fn apply_action(
        &self,
        peer: PeerId,
        action: PeerAction,
        reason: &'static str,
    ) -> anyhow::Result<()> {
        self.send(Command::ApplyAction(peer, action, reason)).await
    }

    /// Replaces every listed peer's gossip score.
    pub async fn update_gossip_scores(&self, scores: Vec<(PeerId, f64)>) -> anyhow::Result<()> {
        self.send(Command::UpdateGossipScores(scores)).await
    }

    pub async fn score(&self, peer: PeerId) -> anyhow::Result<f64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Score(peer, tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("PeerReputation actor closed"))
    }

    pub async fn state(&self, peer: PeerId) -> anyhow::Result<ScoreState> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(peer, tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("PeerReputation actor closed"))
    }

    pub async fn snapshot(&self) -> anyhow::Result<Vec<(PeerId, f64)>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("PeerReputation actor closed"))
    }

    /// Runs decay and pruning now instead of waiting for the next interval.
    pub async fn tick(&self) -> anyhow::Result<()> {
        self.send(Command::Tick).await
    }
}

struct ReputationActor {
    config: ReputationConfig,
    scores: LruCache<PeerId, PeerScore>,
    events: mpsc::Sender<ReputationEvent>,
}

impl ReputationActor {
    fn new(config: ReputationConfig, events: mpsc::Sender<ReputationEvent>) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).expect("capacity is at least 1");
        Self {
            config,
            scores: LruCache::new(cap),
            events,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut update_interval = tokio::time::interval(self.config.update_interval);
        update_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd).await;
                }
                _ = update_interval.tick() => self.update_all(),
            }
        }
        debug!("reputation actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ApplyAction(peer, action, reason) => {
                self.apply_action(peer, action, reason).await;
            }
            Command::UpdateGossipScores(scores) => self.update_gossip_scores(scores).await,
            Command::Score(peer, reply) => {
                let _ = reply.send(self.current(&peer).map_or(DEFAULT_SCORE, |s| s.score()));
            }
            Command::State(peer, reply) => {
                let _ = reply.send(
                    self.current(&peer)
                        .map_or(ScoreState::Healthy, |s| s.state()),
                );
            }
            Command::Snapshot(reply) => {
                let now = Instant::now();
                let config = &self.config;
                let snapshot = self
                    .scores
                    .iter_mut()
                    .map(|(peer, score)| {
                        score.update(now, config);
                        (*peer, score.score())
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
            Command::Tick => self.update_all(),
        }
    }

    fn current(&mut self, peer: &PeerId) -> Option<&PeerScore> {
        let now = Instant::now();
        let config = &self.config;
        let score = self.scores.get_mut(peer)?;
        score.update(now, config);
        Some(score)
    }

    async fn apply_action(&mut self, peer: PeerId, action: PeerAction, reason: &'static str) {
        let now = Instant::now();
        let config = &self.config;
        let entry = self.scores.get_or_insert_mut(peer, || PeerScore::new(now));
        entry.update(now, config);
        let from = entry.state();
        entry.add(action.score_delta(), now, config);
        let to = entry.state();
        let score = entry.score();

        debug!(
            peer = %peer.short(),
            ?action,
            reason,
            score,
            "peer action applied"
        );
        self.emit_if_changed(peer, from, to, reason).await;
    }

    async fn update_gossip_scores(&mut self, mut scores: Vec<(PeerId, f64)>) {
        let now = Instant::now();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut ignored = 0usize;
        let mut changes = Vec::new();
        for (peer, gossip_score) in scores {
            let ignore_negative = gossip_score < 0.0
                && gossip_score > self.config.negative_gossip_score_ignore_threshold
                && ignored < self.config.max_ignored_negative_peers;
            if ignore_negative {
                ignored += 1;
            }

            let config = &self.config;
            let entry = self.scores.get_or_insert_mut(peer, || PeerScore::new(now));
            entry.update(now, config);
            let from = entry.state();
            entry.update_gossip_score(gossip_score, ignore_negative, now, config);
            let to = entry.state();
            if from != to {
                changes.push((peer, from, to));
            }
        }
        for (peer, from, to) in changes {
            self.emit_if_changed(peer, from, to, "gossip_score").await;
        }
    }

    fn update_all(&mut self) {
        let now = Instant::now();
        let config = &self.config;
        let mut prune = Vec::new();
        for (peer, score) in self.scores.iter_mut() {
            score.update(now, config);
            if score.score().abs() < SCORE_THRESHOLD && score.last_update <= now {
                prune.push(*peer);
            }
        }
        for peer in &prune {
            self.scores.pop(peer);
        }
        if !prune.is_empty() {
            debug!(pruned = prune.len(), tracked = self.scores.len(), "reputation entries pruned");
        }
    }

    async fn emit_if_changed(
        &self,
        peer: PeerId,
        from: ScoreState,
        to: ScoreState,
        reason: &'static str,
    ) {
        if from == to {
            return;
        }
        if to != ScoreState::Healthy {
            info!(peer = %peer.short(), ?from, ?to, reason, "peer score state changed");
        }
        let _ = self
            .events
            .send(ReputationEvent::StateChanged {
                peer,
                from,
                to,
                reason,
            })
            .await;
    }
}
