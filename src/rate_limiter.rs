//! # Inbound Rate Limiter
//!
//! Per-peer, per-method sliding-window budgets for inbound requests, plus a
//! block-count budget for block requests (per peer and across all peers).
//!
//! Each budget keeps the timestamps of accepted requests inside the window.
//! A request is admitted only while fewer than `quota` timestamps remain, so
//! no window of length `window` ever contains more than `quota` admissions,
//! bursts included.
//!
//! | Budget | Default |
//! |--------|---------|
//! | requests per method per peer | 50 / 60 s |
//! | blocks per peer | 500 / 60 s |
//! | blocks across all peers | 2000 / 60 s |
//!
//! Goodbye is exempt. A denial is not a fault by itself; a peer that keeps
//! collecting denials (`sustained_abuse_threshold` within one window) is
//! reported as sustained so the request/response engine can penalize it.
//!
//! ## Concurrency
//!
//! All state sits behind one `parking_lot::Mutex`; each check is a single
//! short critical section, so concurrent streams never lose counts.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::identity::PeerId;
use crate::protocols::Method;

/// Peers tracked before the least recently seen is evicted.
/// SCALABILITY: bounds limiter memory regardless of peer churn.
pub const MAX_TRACKED_PEERS: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub window: Duration,
    /// Requests per method per peer within `window`.
    pub request_quota: u32,
    /// Per-method overrides of `request_quota`.
    pub method_quotas: HashMap<Method, u32>,
    pub block_quota_per_peer: u64,
    pub block_quota_total: u64,
    /// Denials within `window` after which a peer counts as abusive.
    pub sustained_abuse_threshold: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            request_quota: 50,
            method_quotas: HashMap::new(),
            block_quota_per_peer: 500,
            block_quota_total: 2000,
            sustained_abuse_threshold: 5,
        }
    }
}

impl RateLimiterConfig {
    pub fn quota(&self, method: Method) -> u32 {
        self.method_quotas
            .get(&method)
            .copied()
            .unwrap_or(self.request_quota)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { sustained: bool },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

#[derive(Debug, Default)]
struct SlidingWindow {
    entries: VecDeque<(Instant, u64)>,
    sum: u64,
}

impl SlidingWindow {
    fn expire(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, amount)) = self.entries.front() {
            if now.saturating_duration_since(at) >= window {
                self.entries.pop_front();
                self.sum -= amount;
            } else {
                break;
            }
        }
    }

    fn fits(&self, amount: u64, quota: u64) -> bool {
        self.sum.saturating_add(amount) <= quota
    }

    fn record(&mut self, now: Instant, amount: u64) {
        self.entries.push_back((now, amount));
        self.sum += amount;
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct PeerBudget {
    methods: HashMap<Method, SlidingWindow>,
    blocks: SlidingWindow,
    denials: SlidingWindow,
}

impl PeerBudget {
    fn is_idle(&mut self, now: Instant, window: Duration) -> bool {
        self.methods.retain(|_, w| {
            w.expire(now, window);
            !w.is_empty()
        });
        self.blocks.expire(now, window);
        self.denials.expire(now, window);
        self.methods.is_empty() && self.blocks.is_empty() && self.denials.is_empty()
    }
}

struct LimiterState {
    peers: LruCache<PeerId, PeerBudget>,
    total_blocks: SlidingWindow,
}

pub struct InboundRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl InboundRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_capacity(config, MAX_TRACKED_PEERS)
    }

    pub fn with_capacity(config: RateLimiterConfig, max_peers: usize) -> Self {
        let cap = NonZeroUsize::new(max_peers.max(1)).expect("capacity is at least 1");
        Self {
            config,
            state: Mutex::new(LimiterState {
                peers: LruCache::new(cap),
                total_blocks: SlidingWindow::default(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admits or denies one request of `method` from `peer`.
    pub fn allow_request(&self, peer: &PeerId, method: Method) -> RateLimitDecision {
        if method.is_rate_limit_exempt() {
            return RateLimitDecision::Allowed;
        }
        let now = Instant::now();
        let window = self.config.window;
        let quota = u64::from(self.config.quota(method));

        let mut state = self.state.lock();
        let budget = state.peers.get_or_insert_mut(*peer, PeerBudget::default);
        let requests = budget.methods.entry(method).or_default();
        requests.expire(now, window);
        if requests.fits(1, quota) {
            requests.record(now, 1);
            return RateLimitDecision::Allowed;
        }
        let decision = self.deny(budget, now);
        debug!(peer = %peer.short(), method = %method, ?decision, "request rate limited");
        decision
    }

    /// Admits or denies serving `count` blocks to `peer`.
    pub fn allow_block_request(&self, peer: &PeerId, count: u64) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.config.window;

        let mut state = self.state.lock();
        let LimiterState { peers, total_blocks } = &mut *state;
        total_blocks.expire(now, window);
        let budget = peers.get_or_insert_mut(*peer, PeerBudget::default);
        budget.blocks.expire(now, window);

        if budget.blocks.fits(count, self.config.block_quota_per_peer)
            && total_blocks.fits(count, self.config.block_quota_total)
        {
            budget.blocks.record(now, count);
            total_blocks.record(now, count);
            return RateLimitDecision::Allowed;
        }
        let decision = self.deny(budget, now);
        debug!(peer = %peer.short(), count, ?decision, "block request rate limited");
        decision
    }

    fn deny(&self, budget: &mut PeerBudget, now: Instant) -> RateLimitDecision {
        budget.denials.expire(now, self.config.window);
        budget.denials.record(now, 1);
        let sustained = budget.denials.sum >= u64::from(self.config.sustained_abuse_threshold);
        if sustained {
            // Report once per streak.
            budget.denials = SlidingWindow::default();
        }
        RateLimitDecision::Limited { sustained }
    }

    /// Forgets everything about `peer`.
    pub fn prune(&self, peer: &PeerId) {
        self.state.lock().peers.pop(peer);
    }

    /// Drops peers with no activity inside the window.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let mut state = self.state.lock();
        let idle: Vec<PeerId> = state
            .peers
            .iter_mut()
            .filter_map(|(peer, budget)| budget.is_idle(now, window).then_some(*peer))
            .collect();
        for peer in &idle {
            state.peers.pop(peer);
        }
        state.total_blocks.expire(now, window);
        idle.len()
    }

    pub fn tracked_peers(&self) -> usize {
        self.state.lock().peers.len()
    }
}
