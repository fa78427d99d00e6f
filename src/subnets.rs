//! # Attestation Subnet Scheduler
//!
//! Decides which `beacon_attestation_{subnet}` topics are joined at any time.
//!
//! | Class | Source | Lifetime |
//! |-------|--------|----------|
//! | Long-lived | [`compute_subscribed_subnets`] of the node id | one subscription period |
//! | Short-lived | aggregator duties from [`SubnetScheduler::add_committee_subscriptions`] | lookahead before the duty slot through the duty slot |
//!
//! A topic is only left when neither class still needs it. Long-lived
//! rotations subscribe the additions first and unsubscribe the removals last,
//! so a subnet present in both the old and the new set is never dropped.
//!
//! All state lives in one actor fed by slot and epoch ticks; maintenance only
//! ever runs on those ticks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chain::{ChainContext, ChainSpec, Epoch, ForkName, Slot, SubnetId};
use crate::clock::ClockEvent;
use crate::identity::NodeId;
use crate::protocols::GossipSubscriber;
use crate::scoring::GOSSIP_D_LOW;
use crate::topic::{GossipTopic, GossipType};

const COMMAND_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetsConfig {
    /// Slots before an aggregator duty at which its subnet is joined.
    pub slots_to_subscribe_before_aggregator_duty: u64,
    /// Join every attestation subnet and never leave one.
    pub subscribe_all_subnets: bool,
}

impl Default for SubnetsConfig {
    fn default() -> Self {
        Self {
            slots_to_subscribe_before_aggregator_duty: 2,
            subscribe_all_subnets: false,
        }
    }
}

// ============================================================================
// Subnet Map
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestedSubnet {
    pub subnet: SubnetId,
    /// Last slot the subnet is needed at.
    pub to_slot: Slot,
}

/// Subnets with the last slot they are needed at.
#[derive(Clone, Debug, Default)]
pub struct SubnetMap {
    subnets: HashMap<SubnetId, Slot>,
}

impl SubnetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extends `subnet` to at least `to_slot`; never shortens an entry.
    pub fn request(&mut self, subnet: SubnetId, to_slot: Slot) {
        let entry = self.subnets.entry(subnet).or_insert(to_slot);
        *entry = (*entry).max(to_slot);
    }

    pub fn has(&self, subnet: SubnetId) -> bool {
        self.subnets.contains_key(&subnet)
    }

    pub fn is_active_at_slot(&self, subnet: SubnetId, slot: Slot) -> bool {
        self.subnets.get(&subnet).is_some_and(|to| *to >= slot)
    }

    pub fn active(&self, slot: Slot) -> Vec<RequestedSubnet> {
        let mut active: Vec<RequestedSubnet> = self
            .subnets
            .iter()
            .filter(|(_, to)| **to >= slot)
            .map(|(subnet, to)| RequestedSubnet {
                subnet: *subnet,
                to_slot: *to,
            })
            .collect();
        active.sort();
        active
    }

    /// Removes and returns the subnets whose last slot is before `slot`.
    pub fn take_expired(&mut self, slot: Slot) -> Vec<SubnetId> {
        let mut expired: Vec<SubnetId> = self
            .subnets
            .iter()
            .filter(|(_, to)| **to < slot)
            .map(|(subnet, _)| *subnet)
            .collect();
        for subnet in &expired {
            self.subnets.remove(subnet);
        }
        expired.sort_unstable();
        expired
    }

    pub fn len(&self) -> usize {
        self.subnets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }
}

// ============================================================================
// Long-Lived Subnet Function
// ============================================================================

/// Swap-or-not shuffle position of `index` in a list of `index_count` items.
pub fn compute_shuffled_index(index: u64, index_count: u64, seed: &[u8; 32], rounds: u8) -> u64 {
    if index_count == 0 {
        return index;
    }
    let mut index = index % index_count;
    for round in 0..rounds {
        let pivot_hash = Sha256::new()
            .chain_update(seed)
            .chain_update([round])
            .finalize();
        let mut pivot_bytes = [0u8; 8];
        pivot_bytes.copy_from_slice(&pivot_hash[..8]);
        let pivot = u64::from_le_bytes(pivot_bytes) % index_count;

        let flip = (pivot + index_count - index) % index_count;
        let position = index.max(flip);
        let source = Sha256::new()
            .chain_update(seed)
            .chain_update([round])
            .chain_update(((position / 256) as u32).to_le_bytes())
            .finalize();
        let byte = source[((position % 256) / 8) as usize];
        if (byte >> (position % 8)) & 1 == 1 {
            index = flip;
        }
    }
    index
}

/// Long-lived attestation subnets of `node_id` at `epoch`.
pub fn compute_subscribed_subnets(node_id: &NodeId, epoch: Epoch, spec: &ChainSpec) -> Vec<SubnetId> {
    let prefix_bits = spec.attestation_subnet_prefix_bits;
    let period = spec.epochs_per_subnet_subscription.max(1);
    let prefix = node_id.prefix(prefix_bits);
    let offset = u64::from(node_id.low_byte()) % period;
    let seed: [u8; 32] = Sha256::digest(((epoch + offset) / period).to_le_bytes()).into();
    let permuted = compute_shuffled_index(prefix, 1u64 << prefix_bits, &seed, spec.shuffle_round_count);
    (0..spec.subnets_per_node)
        .map(|i| (permuted + i) % spec.attestation_subnet_count)
        .collect()
}

/// Computes the long-lived subnets for a node at an epoch.
pub type LongLivedSubnetsFn = Arc<dyn Fn(&NodeId, Epoch, &ChainSpec) -> Vec<SubnetId> + Send + Sync>;

// ============================================================================
// Public Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeSubscription {
    pub validator_index: u64,
    pub subnet: SubnetId,
    pub slot: Slot,
    pub is_aggregator: bool,
}

/// How quickly an aggregator subnet reached a healthy mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StableMesh {
    Pending,
    /// Slots from joining the subnet until the mesh held `D_low` peers.
    FormedAfter(u64),
    /// Duty expired before the mesh held `D_low` peers.
    NotFormed,
}

enum Command {
    AddCommitteeSubscriptions(Vec<CommitteeSubscription>, oneshot::Sender<()>),
    ShouldProcess(SubnetId, Slot, oneshot::Sender<bool>),
    ActiveSubnets(oneshot::Sender<Vec<RequestedSubnet>>),
    LongLived(oneshot::Sender<Vec<SubnetId>>),
    Attnets(oneshot::Sender<u64>),
    MeshHealth(Slot, SubnetId, oneshot::Sender<Option<StableMesh>>),
    SubscribeToNextFork(ForkName, oneshot::Sender<()>),
    UnsubscribeFromPrevFork(ForkName, oneshot::Sender<()>),
    Tick(ClockEvent, oneshot::Sender<()>),
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct SubnetScheduler {
    cmd_tx: mpsc::Sender<Command>,
}

impl SubnetScheduler {
    /// Spawns the scheduler with the standard long-lived subnet function.
    pub async fn spawn(
        config: SubnetsConfig,
        node_id: NodeId,
        chain: Arc<dyn ChainContext>,
        gossip: Arc<dyn GossipSubscriber>,
        clock: broadcast::Receiver<ClockEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let long_lived: LongLivedSubnetsFn = Arc::new(compute_subscribed_subnets);
        Self::spawn_with(config, node_id, long_lived, chain, gossip, clock, cancel).await
    }

    pub async fn spawn_with(
        config: SubnetsConfig,
        node_id: NodeId,
        long_lived_fn: LongLivedSubnetsFn,
        chain: Arc<dyn ChainContext>,
        gossip: Arc<dyn GossipSubscriber>,
        clock: broadcast::Receiver<ClockEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let mut actor = SchedulerActor::new(config, node_id, long_lived_fn, chain, gossip);
        actor.start().await;
        tokio::spawn(actor.run(cmd_rx, clock, cancel));
        Self { cmd_tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("subnet scheduler actor closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("subnet scheduler actor closed"))
    }

    /// Registers committee duties; aggregator duties schedule a short-lived subscription.
    pub async fn add_committee_subscriptions(&self, subscriptions: Vec<CommitteeSubscription>) -> Result<()> {
        self.request(|tx| Command::AddCommitteeSubscriptions(subscriptions, tx))
            .await
    }

    /// Whether this node aggregates on `subnet` at `slot`.
    pub async fn should_process(&self, subnet: SubnetId, slot: Slot) -> Result<bool> {
        self.request(|tx| Command::ShouldProcess(subnet, slot, tx)).await
    }

    /// Committee subnets active now plus the long-lived ones.
    pub async fn active_subnets(&self) -> Result<Vec<RequestedSubnet>> {
        self.request(Command::ActiveSubnets).await
    }

    pub async fn long_lived_subnets(&self) -> Result<Vec<SubnetId>> {
        self.request(Command::LongLived).await
    }

    /// Long-lived subnets as a metadata bitfield.
    pub async fn attnets(&self) -> Result<u64> {
        self.request(Command::Attnets).await
    }

    pub async fn mesh_health(&self, slot: Slot, subnet: SubnetId) -> Result<Option<StableMesh>> {
        self.request(|tx| Command::MeshHealth(slot, subnet, tx)).await
    }

    /// Joins the long-lived subnets on `fork` ahead of its activation.
    pub async fn subscribe_to_next_fork(&self, fork: ForkName) -> Result<()> {
        self.request(|tx| Command::SubscribeToNextFork(fork, tx)).await
    }

    /// Leaves every attestation subnet on `fork` once it is retired.
    pub async fn unsubscribe_from_prev_fork(&self, fork: ForkName) -> Result<()> {
        self.request(|tx| Command::UnsubscribeFromPrevFork(fork, tx)).await
    }

    /// Runs the maintenance for `event` and waits for it to finish.
    pub async fn tick(&self, event: ClockEvent) -> Result<()> {
        self.request(|tx| Command::Tick(event, tx)).await
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubnetSource {
    Committee,
    LongLived,
}

impl SubnetSource {
    fn as_str(&self) -> &'static str {
        match self {
            SubnetSource::Committee => "committee",
            SubnetSource::LongLived => "long_lived",
        }
    }
}

struct SchedulerActor {
    config: SubnetsConfig,
    node_id: NodeId,
    long_lived_fn: LongLivedSubnetsFn,
    chain: Arc<dyn ChainContext>,
    gossip: Arc<dyn GossipSubscriber>,
    slot: Slot,
    /// Every subnet a committee duty needs, for peer discovery.
    committee_subnets: SubnetMap,
    /// Aggregator subnets currently joined for a duty.
    short_lived: SubnetMap,
    long_lived: BTreeSet<SubnetId>,
    /// Duty slot to aggregator subnets with their mesh health.
    aggregator_duties: BTreeMap<Slot, HashMap<SubnetId, StableMesh>>,
}

impl SchedulerActor {
    fn new(
        config: SubnetsConfig,
        node_id: NodeId,
        long_lived_fn: LongLivedSubnetsFn,
        chain: Arc<dyn ChainContext>,
        gossip: Arc<dyn GossipSubscriber>,
    ) -> Self {
        let slot = chain.current_slot();
        Self {
            config,
            node_id,
            long_lived_fn,
            chain,
            gossip,
            slot,
            committee_subnets: SubnetMap::new(),
            short_lived: SubnetMap::new(),
            long_lived: BTreeSet::new(),
            aggregator_duties: BTreeMap::new(),
        }
    }

    fn spec(&self) -> &ChainSpec {
        self.chain.spec()
    }

    fn epoch(&self) -> Epoch {
        self.spec().epoch_at_slot(self.slot)
    }

    fn lookahead(&self) -> u64 {
        self.config.slots_to_subscribe_before_aggregator_duty
    }

    async fn start(&mut self) {
        if self.config.subscribe_all_subnets {
            let all: Vec<SubnetId> = (0..self.spec().attestation_subnet_count).collect();
            for subnet in &all {
                self.committee_subnets.request(*subnet, Slot::MAX);
            }
            self.subscribe_subnets(&all, SubnetSource::Committee).await;
            for subnet in all {
                self.short_lived.request(subnet, Slot::MAX);
            }
        }
        self.recompute_long_lived().await;
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut clock: broadcast::Receiver<ClockEvent>,
        cancel: CancellationToken,
    ) {
        let mut clock_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("subnet scheduler shutting down");
                    break;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = clock.recv(), if clock_open => {
                    match event {
                        Ok(event) => self.on_clock(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "subnet scheduler lagged behind the slot clock");
                        }
                        Err(broadcast::error::RecvError::Closed) => clock_open = false,
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddCommitteeSubscriptions(subscriptions, reply) => {
                self.add_committee_subscriptions(subscriptions).await;
                let _ = reply.send(());
            }
            Command::ShouldProcess(subnet, slot, reply) => {
                let process = self
                    .aggregator_duties
                    .get(&slot)
                    .is_some_and(|subnets| subnets.contains_key(&subnet));
                let _ = reply.send(process);
            }
            Command::ActiveSubnets(reply) => {
                let _ = reply.send(self.active_subnets());
            }
            Command::LongLived(reply) => {
                let _ = reply.send(self.long_lived.iter().copied().collect());
            }
            Command::Attnets(reply) => {
                let bits = self
                    .long_lived
                    .iter()
                    .filter(|s| **s < 64)
                    .fold(0u64, |acc, s| acc | (1 << s));
                let _ = reply.send(bits);
            }
            Command::MeshHealth(slot, subnet, reply) => {
                let health = self
                    .aggregator_duties
                    .get(&slot)
                    .and_then(|subnets| subnets.get(&subnet))
                    .copied();
                let _ = reply.send(health);
            }
            Command::SubscribeToNextFork(fork, reply) => {
                self.subscribe_to_next_fork(fork).await;
                let _ = reply.send(());
            }
            Command::UnsubscribeFromPrevFork(fork, reply) => {
                self.unsubscribe_from_prev_fork(fork).await;
                let _ = reply.send(());
            }
            Command::Tick(event, reply) => {
                self.on_clock(event).await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_clock(&mut self, event: ClockEvent) {
        match event {
            ClockEvent::Slot(slot) => self.on_slot(slot).await,
            ClockEvent::Epoch(epoch) => self.on_epoch(epoch).await,
        }
    }

    // ------------------------------------------------------------------------
    // Committee duties
    // ------------------------------------------------------------------------

    async fn add_committee_subscriptions(&mut self, subscriptions: Vec<CommitteeSubscription>) {
        let mut late = Vec::new();
        for sub in subscriptions {
            self.committee_subnets.request(sub.subnet, sub.slot + 1);
            if !sub.is_aggregator || sub.slot < self.slot {
                continue;
            }
            self.aggregator_duties
                .entry(sub.slot)
                .or_default()
                .entry(sub.subnet)
                .or_insert(StableMesh::Pending);
            // The slot tick that joins `slot + lookahead` already ran for the current slot.
            if sub.slot <= self.slot + self.lookahead() {
                late.push(sub);
            }
        }
        for sub in late {
            trace!(subnet = sub.subnet, slot = sub.slot, "joining late aggregator subnet");
            self.subscribe_subnets(&[sub.subnet], SubnetSource::Committee).await;
            self.short_lived.request(sub.subnet, sub.slot);
        }
    }

    async fn on_slot(&mut self, slot: Slot) {
        self.slot = slot;
        let join_slot = slot + self.lookahead();
        if let Some(subnets) = self.aggregator_duties.get(&join_slot) {
            let subnets: Vec<SubnetId> = subnets.keys().copied().collect();
            if !subnets.is_empty() {
                self.subscribe_subnets(&subnets, SubnetSource::Committee).await;
            }
            for subnet in subnets {
                self.short_lived.request(subnet, join_slot);
            }
        }

        self.track_stable_mesh(slot).await;

        let expired = self.short_lived.take_expired(slot);
        if !expired.is_empty() {
            self.unsubscribe_subnets(&expired, slot, SubnetSource::Committee).await;
        }
        self.committee_subnets.take_expired(slot);
        self.aggregator_duties = self.aggregator_duties.split_off(&slot);
    }

    async fn track_stable_mesh(&mut self, slot: Slot) {
        let lookahead = self.lookahead();
        let fork = self.chain.fork_schedule().fork_at_epoch(self.epoch()).name;
        let mut checks = Vec::new();
        for (duty_slot, subnets) in self.aggregator_duties.iter_mut() {
            for (subnet, health) in subnets.iter_mut() {
                if *health != StableMesh::Pending {
                    continue;
                }
                if *duty_slot < slot {
                    *health = StableMesh::NotFormed;
                    debug!(subnet = *subnet, duty_slot = *duty_slot, "no stable mesh before aggregator duty");
                } else if *duty_slot <= slot + lookahead {
                    checks.push((*duty_slot, *subnet));
                }
            }
        }
        for (duty_slot, subnet) in checks {
            let topic = GossipTopic::new(fork, GossipType::BeaconAttestation(subnet));
            let peers = match self.gossip.mesh_peer_count(topic).await {
                Ok(peers) => peers,
                Err(e) => {
                    trace!(error = %e, "mesh size unavailable");
                    continue;
                }
            };
            if peers >= GOSSIP_D_LOW
                && let Some(health) = self
                    .aggregator_duties
                    .get_mut(&duty_slot)
                    .and_then(|subnets| subnets.get_mut(&subnet))
            {
                let after = slot.saturating_sub(duty_slot.saturating_sub(lookahead));
                *health = StableMesh::FormedAfter(after);
                debug!(subnet, duty_slot, slots = after, peers, "aggregator subnet mesh formed");
            }
        }
    }

    fn active_subnets(&self) -> Vec<RequestedSubnet> {
        let spec = self.spec();
        let period = spec.epochs_per_subnet_subscription.max(1);
        let long_lived_to = (self.epoch() / period + 1) * period * spec.slots_per_epoch;
        let mut active = self.committee_subnets.active(self.slot);
        active.extend(self.long_lived.iter().map(|subnet| RequestedSubnet {
            subnet: *subnet,
            to_slot: long_lived_to,
        }));
        active
    }

    // ------------------------------------------------------------------------
    // Long-lived subnets
    // ------------------------------------------------------------------------

    async fn on_epoch(&mut self, epoch: Epoch) {
        let slot = self.spec().start_slot(epoch);
        if slot > self.slot {
            self.slot = slot;
        }
        if epoch % self.spec().epochs_per_subnet_subscription.max(1) == 0 {
            self.recompute_long_lived().await;
        }
    }

    async fn recompute_long_lived(&mut self) {
        let epoch = self.epoch();
        let next: Vec<SubnetId> = (self.long_lived_fn)(&self.node_id, epoch, self.spec());
        let removed: Vec<SubnetId> = self
            .long_lived
            .iter()
            .filter(|s| !next.contains(s))
            .copied()
            .collect();
        info!(epoch, old = ?self.long_lived, new = ?next, "recomputed long-lived subnets");

        self.subscribe_subnets(&next, SubnetSource::LongLived).await;
        for subnet in &removed {
            self.long_lived.remove(subnet);
        }
        self.long_lived.extend(next);
        let slot = self.slot;
        self.unsubscribe_subnets(&removed, slot, SubnetSource::LongLived).await;
    }

    async fn subscribe_to_next_fork(&mut self, fork: ForkName) {
        info!(fork = %fork, subnets = ?self.long_lived, "joining long-lived subnets on next fork");
        let subnets: Vec<SubnetId> = self.long_lived.iter().copied().collect();
        for subnet in subnets {
            self.subscribe_topic(fork, subnet).await;
        }
    }

    async fn unsubscribe_from_prev_fork(&mut self, fork: ForkName) {
        if self.config.subscribe_all_subnets {
            return;
        }
        info!(fork = %fork, "leaving attestation subnets of previous fork");
        for subnet in 0..self.spec().attestation_subnet_count {
            self.unsubscribe_topic(fork, subnet).await;
        }
    }

    // ------------------------------------------------------------------------
    // Gossip plumbing
    // ------------------------------------------------------------------------

    /// Joins each subnet not already held by either class.
    /// Callers record the subnet in its class right after.
    async fn subscribe_subnets(&mut self, subnets: &[SubnetId], source: SubnetSource) {
        let forks = self.chain.fork_schedule().active_forks(self.epoch());
        for subnet in subnets {
            if self.short_lived.has(*subnet) || self.long_lived.contains(subnet) {
                continue;
            }
            trace!(subnet, source = source.as_str(), "joining attestation subnet");
            for fork in &forks {
                self.subscribe_topic(*fork, *subnet).await;
            }
        }
    }

    /// Leaves each subnet that neither class still needs at `slot`.
    /// Long-lived callers update their set before calling.
    async fn unsubscribe_subnets(&mut self, subnets: &[SubnetId], slot: Slot, source: SubnetSource) {
        if self.config.subscribe_all_subnets {
            return;
        }
        let forks = self.chain.fork_schedule().active_forks(self.epoch());
        for subnet in subnets {
            if self.short_lived.is_active_at_slot(*subnet, slot) || self.long_lived.contains(subnet) {
                continue;
            }
            trace!(subnet, source = source.as_str(), "leaving attestation subnet");
            for fork in &forks {
                self.unsubscribe_topic(*fork, *subnet).await;
            }
        }
    }

    async fn subscribe_topic(&self, fork: ForkName, subnet: SubnetId) {
        let topic = GossipTopic::new(fork, GossipType::BeaconAttestation(subnet));
        if let Err(e) = self.gossip.subscribe_topic(topic).await {
            warn!(topic = %topic, error = %e, "subscribe failed");
        }
    }

    async fn unsubscribe_topic(&self, fork: ForkName, subnet: SubnetId) {
        let topic = GossipTopic::new(fork, GossipType::BeaconAttestation(subnet));
        if let Err(e) = self.gossip.unsubscribe_topic(topic).await {
            warn!(topic = %topic, error = %e, "unsubscribe failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ForkSchedule, LocalChainContext};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn subnet_map_request_only_extends() {
        let mut map = SubnetMap::new();
        map.request(3, 10);
        map.request(3, 5);
        assert!(map.is_active_at_slot(3, 10));
        assert!(!map.is_active_at_slot(3, 11));
        assert!(!map.is_active_at_slot(4, 0));
        assert_eq!(map.active(8), vec![RequestedSubnet { subnet: 3, to_slot: 10 }]);
    }

    #[test]
    fn subnet_map_expiry_removes_entries() {
        let mut map = SubnetMap::new();
        map.request(1, 4);
        map.request(2, 6);
        assert!(map.take_expired(4).is_empty());
        assert_eq!(map.take_expired(5), vec![1]);
        assert!(!map.has(1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn shuffled_index_is_a_permutation() {
        let seed = [7u8; 32];
        let mut seen: Vec<u64> = (0..64).map(|i| compute_shuffled_index(i, 64, &seed, 90)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn subscribed_subnets_are_stable_within_a_period() {
        let spec = ChainSpec::mainnet();
        let node = NodeId::from_bytes([0u8; 32]);
        let first = compute_subscribed_subnets(&node, 0, &spec);
        assert_eq!(first.len(), spec.subnets_per_node as usize);
        assert_eq!(first[1], (first[0] + 1) % spec.attestation_subnet_count);
        assert_eq!(compute_subscribed_subnets(&node, 255, &spec), first);
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Op {
        Sub(SubnetId),
        Unsub(SubnetId),
    }

    #[derive(Default)]
    struct RecordingGossip {
        ops: Mutex<Vec<Op>>,
    }

    impl RecordingGossip {
        fn take(&self) -> Vec<Op> {
            std::mem::take(&mut *self.ops.lock())
        }
    }

    #[async_trait]
    impl GossipSubscriber for RecordingGossip {
        async fn subscribe_topic(&self, topic: GossipTopic) -> Result<()> {
            if let Some(subnet) = topic.kind.subnet() {
                self.ops.lock().push(Op::Sub(subnet));
            }
            Ok(())
        }

        async fn unsubscribe_topic(&self, topic: GossipTopic) -> Result<()> {
            if let Some(subnet) = topic.kind.subnet() {
                self.ops.lock().push(Op::Unsub(subnet));
            }
            Ok(())
        }

        async fn mesh_peer_count(&self, _topic: GossipTopic) -> Result<usize> {
            Ok(GOSSIP_D_LOW)
        }
    }

    async fn scheduler(
        config: SubnetsConfig,
        long_lived: LongLivedSubnetsFn,
        slot: Slot,
    ) -> (SubnetScheduler, Arc<RecordingGossip>, CancellationToken) {
        let chain = LocalChainContext::new(
            ChainSpec::mainnet(),
            ForkSchedule::single(ForkName::Phase0, [0u8; 32]),
            1000,
        );
        chain.set_slot(slot);
        let gossip = Arc::new(RecordingGossip::default());
        let cancel = CancellationToken::new();
        let (_clock_tx, clock_rx) = broadcast::channel(4);
        let scheduler = SubnetScheduler::spawn_with(
            config,
            NodeId::from_bytes([1u8; 32]),
            long_lived,
            Arc::new(chain),
            gossip.clone(),
            clock_rx,
            cancel.clone(),
        )
        .await;
        (scheduler, gossip, cancel)
    }

    fn fixed(subnets: Vec<SubnetId>) -> LongLivedSubnetsFn {
        Arc::new(move |_: &NodeId, _: Epoch, _: &ChainSpec| subnets.clone())
    }

    #[tokio::test]
    async fn rotation_subscribes_before_unsubscribing() {
        let long_lived: LongLivedSubnetsFn = Arc::new(|_: &NodeId, epoch: Epoch, _: &ChainSpec| {
            if epoch < 256 { vec![3, 7] } else { vec![3, 9] }
        });
        let (scheduler, gossip, _cancel) =
            scheduler(SubnetsConfig::default(), long_lived, 100 * 32).await;
        assert_eq!(gossip.take(), vec![Op::Sub(3), Op::Sub(7)]);

        scheduler.tick(ClockEvent::Epoch(256)).await.expect("tick");
        assert_eq!(gossip.take(), vec![Op::Sub(9), Op::Unsub(7)]);
        assert_eq!(scheduler.long_lived_subnets().await.expect("subnets"), vec![3, 9]);
        assert_eq!(scheduler.attnets().await.expect("attnets"), (1 << 3) | (1 << 9));
    }

    #[tokio::test]
    async fn aggregator_subnet_joined_ahead_and_left_after_duty() {
        let (scheduler, gossip, _cancel) =
            scheduler(SubnetsConfig::default(), fixed(vec![]), 10).await;
        scheduler
            .add_committee_subscriptions(vec![CommitteeSubscription {
                validator_index: 1,
                subnet: 5,
                slot: 20,
                is_aggregator: true,
            }])
            .await
            .expect("add");
        assert!(scheduler.should_process(5, 20).await.expect("process"));
        assert!(!scheduler.should_process(5, 19).await.expect("process"));

        scheduler.tick(ClockEvent::Slot(17)).await.expect("tick");
        assert!(gossip.take().is_empty());
        scheduler.tick(ClockEvent::Slot(18)).await.expect("tick");
        assert_eq!(gossip.take(), vec![Op::Sub(5)]);
        assert_eq!(
            scheduler.mesh_health(20, 5).await.expect("health"),
            Some(StableMesh::FormedAfter(0))
        );

        scheduler.tick(ClockEvent::Slot(20)).await.expect("tick");
        assert!(gossip.take().is_empty());
        scheduler.tick(ClockEvent::Slot(21)).await.expect("tick");
        assert_eq!(gossip.take(), vec![Op::Unsub(5)]);
        assert!(!scheduler.should_process(5, 20).await.expect("pruned"));
    }

    #[tokio::test]
    async fn duty_at_lookahead_boundary_is_joined_on_registration() {
        let (scheduler, gossip, _cancel) =
            scheduler(SubnetsConfig::default(), fixed(vec![]), 10).await;
        scheduler.tick(ClockEvent::Slot(10)).await.expect("tick");
        scheduler
            .add_committee_subscriptions(vec![CommitteeSubscription {
                validator_index: 1,
                subnet: 5,
                slot: 12,
                is_aggregator: true,
            }])
            .await
            .expect("add");
        assert_eq!(gossip.take(), vec![Op::Sub(5)]);

        for slot in 11..=12 {
            scheduler.tick(ClockEvent::Slot(slot)).await.expect("tick");
        }
        assert!(gossip.take().is_empty());
        assert!(scheduler.should_process(5, 12).await.expect("process"));
        scheduler.tick(ClockEvent::Slot(13)).await.expect("tick");
        assert_eq!(gossip.take(), vec![Op::Unsub(5)]);
    }

    #[tokio::test]
    async fn late_duty_is_joined_immediately() {
        let (scheduler, gossip, _cancel) =
            scheduler(SubnetsConfig::default(), fixed(vec![]), 10).await;
        scheduler
            .add_committee_subscriptions(vec![CommitteeSubscription {
                validator_index: 1,
                subnet: 8,
                slot: 11,
                is_aggregator: true,
            }])
            .await
            .expect("add");
        assert_eq!(gossip.take(), vec![Op::Sub(8)]);
    }

    #[tokio::test]
    async fn long_lived_subnet_survives_duty_expiry() {
        let (scheduler, gossip, _cancel) =
            scheduler(SubnetsConfig::default(), fixed(vec![4]), 10).await;
        gossip.take();
        scheduler
            .add_committee_subscriptions(vec![CommitteeSubscription {
                validator_index: 1,
                subnet: 4,
                slot: 14,
                is_aggregator: true,
            }])
            .await
            .expect("add");
        for slot in 11..=16 {
            scheduler.tick(ClockEvent::Slot(slot)).await.expect("tick");
        }
        assert!(gossip.take().is_empty());
        let active = scheduler.active_subnets().await.expect("active");
        assert!(active.iter().any(|r| r.subnet == 4));
    }

    #[tokio::test]
    async fn non_aggregator_duty_only_requests_subnet() {
        let (scheduler, gossip, _cancel) =
            scheduler(SubnetsConfig::default(), fixed(vec![]), 10).await;
        scheduler
            .add_committee_subscriptions(vec![CommitteeSubscription {
                validator_index: 2,
                subnet: 6,
                slot: 12,
                is_aggregator: false,
            }])
            .await
            .expect("add");
        assert!(gossip.take().is_empty());
        assert!(!scheduler.should_process(6, 12).await.expect("process"));
        let active = scheduler.active_subnets().await.expect("active");
        assert_eq!(active, vec![RequestedSubnet { subnet: 6, to_slot: 13 }]);
    }

    #[tokio::test]
    async fn subscribe_all_subnets_never_unsubscribes() {
        let config = SubnetsConfig {
            subscribe_all_subnets: true,
            ..SubnetsConfig::default()
        };
        let (scheduler, gossip, _cancel) = scheduler(config, fixed(vec![1]), 10).await;
        assert_eq!(gossip.take().len(), 64);
        scheduler.unsubscribe_from_prev_fork(ForkName::Phase0).await.expect("prev fork");
        scheduler.tick(ClockEvent::Slot(100)).await.expect("tick");
        assert!(gossip.take().is_empty());
    }
}
