//! Topic score parameters derived from a live chain context.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use beacon_p2p::clock::SlotClock;
use beacon_p2p::gossipsub::{GossipSubContext, PendingGossipMessage};
use beacon_p2p::messages::GossipFrame;
use beacon_p2p::protocols::{GossipSender, GossipValidator};
use beacon_p2p::scoring::{
    PeerScoreParams, PeerScoreThresholds, ScoreParamsError, compute_score_params,
    max_positive_score,
};
use beacon_p2p::topic::stringify_topic;
use beacon_p2p::transport::MemoryNetwork;
use beacon_p2p::{
    ChainSpec, ForkName, ForkSchedule, GossipSub, GossipSubConfig, GossipTopic, GossipType,
    LocalChainContext, NetworkConfig, NodeBuilder, PeerId, ValidationResult,
};

const DENEB_SLOT: u64 = 300_000 * 32;

fn mainnet_context(slot: u64, validators: u64) -> LocalChainContext {
    let chain = LocalChainContext::new(
        ChainSpec::mainnet(),
        ForkSchedule::mainnet([3u8; 32]),
        validators,
    );
    chain.set_slot(slot);
    chain
}

fn topic_key(kind: GossipType) -> String {
    let schedule = ForkSchedule::mainnet([3u8; 32]);
    stringify_topic(&schedule, &GossipTopic::new(ForkName::Deneb, kind)).expect("scheduled fork")
}

#[test]
fn mainnet_params_for_large_validator_set() {
    let chain = mainnet_context(DENEB_SLOT, 1_500_000);
    let params = compute_score_params(&chain).expect("valid context");

    assert_eq!(params.topics.len(), 5 + 64);

    let block = &params.topics[&topic_key(GossipType::BeaconBlock)];
    assert_eq!(block.topic_weight, 0.5);
    assert!(block.mesh_message_deliveries_weight < 0.0);
    assert!(block.mesh_message_deliveries_threshold > 0.0);
    assert!(block.invalid_message_deliveries_weight < 0.0);

    let first = &params.topics[&topic_key(GossipType::BeaconAttestation(0))];
    for subnet in 1..64 {
        let other = &params.topics[&topic_key(GossipType::BeaconAttestation(subnet))];
        assert_eq!(other, first);
    }

    let exit = &params.topics[&topic_key(GossipType::VoluntaryExit)];
    assert_eq!(exit.mesh_message_deliveries_weight, 0.0);

    assert!(params.topic_score_cap > 0.0);
    assert!(params.topic_score_cap < max_positive_score(&ChainSpec::mainnet()));
}

#[test]
fn validator_count_changes_attestation_params() {
    let chain = mainnet_context(DENEB_SLOT, 500_000);
    let small = compute_score_params(&chain).expect("valid context");
    chain.set_active_validators(1_500_000);
    let large = compute_score_params(&chain).expect("valid context");

    let key = topic_key(GossipType::BeaconAttestation(5));
    assert_ne!(
        small.topics[&key].mesh_message_deliveries_threshold,
        large.topics[&key].mesh_message_deliveries_threshold
    );
    let block = topic_key(GossipType::BeaconBlock);
    assert_eq!(small.topics[&block], large.topics[&block]);
}

#[test]
fn zero_validators_is_rejected() {
    let chain = mainnet_context(DENEB_SLOT, 0);
    assert_eq!(
        compute_score_params(&chain),
        Err(ScoreParamsError::ZeroActiveValidators)
    );
}

struct Discard;

#[async_trait]
impl GossipSender for Discard {
    async fn send_gossip(&self, _to: &PeerId, _frame: GossipFrame) -> Result<()> {
        Ok(())
    }
}

struct AcceptAll;

#[async_trait]
impl GossipValidator for AcceptAll {
    async fn validate(&self, _message: &PendingGossipMessage) -> Result<ValidationResult> {
        Ok(ValidationResult::Accept)
    }
}

#[tokio::test]
async fn gossip_engine_accepts_derived_params() {
    let chain = mainnet_context(DENEB_SLOT, 1_500_000);
    let params: PeerScoreParams = compute_score_params(&chain).expect("valid context");
    let cancel = CancellationToken::new();
    let (gossip, _events) = GossipSub::spawn(
        GossipSubConfig::default(),
        PeerScoreThresholds::default(),
        GossipSubContext {
            local: PeerId::from_bytes([9u8; 32]),
            schedule: ForkSchedule::mainnet([3u8; 32]),
            sender: Arc::new(Discard),
            validator: Arc::new(AcceptAll),
            reputation: None,
        },
        cancel.clone(),
    );
    gossip.set_score_params(params).await.expect("params applied");

    let peer = PeerId::from_bytes([1u8; 32]);
    gossip.peer_connected(peer, true).await.expect("connect");
    gossip.heartbeat().await.expect("heartbeat");
    assert_eq!(gossip.peer_score(peer).await.expect("score"), 0.0);
    cancel.cancel();
}

fn node_config(active_validators: u64) -> NetworkConfig {
    NetworkConfig {
        fork: Some(ForkName::Altair),
        active_validators,
        ..NetworkConfig::default()
    }
}

#[tokio::test]
async fn node_refuses_to_start_without_validators() {
    let config = node_config(0);
    let chain = config.chain.clone();
    let builder = NodeBuilder::new(config, Arc::new(AcceptAll)).expect("builder");
    let net = MemoryNetwork::new();
    let (transport, events) = net.join(PeerId::from_bytes([4u8; 32]), builder.protocol_ids());
    let clock = SlotClock::from_instant(Instant::now(), &chain);
    assert!(builder.start(Arc::new(transport), events, clock).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn failed_epoch_recompute_stops_gossip() {
    let config = node_config(16_384);
    let chain = config.chain.clone();
    let builder = NodeBuilder::new(config, Arc::new(AcceptAll)).expect("builder");
    let net = MemoryNetwork::new();
    let (transport, events) = net.join(PeerId::from_bytes([5u8; 32]), builder.protocol_ids());
    let clock = SlotClock::from_instant(Instant::now(), &chain);
    let (node, _messages) = builder
        .start(Arc::new(transport), events, clock)
        .await
        .expect("node start");
    assert!(node.gossip().subscriptions().await.is_ok());

    node.set_active_validators(0);
    let slot = Duration::from_secs(chain.seconds_per_slot);
    let stopped = timeout(slot * (3 * chain.slots_per_epoch) as u32, async {
        while node.gossip().subscriptions().await.is_ok() {
            sleep(slot).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "gossip still running after the epoch boundary");
    node.shutdown().await;
}
