//! Integration tests for gossip propagation between nodes.
//!
//! Nodes share an in-memory network; each test builds a small topology and
//! checks end-to-end delivery through the public `Node` API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

use beacon_p2p::clock::SlotClock;
use beacon_p2p::gossipsub::PendingGossipMessage;
use beacon_p2p::protocols::GossipValidator;
use beacon_p2p::transport::{MemoryNetwork, MemoryTransport};
use beacon_p2p::{
    ForkName, GossipTopic, GossipType, NetworkConfig, Node, NodeBuilder, PeerId, PublishError,
    ReceivedMessage, ValidationResult,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const MESH_WAIT: Duration = Duration::from_millis(600);

// =============================================================================
// Helper Functions
// =============================================================================

struct AcceptAll;

#[async_trait]
impl GossipValidator for AcceptAll {
    async fn validate(&self, _message: &PendingGossipMessage) -> Result<ValidationResult> {
        Ok(ValidationResult::Accept)
    }
}

/// Rejects every message whose payload starts with `0xff`.
struct RejectMarked;

#[async_trait]
impl GossipValidator for RejectMarked {
    async fn validate(&self, message: &PendingGossipMessage) -> Result<ValidationResult> {
        if message.data.first() == Some(&0xff) {
            Ok(ValidationResult::Reject)
        } else {
            Ok(ValidationResult::Accept)
        }
    }
}

fn peer(n: u8) -> PeerId {
    PeerId::from_bytes([n; 32])
}

fn config() -> NetworkConfig {
    let mut config = NetworkConfig {
        fork: Some(ForkName::Altair),
        ..NetworkConfig::default()
    };
    config.gossip.heartbeat_interval = Duration::from_millis(100);
    config
}

struct TestNode {
    node: Node,
    transport: Arc<MemoryTransport>,
    messages: mpsc::Receiver<ReceivedMessage>,
}

async fn start(net: &MemoryNetwork, id: u8, validator: Arc<dyn GossipValidator>) -> TestNode {
    let config = config();
    let chain = config.chain.clone();
    let builder = NodeBuilder::new(config, validator).expect("builder");
    let (transport, events) = net.join(peer(id), builder.protocol_ids());
    let transport = Arc::new(transport);
    let clock = SlotClock::from_instant(Instant::now(), &chain);
    let (node, messages) = builder
        .start(transport.clone(), events, clock)
        .await
        .expect("node start");
    TestNode {
        node,
        transport,
        messages,
    }
}

async fn next_message(node: &mut TestNode) -> ReceivedMessage {
    timeout(TEST_TIMEOUT, node.messages.recv())
        .await
        .expect("timed out waiting for gossip")
        .expect("message channel closed")
}

// =============================================================================
// Tests
// =============================================================================

/// A message published on A reaches B and C, which only know A.
#[tokio::test]
async fn star_topology_broadcast() {
    let net = MemoryNetwork::new();
    let a = start(&net, 1, Arc::new(AcceptAll)).await;
    let mut b = start(&net, 2, Arc::new(AcceptAll)).await;
    let mut c = start(&net, 3, Arc::new(AcceptAll)).await;

    b.transport.connect(&peer(1)).await.expect("b -> a");
    c.transport.connect(&peer(1)).await.expect("c -> a");
    sleep(MESH_WAIT).await;

    let payload = b"beacon block".to_vec();
    a.node
        .publish(GossipType::BeaconBlock, payload.clone())
        .await
        .expect("publish");

    for node in [&mut b, &mut c] {
        let message = next_message(node).await;
        assert_eq!(message.data, payload);
        assert_eq!(message.from, peer(1));
        assert_eq!(message.topic, GossipTopic::new(ForkName::Altair, GossipType::BeaconBlock));
    }
}

/// A message from C is relayed by A to B through the mesh.
#[tokio::test]
async fn mesh_relays_between_leaves() {
    let net = MemoryNetwork::new();
    let _a = start(&net, 1, Arc::new(AcceptAll)).await;
    let mut b = start(&net, 2, Arc::new(AcceptAll)).await;
    let c = start(&net, 3, Arc::new(AcceptAll)).await;

    b.transport.connect(&peer(1)).await.expect("b -> a");
    c.transport.connect(&peer(1)).await.expect("c -> a");
    sleep(MESH_WAIT).await;

    let payload = b"voluntary exit".to_vec();
    c.node
        .publish(GossipType::VoluntaryExit, payload.clone())
        .await
        .expect("publish");

    let message = next_message(&mut b).await;
    assert_eq!(message.data, payload);
    assert_eq!(message.from, peer(1));
}

/// Publishing twice yields a duplicate error and a single delivery.
#[tokio::test]
async fn duplicate_publish_is_delivered_once() {
    let net = MemoryNetwork::new();
    let a = start(&net, 1, Arc::new(AcceptAll)).await;
    let mut b = start(&net, 2, Arc::new(AcceptAll)).await;
    b.transport.connect(&peer(1)).await.expect("b -> a");
    sleep(MESH_WAIT).await;

    let payload = b"slashing".to_vec();
    a.node
        .publish(GossipType::ProposerSlashing, payload.clone())
        .await
        .expect("publish");
    assert_eq!(
        a.node.publish(GossipType::ProposerSlashing, payload.clone()).await,
        Err(PublishError::Duplicate)
    );

    assert_eq!(next_message(&mut b).await.data, payload);
    assert!(timeout(MESH_WAIT, b.messages.recv()).await.is_err());
}

/// Rejected messages are not forwarded and lower the sender's gossip score.
#[tokio::test]
async fn rejected_messages_penalize_sender() {
    let net = MemoryNetwork::new();
    let a = start(&net, 1, Arc::new(AcceptAll)).await;
    let mut b = start(&net, 2, Arc::new(RejectMarked)).await;
    b.transport.connect(&peer(1)).await.expect("b -> a");
    sleep(MESH_WAIT).await;

    for i in 0..5u8 {
        a.node
            .publish(GossipType::BeaconBlock, vec![0xff, i])
            .await
            .expect("publish");
    }
    a.node
        .publish(GossipType::BeaconBlock, vec![0x01])
        .await
        .expect("publish");

    let message = next_message(&mut b).await;
    assert_eq!(message.data, vec![0x01]);
    let score = b.node.gossip().peer_score(peer(1)).await.expect("score");
    assert!(score < 0.0, "score {score}");
}

/// Publishing with nobody subscribed fails unless explicitly allowed.
#[tokio::test]
async fn publish_without_peers() {
    let net = MemoryNetwork::new();
    let a = start(&net, 1, Arc::new(AcceptAll)).await;
    let err = a
        .node
        .publish(GossipType::AttesterSlashing, b"lonely".to_vec())
        .await
        .expect_err("no peers");
    assert!(matches!(err, PublishError::NoPeers(_)));
}
