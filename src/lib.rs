//! # beacon-p2p - Beacon Chain Networking Layer
//!
//! Peer-to-peer networking for a proof-of-stake beacon node, layered on an
//! assumed reliable, multiplexed, authenticated stream transport:
//!
//! - **Gossip**: GossipSub v1.1 mesh with per-topic peer scoring, message-id
//!   de-duplication and an asynchronous validation lane
//! - **Topic Scoring**: score parameters derived from chain constants and the
//!   live active validator count
//! - **Request/Response**: versioned RPC methods with context bytes, inbound
//!   rate limiting and peer penalties for misbehaving responders
//! - **Subnets**: long-lived attestation subnets derived from the node id plus
//!   short-lived subnets joined ahead of aggregator duties
//! - **Reputation**: decaying per-peer score combining RPC penalties and gossip
//!   scores, driving disconnects and bans
//!
//! ## Architecture
//!
//! Stateful components follow the **Actor Pattern**:
//! - Each component (GossipSub, PeerReputation, SubnetScheduler) has a public
//!   Handle and a private Actor
//! - Handles are cheap to clone and communicate via bounded async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! The inbound rate limiter is the exception: a mutex-guarded map checked
//! inline by many concurrent streams.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Composition root combining all components |
//! | `identity` | Peer ids and node ids |
//! | `chain` | Chain constants, fork schedule, chain context seam |
//! | `clock` | Slot and epoch ticks |
//! | `topic` | Gossip topic naming and core topic sets |
//! | `messages` | Wire types, compression and message ids |
//! | `codec` | RPC request and response chunk framing |
//! | `protocols` | Protocol registry and component trait seams |
//! | `transport` | Stream transport trait with memory and TCP implementations |
//! | `rate_limiter` | Per-peer inbound request budgets |
//! | `peer_score` | Peer reputation store |
//! | `scoring` | Topic score parameter model |
//! | `gossipsub` | Gossip engine |
//! | `rpc` | Request/response engine |
//! | `subnets` | Attestation subnet scheduler |
//! | `config` | Aggregated configuration and file loading |

pub mod chain;
pub mod clock;
pub mod codec;
pub mod config;
pub mod gossipsub;
pub mod identity;
pub mod messages;
pub mod node;
pub mod peer_score;
pub mod protocols;
pub mod rate_limiter;
pub mod rpc;
pub mod scoring;
pub mod subnets;
pub mod topic;
pub mod transport;

pub use chain::{ChainContext, ChainSpec, ForkDigest, ForkName, ForkSchedule, LocalChainContext};
pub use config::{ConfigError, NetworkConfig};
pub use gossipsub::{GossipEvent, GossipSub, GossipSubConfig, PublishError, ReceivedMessage, ValidationResult};
pub use identity::{NodeId, PeerId};
pub use node::{Node, NodeBuilder};
pub use peer_score::{PeerAction, PeerReputation, ScoreState};
pub use protocols::{Method, Protocol, Version};
pub use rpc::{ProtocolHandler, ReqResp, RequestError, ResponseError};
pub use subnets::{CommitteeSubscription, SubnetScheduler};
pub use topic::{GossipTopic, GossipType};
