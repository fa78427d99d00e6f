//! # Protocol Registry and Component Seams
//!
//! The registry is the fixed table of request/response protocols a node both
//! dials and accepts. Each entry is a `(method, version, encoding)` triple
//! rendered on the wire as
//!
//! ```text
//! /eth2/beacon_chain/req/<method>/<version>/<encoding>
//! ```
//!
//! | Method | Versions | Multi-chunk | Context bytes |
//! |--------|----------|-------------|---------------|
//! | status | 1 | no | none |
//! | goodbye | 1 | no | none |
//! | ping | 1 | no | none |
//! | metadata | 1, 2 | no | none |
//! | beacon_blocks_by_range | 1, 2 | yes | fork digest on V2 |
//! | beacon_blocks_by_root | 1, 2 | yes | fork digest on V2 |
//! | light_client_bootstrap | 1 | no | fork digest |
//! | light_client_updates_by_range | 1 | yes | fork digest |
//! | light_client_finality_update | 1 | no | fork digest |
//! | light_client_optimistic_update | 1 | no | fork digest |
//!
//! The traits at the bottom of this module are the seams between components:
//! the gossip engine only needs a [`GossipSender`], the subnet scheduler only
//! needs a [`GossipSubscriber`], and consensus plugs its message checks in as
//! a [`GossipValidator`].

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chain::ForkName;
use crate::gossipsub::{PendingGossipMessage, ValidationResult};
use crate::identity::PeerId;
use crate::messages::{GossipFrame, RequestBody, ResponseBody};
use crate::topic::GossipTopic;

pub const PROTOCOL_PREFIX: &str = "/eth2/beacon_chain/req";

/// Protocol id for gossip frames.
pub const GOSSIP_PROTOCOL_ID: &str = "/meshsub/1.1.0";

// ============================================================================
// Registry Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Status,
    Goodbye,
    Ping,
    Metadata,
    BeaconBlocksByRange,
    BeaconBlocksByRoot,
    LightClientBootstrap,
    LightClientUpdatesByRange,
    LightClientFinalityUpdate,
    LightClientOptimisticUpdate,
}

impl Method {
    pub const ALL: [Method; 10] = [
        Method::Status,
        Method::Goodbye,
        Method::Ping,
        Method::Metadata,
        Method::BeaconBlocksByRange,
        Method::BeaconBlocksByRoot,
        Method::LightClientBootstrap,
        Method::LightClientUpdatesByRange,
        Method::LightClientFinalityUpdate,
        Method::LightClientOptimisticUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Status => "status",
            Method::Goodbye => "goodbye",
            Method::Ping => "ping",
            Method::Metadata => "metadata",
            Method::BeaconBlocksByRange => "beacon_blocks_by_range",
            Method::BeaconBlocksByRoot => "beacon_blocks_by_root",
            Method::LightClientBootstrap => "light_client_bootstrap",
            Method::LightClientUpdatesByRange => "light_client_updates_by_range",
            Method::LightClientFinalityUpdate => "light_client_finality_update",
            Method::LightClientOptimisticUpdate => "light_client_optimistic_update",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        Method::ALL.into_iter().find(|m| m.as_str() == s)
    }

    /// Methods answered with at most one chunk.
    pub fn is_single_response(&self) -> bool {
        !matches!(
            self,
            Method::BeaconBlocksByRange
                | Method::BeaconBlocksByRoot
                | Method::LightClientUpdatesByRange
        )
    }

    /// Methods never subject to inbound rate limiting.
    pub fn is_rate_limit_exempt(&self) -> bool {
        matches!(self, Method::Goodbye)
    }

    pub fn is_block_method(&self) -> bool {
        matches!(self, Method::BeaconBlocksByRange | Method::BeaconBlocksByRoot)
    }

    pub fn is_light_client_method(&self) -> bool {
        matches!(
            self,
            Method::LightClientBootstrap
                | Method::LightClientUpdatesByRange
                | Method::LightClientFinalityUpdate
                | Method::LightClientOptimisticUpdate
        )
    }

    /// Requester closes the stream without waiting for a response.
    pub fn ignores_response(&self) -> bool {
        matches!(self, Method::Goodbye)
    }

    pub fn accepts_request(&self, body: &RequestBody) -> bool {
        matches!(
            (self, body),
            (Method::Status, RequestBody::Status(_))
                | (Method::Goodbye, RequestBody::Goodbye(_))
                | (Method::Ping, RequestBody::Ping(_))
                | (Method::Metadata, RequestBody::Metadata)
                | (Method::BeaconBlocksByRange, RequestBody::BlocksByRange(_))
                | (Method::BeaconBlocksByRoot, RequestBody::BlocksByRoot(_))
                | (Method::LightClientBootstrap, RequestBody::LightClientBootstrap(_))
                | (Method::LightClientUpdatesByRange, RequestBody::LightClientUpdatesByRange(_))
                | (Method::LightClientFinalityUpdate, RequestBody::LightClientFinalityUpdate)
                | (Method::LightClientOptimisticUpdate, RequestBody::LightClientOptimisticUpdate)
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1 => "1",
            Version::V2 => "2",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Lz4Bincode,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Lz4Bincode => "lz4_bincode",
        }
    }
}

/// Prefix carried ahead of each successful response chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextBytes {
    Empty,
    ForkDigest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Protocol {
    pub method: Method,
    pub version: Version,
    pub encoding: Encoding,
}

impl Protocol {
    pub const fn new(method: Method, version: Version) -> Self {
        Self {
            method,
            version,
            encoding: Encoding::Lz4Bincode,
        }
    }

    pub fn id(&self) -> String {
        format!(
            "{PROTOCOL_PREFIX}/{}/{}/{}",
            self.method.as_str(),
            self.version.as_str(),
            self.encoding.as_str()
        )
    }

    /// Parses a protocol id; only registry entries are recognized.
    pub fn parse(id: &str) -> Option<Self> {
        let rest = id.strip_prefix(PROTOCOL_PREFIX)?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        let method = Method::from_name(parts.next()?)?;
        let version = match parts.next()? {
            "1" => Version::V1,
            "2" => Version::V2,
            _ => return None,
        };
        let encoding = match parts.next()? {
            "lz4_bincode" => Encoding::Lz4Bincode,
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        let protocol = Protocol {
            method,
            version,
            encoding,
        };
        SUPPORTED_PROTOCOLS.contains(&protocol).then_some(protocol)
    }

    pub fn context_bytes(&self) -> ContextBytes {
        match (self.method, self.version) {
            (Method::BeaconBlocksByRange | Method::BeaconBlocksByRoot, Version::V2) => {
                ContextBytes::ForkDigest
            }
            (
                Method::LightClientBootstrap
                | Method::LightClientUpdatesByRange
                | Method::LightClientFinalityUpdate
                | Method::LightClientOptimisticUpdate,
                _,
            ) => ContextBytes::ForkDigest,
            _ => ContextBytes::Empty,
        }
    }

    /// Whether `body` is a valid response chunk type for this protocol.
    pub fn accepts_response(&self, body: &ResponseBody) -> bool {
        matches!(
            (self.method, self.version, body),
            (Method::Status, _, ResponseBody::Status(_))
                | (Method::Ping, _, ResponseBody::Pong(_))
                | (Method::Metadata, Version::V1, ResponseBody::MetadataV1(_))
                | (Method::Metadata, Version::V2, ResponseBody::MetadataV2(_))
                | (
                    Method::BeaconBlocksByRange | Method::BeaconBlocksByRoot,
                    _,
                    ResponseBody::Block(_)
                )
                | (
                    Method::LightClientBootstrap
                        | Method::LightClientUpdatesByRange
                        | Method::LightClientFinalityUpdate
                        | Method::LightClientOptimisticUpdate,
                    _,
                    ResponseBody::LightClient(_)
                )
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Every protocol this node dials and accepts.
pub const SUPPORTED_PROTOCOLS: [Protocol; 13] = [
    Protocol::new(Method::Status, Version::V1),
    Protocol::new(Method::Goodbye, Version::V1),
    Protocol::new(Method::Ping, Version::V1),
    Protocol::new(Method::Metadata, Version::V1),
    Protocol::new(Method::Metadata, Version::V2),
    Protocol::new(Method::BeaconBlocksByRange, Version::V1),
    Protocol::new(Method::BeaconBlocksByRange, Version::V2),
    Protocol::new(Method::BeaconBlocksByRoot, Version::V1),
    Protocol::new(Method::BeaconBlocksByRoot, Version::V2),
    Protocol::new(Method::LightClientBootstrap, Version::V1),
    Protocol::new(Method::LightClientUpdatesByRange, Version::V1),
    Protocol::new(Method::LightClientFinalityUpdate, Version::V1),
    Protocol::new(Method::LightClientOptimisticUpdate, Version::V1),
];

/// Protocols to register when `fork` is the current fork.
///
/// V2 block responses need context bytes and only exist from altair on;
/// light client methods are altair additions.
pub fn protocols_at_fork(fork: ForkName) -> Vec<Protocol> {
    SUPPORTED_PROTOCOLS
        .into_iter()
        .filter(|p| {
            let altair_only = matches!(
                (p.method, p.version),
                (Method::Metadata, Version::V2)
                    | (Method::BeaconBlocksByRange, Version::V2)
                    | (Method::BeaconBlocksByRoot, Version::V2)
            ) || matches!(p.context_bytes(), ContextBytes::ForkDigest);
            fork.has_altair() || !altair_only
        })
        .collect()
}

// ============================================================================
// Component Seams
// ============================================================================

/// Delivers gossip frames to a remote peer.
#[async_trait]
pub trait GossipSender: Send + Sync + 'static {
    async fn send_gossip(&self, to: &PeerId, frame: GossipFrame) -> Result<()>;
}

/// Topic membership operations the subnet scheduler drives.
#[async_trait]
pub trait GossipSubscriber: Send + Sync + 'static {
    async fn subscribe_topic(&self, topic: GossipTopic) -> Result<()>;

    async fn unsubscribe_topic(&self, topic: GossipTopic) -> Result<()>;

    /// Current mesh size for `topic`; zero when not subscribed.
    async fn mesh_peer_count(&self, topic: GossipTopic) -> Result<usize>;
}

/// Application-level check of an inbound gossip message.
///
/// An `Err` is treated as [`ValidationResult::Ignore`].
#[async_trait]
pub trait GossipValidator: Send + Sync + 'static {
    async fn validate(&self, message: &PendingGossipMessage) -> Result<ValidationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_id_roundtrip() {
        for protocol in SUPPORTED_PROTOCOLS {
            assert_eq!(Protocol::parse(&protocol.id()), Some(protocol));
        }
        assert_eq!(
            Protocol::new(Method::BeaconBlocksByRange, Version::V2).id(),
            "/eth2/beacon_chain/req/beacon_blocks_by_range/2/lz4_bincode"
        );
    }

    #[test]
    fn parse_rejects_unregistered() {
        assert!(Protocol::parse("/eth2/beacon_chain/req/status/2/lz4_bincode").is_none());
        assert!(Protocol::parse("/eth2/beacon_chain/req/status/1/ssz_snappy").is_none());
        assert!(Protocol::parse("/eth2/beacon_chain/req/status/1/lz4_bincode/x").is_none());
        assert!(Protocol::parse("/other/status/1/lz4_bincode").is_none());
    }

    #[test]
    fn single_response_methods() {
        assert!(Method::Status.is_single_response());
        assert!(Method::LightClientBootstrap.is_single_response());
        assert!(!Method::BeaconBlocksByRange.is_single_response());
        assert!(!Method::LightClientUpdatesByRange.is_single_response());
    }

    #[test]
    fn context_bytes_by_protocol() {
        assert_eq!(
            Protocol::new(Method::BeaconBlocksByRoot, Version::V1).context_bytes(),
            ContextBytes::Empty
        );
        assert_eq!(
            Protocol::new(Method::BeaconBlocksByRoot, Version::V2).context_bytes(),
            ContextBytes::ForkDigest
        );
        assert_eq!(
            Protocol::new(Method::LightClientFinalityUpdate, Version::V1).context_bytes(),
            ContextBytes::ForkDigest
        );
        assert_eq!(
            Protocol::new(Method::Metadata, Version::V2).context_bytes(),
            ContextBytes::Empty
        );
    }

    #[test]
    fn phase0_excludes_altair_protocols() {
        let phase0 = protocols_at_fork(ForkName::Phase0);
        assert_eq!(phase0.len(), 6);
        assert!(phase0.iter().all(|p| p.version == Version::V1));
        assert_eq!(protocols_at_fork(ForkName::Altair).len(), SUPPORTED_PROTOCOLS.len());
    }

    #[test]
    fn metadata_versions_accept_matching_schema() {
        let v1 = Protocol::new(Method::Metadata, Version::V1);
        let v2 = Protocol::new(Method::Metadata, Version::V2);
        let meta = crate::messages::MetadataV1 { seq_number: 1, attnets: 0 };
        assert!(v1.accepts_response(&ResponseBody::MetadataV1(meta)));
        assert!(!v2.accepts_response(&ResponseBody::MetadataV1(meta)));
    }
}
