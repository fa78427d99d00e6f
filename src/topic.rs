//! # Gossip Topics
//!
//! A topic identifies one gossip channel and is immutable once built:
//!
//! ```text
//! /eth2/<fork_digest_hex>/<message_type>[_<subnet>]/<encoding>
//! ```
//!
//! | Type | Subnet-parameterized | First fork |
//! |------|----------------------|------------|
//! | `beacon_block` | no | phase0 |
//! | `beacon_aggregate_and_proof` | no | phase0 |
//! | `beacon_attestation_{n}` | yes | phase0 |
//! | `voluntary_exit` | no | phase0 |
//! | `proposer_slashing` | no | phase0 |
//! | `attester_slashing` | no | phase0 |
//! | `sync_committee_contribution_and_proof` | no | altair |
//! | `sync_committee_{n}` | yes | altair |
//! | `light_client_finality_update` | no | altair |
//! | `light_client_optimistic_update` | no | altair |
//! | `bls_to_execution_change` | no | capella |
//! | `blob_sidecar_{n}` | yes | deneb |
//!
//! The fork digest ties a topic to one chain; converting between the digest
//! and the [`ForkName`] goes through the node's [`ForkSchedule`].
//!
//! [`TopicCache`] remembers every topic string the gossip engine has joined or
//! published on, so inbound messages can be mapped back to a typed
//! [`GossipTopic`] without parsing on the hot path.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainSpec, ForkName, ForkSchedule, SubnetId};

pub const TOPIC_PREFIX: &str = "eth2";

/// Number of blob sidecar subnets introduced at deneb.
pub const BLOB_SIDECAR_SUBNET_COUNT: u64 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("malformed topic: {0}")]
    Malformed(String),
    #[error("unknown fork digest: {0}")]
    UnknownForkDigest(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
    #[error("fork {0} is not scheduled")]
    UnscheduledFork(ForkName),
}

// ============================================================================
// Topic Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GossipEncoding {
    #[default]
    Lz4Bincode,
}

impl GossipEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            GossipEncoding::Lz4Bincode => "lz4_bincode",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GossipType {
    BeaconBlock,
    BeaconAggregateAndProof,
    BeaconAttestation(SubnetId),
    VoluntaryExit,
    ProposerSlashing,
    AttesterSlashing,
    SyncCommitteeContributionAndProof,
    SyncCommittee(SubnetId),
    LightClientFinalityUpdate,
    LightClientOptimisticUpdate,
    BlsToExecutionChange,
    BlobSidecar(SubnetId),
}

/// Fixed-name types, matched before the subnet prefixes so that
/// `sync_committee_contribution_and_proof` never parses as a subnet.
const FIXED_TYPES: [(&str, GossipType); 9] = [
    ("beacon_block", GossipType::BeaconBlock),
    ("beacon_aggregate_and_proof", GossipType::BeaconAggregateAndProof),
    ("voluntary_exit", GossipType::VoluntaryExit),
    ("proposer_slashing", GossipType::ProposerSlashing),
    ("attester_slashing", GossipType::AttesterSlashing),
    (
        "sync_committee_contribution_and_proof",
        GossipType::SyncCommitteeContributionAndProof,
    ),
    ("light_client_finality_update", GossipType::LightClientFinalityUpdate),
    (
        "light_client_optimistic_update",
        GossipType::LightClientOptimisticUpdate,
    ),
    ("bls_to_execution_change", GossipType::BlsToExecutionChange),
];

const ATTESTATION_PREFIX: &str = "beacon_attestation_";
const SYNC_COMMITTEE_PREFIX: &str = "sync_committee_";
const BLOB_SIDECAR_PREFIX: &str = "blob_sidecar_";

impl GossipType {
    pub fn subnet(&self) -> Option<SubnetId> {
        match self {
            GossipType::BeaconAttestation(s)
            | GossipType::SyncCommittee(s)
            | GossipType::BlobSidecar(s) => Some(*s),
            _ => None,
        }
    }

    fn name(&self) -> String {
        match self {
            GossipType::BeaconAttestation(s) => format!("{ATTESTATION_PREFIX}{s}"),
            GossipType::SyncCommittee(s) => format!("{SYNC_COMMITTEE_PREFIX}{s}"),
            GossipType::BlobSidecar(s) => format!("{BLOB_SIDECAR_PREFIX}{s}"),
            fixed => FIXED_TYPES
                .iter()
                .find(|(_, t)| t == fixed)
                .map(|(name, _)| (*name).to_string())
                .unwrap_or_default(),
        }
    }

    fn parse(name: &str) -> Result<Self, TopicError> {
        if let Some((_, kind)) = FIXED_TYPES.iter().find(|(n, _)| *n == name) {
            return Ok(*kind);
        }
        let subnet_types: [(&str, fn(SubnetId) -> GossipType); 3] = [
            (ATTESTATION_PREFIX, GossipType::BeaconAttestation),
            (SYNC_COMMITTEE_PREFIX, GossipType::SyncCommittee),
            (BLOB_SIDECAR_PREFIX, GossipType::BlobSidecar),
        ];
        for (prefix, build) in subnet_types {
            if let Some(index) = name.strip_prefix(prefix) {
                return parse_subnet(index).map(build);
            }
        }
        Err(TopicError::UnknownType(name.to_string()))
    }
}

/// Canonical decimal only: no sign, no leading zeros.
fn parse_subnet(s: &str) -> Result<SubnetId, TopicError> {
    let canonical = !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit())
        && (s == "0" || !s.starts_with('0'));
    if !canonical {
        return Err(TopicError::Malformed(format!("bad subnet index {s:?}")));
    }
    s.parse()
        .map_err(|_| TopicError::Malformed(format!("subnet index out of range {s:?}")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GossipTopic {
    pub fork: ForkName,
    pub kind: GossipType,
    pub encoding: GossipEncoding,
}

impl GossipTopic {
    pub fn new(fork: ForkName, kind: GossipType) -> Self {
        Self {
            fork,
            kind,
            encoding: GossipEncoding::default(),
        }
    }
}

impl fmt::Display for GossipTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fork, self.kind.name())
    }
}

// ============================================================================
// Stringify / Parse
// ============================================================================

pub fn stringify_topic(schedule: &ForkSchedule, topic: &GossipTopic) -> Result<String, TopicError> {
    let digest = schedule
        .digest(topic.fork)
        .ok_or(TopicError::UnscheduledFork(topic.fork))?;
    Ok(format!(
        "/{TOPIC_PREFIX}/{}/{}/{}",
        digest.to_hex(),
        topic.kind.name(),
        topic.encoding.as_str()
    ))
}

pub fn parse_topic(schedule: &ForkSchedule, topic: &str) -> Result<GossipTopic, TopicError> {
    let parts: Vec<&str> = topic.split('/').collect();
    let [empty, prefix, digest_hex, name, encoding] = parts.as_slice() else {
        return Err(TopicError::Malformed(topic.to_string()));
    };
    if !empty.is_empty() || *prefix != TOPIC_PREFIX {
        return Err(TopicError::Malformed(topic.to_string()));
    }

    let digest = crate::chain::ForkDigest::from_hex(digest_hex)
        .ok_or_else(|| TopicError::Malformed(format!("bad fork digest {digest_hex:?}")))?;
    let fork = schedule
        .fork_for_digest(&digest)
        .ok_or_else(|| TopicError::UnknownForkDigest(digest_hex.to_string()))?;

    let encoding = match *encoding {
        "lz4_bincode" => GossipEncoding::Lz4Bincode,
        other => return Err(TopicError::UnknownEncoding(other.to_string())),
    };

    Ok(GossipTopic {
        fork,
        kind: GossipType::parse(name)?,
        encoding,
    })
}

// ============================================================================
// Core Topics
// ============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct CoreTopicOptions {
    /// Join every attestation and sync committee subnet.
    pub subscribe_all_subnets: bool,
    /// Join the light client update topics.
    pub light_client_server: bool,
}

/// Topics a node joins for the whole lifetime of `fork`, independent of duties.
pub fn core_topics_at_fork(
    fork: ForkName,
    spec: &ChainSpec,
    opts: CoreTopicOptions,
) -> Vec<GossipType> {
    let mut topics = vec![
        GossipType::BeaconBlock,
        GossipType::BeaconAggregateAndProof,
        GossipType::VoluntaryExit,
        GossipType::ProposerSlashing,
        GossipType::AttesterSlashing,
    ];

    if opts.subscribe_all_subnets {
        topics.extend((0..spec.attestation_subnet_count).map(GossipType::BeaconAttestation));
    }

    if fork.has_altair() {
        topics.push(GossipType::SyncCommitteeContributionAndProof);
        if opts.subscribe_all_subnets {
            topics.extend((0..spec.sync_committee_subnet_count).map(GossipType::SyncCommittee));
        }
        if opts.light_client_server {
            topics.push(GossipType::LightClientFinalityUpdate);
            topics.push(GossipType::LightClientOptimisticUpdate);
        }
    }

    if fork >= ForkName::Capella {
        topics.push(GossipType::BlsToExecutionChange);
    }

    if fork >= ForkName::Deneb {
        topics.extend((0..BLOB_SIDECAR_SUBNET_COUNT).map(GossipType::BlobSidecar));
    }

    topics
}

// ============================================================================
// Topic Cache
// ============================================================================

/// Topic string to typed topic lookup owned by the gossip engine.
#[derive(Debug, Default)]
pub struct TopicCache {
    topics: HashMap<String, GossipTopic>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `topic` and returns its string form.
    pub fn set_topic(
        &mut self,
        schedule: &ForkSchedule,
        topic: GossipTopic,
    ) -> Result<String, TopicError> {
        let topic_str = stringify_topic(schedule, &topic)?;
        self.topics.entry(topic_str.clone()).or_insert(topic);
        Ok(topic_str)
    }

    /// Typed topic for a registered string.
    pub fn get_topic(&self, topic_str: &str) -> Option<GossipTopic> {
        self.topics.get(topic_str).copied()
    }

    pub fn is_known(&self, topic_str: &str) -> bool {
        self.topics.contains_key(topic_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
