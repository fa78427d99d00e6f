//! # Wire Messages
//!
//! Serializable records carried by the gossip and request/response protocols.
//! Records are bincode with fixed-int encoding and a size limit, then LZ4
//! compressed with the uncompressed length prepended.
//!
//! ## Gossip
//!
//! | Frame | Purpose |
//! |-------|---------|
//! | `Subscribe` / `Unsubscribe` | announce topic interest |
//! | `Publish` | carry one compressed payload |
//! | `Graft` / `Prune` | mesh membership control |
//! | `IHave` / `IWant` | lazy gossip of recent message ids |
//!
//! ## Message IDs
//!
//! The canonical id is 20 bytes:
//!
//! ```text
//! sha256(domain || u64_le(len(topic)) || topic || payload)[..20]
//! ```
//!
//! where `payload` is the decompressed data and `domain` is
//! [`MESSAGE_DOMAIN_VALID`], or the raw data with [`MESSAGE_DOMAIN_INVALID`] when
//! it does not decompress. A 32-byte BLAKE3 fast id over the raw frame lets the
//! engine skip decompression for data it has already seen.
//!
//! ## Request/Response Bodies
//!
//! | Method | Request | Response |
//! |--------|---------|----------|
//! | status | [`StatusMessage`] | [`StatusMessage`] |
//! | goodbye | reason code | (none) |
//! | ping | sequence number | sequence number |
//! | metadata | (empty) | [`MetadataV1`] / [`MetadataV2`] |
//! | beacon_blocks_by_range | [`BlocksByRangeRequest`] | [`SignedBeaconBlock`] chunks |
//! | beacon_blocks_by_root | [`BlocksByRootRequest`] | [`SignedBeaconBlock`] chunks |
//! | light_client_* | root / period range / (empty) | opaque update bytes |

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chain::{Epoch, ForkDigest, Slot};

/// Maximum uncompressed size of a gossip payload or response chunk (10 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Maximum buffer size for deserialization.
/// SECURITY: bounds every bincode decode regardless of the claimed length.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Maximum number of roots in one blocks-by-root request.
pub const MAX_REQUEST_BLOCKS: u64 = 1024;

/// Maximum number of light client updates in one range request.
pub const MAX_REQUEST_LIGHT_CLIENT_UPDATES: u64 = 128;

pub const MESSAGE_DOMAIN_VALID: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
pub const MESSAGE_DOMAIN_INVALID: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

pub const MESSAGE_ID_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("payload of {size} bytes exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("unexpected body for {0}")]
    UnexpectedBody(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode_options()
        .serialize(value)
        .map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| CodecError::Deserialize(e.to_string()))
}

// ============================================================================
// Compression
// ============================================================================

pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompresses a size-prepended LZ4 block, rejecting claimed sizes over `limit`
/// before allocating.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    let Some(header) = data.get(..4) else {
        return Err(CodecError::Decompress("missing size header".into()));
    };
    let claimed = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if claimed > limit {
        return Err(CodecError::TooLarge {
            size: claimed,
            limit,
        });
    }
    lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::Decompress(e.to_string()))
}

pub fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let raw = serialize(value)?;
    if raw.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge {
            size: raw.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(compress(&raw))
}

pub fn decode_compressed<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    let raw = decompress(data, MAX_PAYLOAD_SIZE)?;
    deserialize_bounded(&raw)
}

// ============================================================================
// Message IDs
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

/// BLAKE3 over the raw frame, used only as a cache key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FastMessageId(pub [u8; 32]);

pub fn fast_message_id(topic: &str, data: &[u8]) -> FastMessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(topic.len() as u64).to_le_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(data);
    FastMessageId(*hasher.finalize().as_bytes())
}

/// Canonical message id over the decompressed payload.
pub fn message_id(topic: &str, data: &[u8]) -> MessageId {
    match decompress(data, MAX_PAYLOAD_SIZE) {
        Ok(uncompressed) => id_with_domain(MESSAGE_DOMAIN_VALID, topic, &uncompressed),
        Err(_) => id_with_domain(MESSAGE_DOMAIN_INVALID, topic, data),
    }
}

fn id_with_domain(domain: [u8; 4], topic: &str, payload: &[u8]) -> MessageId {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update((topic.len() as u64).to_le_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(&digest[..MESSAGE_ID_LEN]);
    MessageId(id)
}

// ============================================================================
// Gossip Frames
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, data: Vec<u8> },
    Graft { topic: String },
    Prune { topic: String, backoff_secs: u64 },
    IHave { topic: String, ids: Vec<MessageId> },
    IWant { ids: Vec<MessageId> },
}

impl GossipFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipFrame::Subscribe { .. } => "subscribe",
            GossipFrame::Unsubscribe { .. } => "unsubscribe",
            GossipFrame::Publish { .. } => "publish",
            GossipFrame::Graft { .. } => "graft",
            GossipFrame::Prune { .. } => "prune",
            GossipFrame::IHave { .. } => "ihave",
            GossipFrame::IWant { .. } => "iwant",
        }
    }
}

// ============================================================================
// Request/Response Bodies
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub fork_digest: ForkDigest,
    pub finalized_root: [u8; 32],
    pub finalized_epoch: Epoch,
    pub head_root: [u8; 32],
    pub head_slot: Slot,
}

pub mod goodbye_reason {
    pub const CLIENT_SHUTDOWN: u64 = 1;
    pub const IRRELEVANT_NETWORK: u64 = 2;
    pub const FAULT_OR_ERROR: u64 = 3;
    pub const TOO_MANY_PEERS: u64 = 129;
    pub const SCORE_TOO_LOW: u64 = 250;
    pub const BANNED: u64 = 251;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataV1 {
    pub seq_number: u64,
    /// Bitfield of long-lived attestation subnets.
    pub attnets: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataV2 {
    pub seq_number: u64,
    pub attnets: u64,
    /// Bitfield of sync committee subnets.
    pub syncnets: u8,
}

impl From<MetadataV2> for MetadataV1 {
    fn from(m: MetadataV2) -> Self {
        Self {
            seq_number: m.seq_number,
            attnets: m.attnets,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
    /// Deprecated; peers must send 1.
    pub step: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksByRootRequest {
    pub roots: Vec<[u8; 32]>,
}

/// Block as seen by the networking layer: its slot plus opaque encoded bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub slot: Slot,
    pub root: [u8; 32],
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientUpdatesByRange {
    pub start_period: u64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestBody {
    Status(StatusMessage),
    Goodbye(u64),
    Ping(u64),
    Metadata,
    BlocksByRange(BlocksByRangeRequest),
    BlocksByRoot(BlocksByRootRequest),
    LightClientBootstrap([u8; 32]),
    LightClientUpdatesByRange(LightClientUpdatesByRange),
    LightClientFinalityUpdate,
    LightClientOptimisticUpdate,
}

impl RequestBody {
    /// Number of blocks the request asks for; zero for non-block methods.
    pub fn block_count(&self) -> u64 {
        match self {
            RequestBody::BlocksByRange(req) => req.count,
            RequestBody::BlocksByRoot(req) => req.roots.len() as u64,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    Status(StatusMessage),
    Pong(u64),
    MetadataV1(MetadataV1),
    MetadataV2(MetadataV2),
    Block(SignedBeaconBlock),
    LightClient(Vec<u8>),
}

impl ResponseBody {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseBody::Status(_) => "status",
            ResponseBody::Pong(_) => "pong",
            ResponseBody::MetadataV1(_) => "metadata_v1",
            ResponseBody::MetadataV2(_) => "metadata_v2",
            ResponseBody::Block(_) => "block",
            ResponseBody::LightClient(_) => "light_client",
        }
    }
}
