//! # Peer and Node Identity
//!
//! Two identifiers are used throughout the networking layer:
//!
//! - [`PeerId`]: the 32-byte identifier the transport authenticates for a remote
//!   connection. Every per-peer table (reputation, rate limits, gossip scores,
//!   mesh membership) is keyed by it.
//! - [`NodeId`]: the 256-bit discovery identifier derived from the peer id. It
//!   is the input to the long-lived attestation subnet assignment, so two nodes
//!   with the same peer id always land on the same subnets.
//!
//! ## Invariants
//!
//! - `PeerId::from_bytes(bytes).as_bytes() == bytes`
//! - `NodeId::from_peer_id(p)` is a pure function of `p`
//! - `Debug` output is truncated; `Display` is the full lowercase hex string

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator mixed into the node id hash.
const NODE_ID_DOMAIN: &[u8] = b"beacon-p2p/node-id/v1";

// ============================================================================
// PeerId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Random peer id for nodes started without a persisted identity.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// The all-zero id is reserved and never accepted from the wire.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_bytes(bytes)
    }
}

// ============================================================================
// NodeId
// ============================================================================

/// 256-bit big-endian node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_peer_id(peer: &PeerId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(NODE_ID_DOMAIN);
        hasher.update(peer.as_bytes());
        Self(hasher.finalize().into())
    }

    /// Top `bits` bits of the id interpreted as an unsigned integer.
    ///
    /// Equivalent to `node_id >> (256 - bits)` for `bits <= 64`.
    pub fn prefix(&self, bits: u32) -> u64 {
        debug_assert!(bits <= 64);
        if bits == 0 {
            return 0;
        }
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head) >> (64 - bits)
    }

    /// `node_id mod 256`.
    #[inline]
    pub fn low_byte(&self) -> u8 {
        self.0[31]
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &hex::encode(self.0)[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
