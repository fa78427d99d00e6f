//! # Chain Constants and Fork Schedule
//!
//! The networking layer needs a narrow view of the consensus chain:
//!
//! | Item | Used by |
//! |------|---------|
//! | [`ChainSpec`] | slot/epoch arithmetic, committee math, subnet counts |
//! | [`ForkSchedule`] | topic fork digests, RPC context bytes, active-fork windows |
//! | [`ChainContext`] | live slot, epoch and validator count for score recomputation |
//!
//! The state transition, fork choice and validator registry stay outside this
//! crate; [`ChainContext`] is the only seam through which their state flows in.
//!
//! ## Active Fork Window
//!
//! Topics for a fork are joined [`FORK_LOOKAHEAD_EPOCHS`] before its activation
//! epoch and the previous fork's topics are kept for the same number of epochs
//! after it, so both topic sets are live across a transition.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Slot = u64;
pub type Epoch = u64;
pub type SubnetId = u64;

/// Epochs around a fork boundary during which both forks are active.
pub const FORK_LOOKAHEAD_EPOCHS: Epoch = 2;

/// Epoch value used for forks that are not scheduled.
pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;

// ============================================================================
// Chain Spec
// ============================================================================

/// Protocol constants relevant to networking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSpec {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub attestation_subnet_count: u64,
    pub sync_committee_subnet_count: u64,
    pub target_committee_size: u64,
    pub max_committees_per_slot: u64,
    pub target_aggregators_per_committee: u64,
    pub epochs_per_subnet_subscription: u64,
    pub subnets_per_node: u64,
    pub attestation_subnet_prefix_bits: u32,
    pub shuffle_round_count: u8,
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ChainSpec {
    pub fn mainnet() -> Self {
        Self {
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            attestation_subnet_count: 64,
            sync_committee_subnet_count: 4,
            target_committee_size: 128,
            max_committees_per_slot: 64,
            target_aggregators_per_committee: 16,
            epochs_per_subnet_subscription: 256,
            subnets_per_node: 2,
            attestation_subnet_prefix_bits: 6,
            shuffle_round_count: 90,
        }
    }

    #[inline]
    pub fn epoch_at_slot(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch
    }

    #[inline]
    pub fn start_slot(&self, epoch: Epoch) -> Slot {
        epoch.saturating_mul(self.slots_per_epoch)
    }

    /// Number of beacon committees per slot for the given active validator count.
    pub fn committee_count_per_slot(&self, active_validators: u64) -> u64 {
        (active_validators / self.slots_per_epoch / self.target_committee_size)
            .clamp(1, self.max_committees_per_slot)
    }
}

// ============================================================================
// Forks
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkName {
    Phase0,
    Altair,
    Bellatrix,
    Capella,
    Deneb,
}

impl ForkName {
    pub const ALL: [ForkName; 5] = [
        ForkName::Phase0,
        ForkName::Altair,
        ForkName::Bellatrix,
        ForkName::Capella,
        ForkName::Deneb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForkName::Phase0 => "phase0",
            ForkName::Altair => "altair",
            ForkName::Bellatrix => "bellatrix",
            ForkName::Capella => "capella",
            ForkName::Deneb => "deneb",
        }
    }

    /// Altair introduced sync committees, light client protocols and V2 block responses.
    #[inline]
    pub fn has_altair(&self) -> bool {
        *self >= ForkName::Altair
    }
}

impl fmt::Display for ForkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForkName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ForkName::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown fork: {s}"))
    }
}

/// 4-byte identifier of a fork on a specific chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForkDigest(pub [u8; 4]);

impl ForkDigest {
    /// `sha256(pad32(version) || genesis_validators_root)[..4]`
    pub fn compute(version: [u8; 4], genesis_validators_root: &[u8; 32]) -> Self {
        let mut padded = [0u8; 32];
        padded[..4].copy_from_slice(&version);
        let mut hasher = Sha256::new();
        hasher.update(padded);
        hasher.update(genesis_validators_root);
        let hash = hasher.finalize();
        let mut digest = [0u8; 4];
        digest.copy_from_slice(&hash[..4]);
        Self(digest)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 4] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForkDigest({})", self.to_hex())
    }
}

impl fmt::Display for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkInfo {
    pub name: ForkName,
    pub epoch: Epoch,
    pub version: [u8; 4],
    pub digest: ForkDigest,
}

/// Ordered list of scheduled forks for one chain.
#[derive(Clone, Debug)]
pub struct ForkSchedule {
    genesis_validators_root: [u8; 32],
    forks: Vec<ForkInfo>,
}

impl ForkSchedule {
    /// Builds a schedule from `(fork, epoch, version)` entries.
    ///
    /// Entries at [`FAR_FUTURE_EPOCH`] are dropped. The remaining entries are
    /// sorted by epoch; the first must activate at genesis.
    pub fn new(
        genesis_validators_root: [u8; 32],
        entries: impl IntoIterator<Item = (ForkName, Epoch, [u8; 4])>,
    ) -> Result<Self, String> {
        let mut forks: Vec<ForkInfo> = entries
            .into_iter()
            .filter(|(_, epoch, _)| *epoch != FAR_FUTURE_EPOCH)
            .map(|(name, epoch, version)| ForkInfo {
                name,
                epoch,
                version,
                digest: ForkDigest::compute(version, &genesis_validators_root),
            })
            .collect();
        forks.sort_by_key(|f| (f.epoch, f.name));

        match forks.first() {
            None => return Err("fork schedule is empty".to_string()),
            Some(first) if first.epoch != 0 => {
                return Err(format!("first fork {} must start at epoch 0", first.name));
            }
            _ => {}
        }
        Ok(Self {
            genesis_validators_root,
            forks,
        })
    }

    /// Single-fork schedule, used by devnets and tests.
    pub fn single(fork: ForkName, genesis_validators_root: [u8; 32]) -> Self {
        let version = [fork as u8, 0, 0, 0];
        Self {
            genesis_validators_root,
            forks: vec![ForkInfo {
                name: fork,
                epoch: 0,
                version,
                digest: ForkDigest::compute(version, &genesis_validators_root),
            }],
        }
    }

    /// Mainnet fork epochs and versions.
    pub fn mainnet(genesis_validators_root: [u8; 32]) -> Self {
        Self::new(
            genesis_validators_root,
            [
                (ForkName::Phase0, 0, [0x00, 0, 0, 0]),
                (ForkName::Altair, 74_240, [0x01, 0, 0, 0]),
                (ForkName::Bellatrix, 144_896, [0x02, 0, 0, 0]),
                (ForkName::Capella, 194_048, [0x03, 0, 0, 0]),
                (ForkName::Deneb, 269_568, [0x04, 0, 0, 0]),
            ],
        )
        .unwrap_or_else(|_| Self::single(ForkName::Phase0, genesis_validators_root))
    }

    pub fn genesis_validators_root(&self) -> &[u8; 32] {
        &self.genesis_validators_root
    }

    pub fn forks(&self) -> &[ForkInfo] {
        &self.forks
    }

    /// Fork in effect at `epoch`.
    pub fn fork_at_epoch(&self, epoch: Epoch) -> &ForkInfo {
        self.forks
            .iter()
            .rev()
            .find(|f| f.epoch <= epoch)
            .unwrap_or(&self.forks[0])
    }

    /// Forks whose topics should be live at `epoch`.
    ///
    /// A fork is active from `FORK_LOOKAHEAD_EPOCHS` before its activation until
    /// `FORK_LOOKAHEAD_EPOCHS` after the next fork activates.
    pub fn active_forks(&self, epoch: Epoch) -> Vec<ForkName> {
        let mut active = Vec::with_capacity(2);
        for (i, fork) in self.forks.iter().enumerate() {
            let starts = fork.epoch.saturating_sub(FORK_LOOKAHEAD_EPOCHS);
            let ends = self
                .forks
                .get(i + 1)
                .map(|next| next.epoch.saturating_add(FORK_LOOKAHEAD_EPOCHS))
                .unwrap_or(FAR_FUTURE_EPOCH);
            if epoch >= starts && epoch < ends {
                active.push(fork.name);
            }
        }
        active
    }

    pub fn digest(&self, fork: ForkName) -> Option<ForkDigest> {
        self.forks.iter().find(|f| f.name == fork).map(|f| f.digest)
    }

    pub fn fork_for_digest(&self, digest: &ForkDigest) -> Option<ForkName> {
        self.forks.iter().find(|f| &f.digest == digest).map(|f| f.name)
    }

    pub fn digest_at_epoch(&self, epoch: Epoch) -> ForkDigest {
        self.fork_at_epoch(epoch).digest
    }

    /// Fork whose activation is the first strictly after `epoch`.
    pub fn next_fork(&self, epoch: Epoch) -> Option<&ForkInfo> {
        self.forks.iter().find(|f| f.epoch > epoch)
    }
}

// ============================================================================
// Chain Context
// ============================================================================

/// Live chain view supplied by the consensus side of the node.
pub trait ChainContext: Send + Sync {
    fn spec(&self) -> &ChainSpec;

    fn fork_schedule(&self) -> &ForkSchedule;

    fn current_slot(&self) -> Slot;

    fn active_validator_count(&self) -> u64;

    fn current_epoch(&self) -> Epoch {
        self.spec().epoch_at_slot(self.current_slot())
    }

    fn fork_digest_for_epoch(&self, epoch: Epoch) -> ForkDigest {
        self.fork_schedule().digest_at_epoch(epoch)
    }

    fn current_fork(&self) -> ForkName {
        self.fork_schedule().fork_at_epoch(self.current_epoch()).name
    }
}

/// [`ChainContext`] backed by atomics, updated by the node's clock loop or
/// by the embedding consensus client.
#[derive(Debug)]
pub struct LocalChainContext {
    spec: ChainSpec,
    schedule: ForkSchedule,
    slot: AtomicU64,
    active_validators: AtomicU64,
}

impl LocalChainContext {
    pub fn new(spec: ChainSpec, schedule: ForkSchedule, active_validators: u64) -> Self {
        Self {
            spec,
            schedule,
            slot: AtomicU64::new(0),
            active_validators: AtomicU64::new(active_validators),
        }
    }

    pub fn set_slot(&self, slot: Slot) {
        self.slot.store(slot, Ordering::Release);
    }

    pub fn set_active_validators(&self, count: u64) {
        self.active_validators.store(count, Ordering::Release);
    }
}

impl ChainContext for LocalChainContext {
    fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    fn fork_schedule(&self) -> &ForkSchedule {
        &self.schedule
    }

    fn current_slot(&self) -> Slot {
        self.slot.load(Ordering::Acquire)
    }

    fn active_validator_count(&self) -> u64 {
        self.active_validators.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_fork_schedule() -> ForkSchedule {
        ForkSchedule::new(
            [0u8; 32],
            [
                (ForkName::Phase0, 0, [0, 0, 0, 0]),
                (ForkName::Altair, 10, [1, 0, 0, 0]),
            ],
        )
        .expect("valid schedule")
    }

    #[test]
    fn committee_count_is_clamped() {
        let spec = ChainSpec::mainnet();
        assert_eq!(spec.committee_count_per_slot(0), 1);
        assert_eq!(spec.committee_count_per_slot(32 * 128 * 3), 3);
        assert_eq!(spec.committee_count_per_slot(10_000_000), 64);
    }

    #[test]
    fn active_forks_overlap_around_boundary() {
        let schedule = two_fork_schedule();
        assert_eq!(schedule.active_forks(0), vec![ForkName::Phase0]);
        assert_eq!(schedule.active_forks(7), vec![ForkName::Phase0]);
        assert_eq!(
            schedule.active_forks(8),
            vec![ForkName::Phase0, ForkName::Altair]
        );
        assert_eq!(
            schedule.active_forks(11),
            vec![ForkName::Phase0, ForkName::Altair]
        );
        assert_eq!(schedule.active_forks(12), vec![ForkName::Altair]);
    }

    #[test]
    fn fork_digest_lookup_roundtrip() {
        let schedule = two_fork_schedule();
        for fork in [ForkName::Phase0, ForkName::Altair] {
            let digest = schedule.digest(fork).expect("scheduled fork");
            assert_eq!(schedule.fork_for_digest(&digest), Some(fork));
        }
        assert_ne!(
            schedule.digest(ForkName::Phase0),
            schedule.digest(ForkName::Altair)
        );
        assert_eq!(schedule.fork_for_digest(&ForkDigest([9, 9, 9, 9])), None);
    }

    #[test]
    fn fork_at_epoch_and_next_fork() {
        let schedule = two_fork_schedule();
        assert_eq!(schedule.fork_at_epoch(9).name, ForkName::Phase0);
        assert_eq!(schedule.fork_at_epoch(10).name, ForkName::Altair);
        assert_eq!(schedule.next_fork(3).map(|f| f.name), Some(ForkName::Altair));
        assert!(schedule.next_fork(10).is_none());
    }

    #[test]
    fn schedule_rejects_missing_genesis_fork() {
        let result = ForkSchedule::new([0u8; 32], [(ForkName::Altair, 5, [1, 0, 0, 0])]);
        assert!(result.is_err());
    }

    #[test]
    fn fork_name_parses() {
        assert_eq!("capella".parse::<ForkName>(), Ok(ForkName::Capella));
        assert!("electra".parse::<ForkName>().is_err());
    }

    #[test]
    fn local_context_tracks_slot() {
        let ctx = LocalChainContext::new(
            ChainSpec::mainnet(),
            two_fork_schedule(),
            1000,
        );
        ctx.set_slot(33);
        assert_eq!(ctx.current_epoch(), 1);
        ctx.set_slot(320);
        assert_eq!(ctx.current_fork(), ForkName::Altair);
        assert_eq!(ctx.active_validator_count(), 1000);
    }
}
