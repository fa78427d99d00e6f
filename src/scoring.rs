//! # Topic Score Model
//!
//! Pure derivation of gossip peer-scoring parameters from chain constants and
//! live context (current slot and active validator count). The result is an
//! immutable [`PeerScoreParams`] whose topic map is rebuilt from scratch on
//! every recomputation; nothing is patched incrementally.
//!
//! ## Topic Weights
//!
//! | Topic | Weight | Expected rate (per slot) | Mesh delivery scoring |
//! |-------|--------|--------------------------|-----------------------|
//! | `beacon_block` | 0.5 | 1 | 5 epochs, cap x3 |
//! | `beacon_aggregate_and_proof` | 0.5 | aggregators per slot | 2 epochs, cap x4 |
//! | `beacon_attestation_{n}` | 1/64 | validators / 64 / slots per epoch | 4 or 16 epochs, cap x16 |
//! | `voluntary_exit` | 0.05 | 4 / slots per epoch | none |
//! | `proposer_slashing` | 0.05 | 1 / 5 / slots per epoch | none |
//! | `attester_slashing` | 0.05 | 1 / 5 / slots per epoch | none |
//!
//! The maximum positive score a peer can earn is
//! `(MAX_IN_MESH_SCORE + MAX_FIRST_MESSAGE_DELIVERIES_SCORE) * sum(weights)`;
//! penalties are expressed relative to it.
//!
//! ## Early Chain
//!
//! While the chain is younger than a topic's mesh delivery decay window, the
//! expected-rate estimate is meaningless, so mesh delivery threshold and
//! weight are forced to zero for that topic.
//!
//! ## Errors
//!
//! A zero active validator count (or zero expected aggregators) would produce
//! non-positive caps and division by zero downstream. Both are reported as
//! [`ScoreParamsError`]. Node startup fails on the error; a failed per-epoch
//! recompute stops the gossip engine.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::chain::{ChainContext, ChainSpec, ForkSchedule, Slot};
use crate::topic::{GossipTopic, GossipType, TopicError, stringify_topic};

// ============================================================================
// Constants
// ============================================================================

pub const GOSSIP_D: usize = 8;
pub const GOSSIP_D_LOW: usize = 6;
pub const GOSSIP_D_HIGH: usize = 12;

pub const MAX_IN_MESH_SCORE: f64 = 10.0;
pub const MAX_FIRST_MESSAGE_DELIVERIES_SCORE: f64 = 40.0;

pub const BEACON_BLOCK_WEIGHT: f64 = 0.5;
pub const BEACON_AGGREGATE_PROOF_WEIGHT: f64 = 0.5;
pub const VOLUNTARY_EXIT_WEIGHT: f64 = 0.05;
pub const PROPOSER_SLASHING_WEIGHT: f64 = 0.05;
pub const ATTESTER_SLASHING_WEIGHT: f64 = 0.05;

pub const DECAY_TO_ZERO: f64 = 0.01;

const BEHAVIOUR_PENALTY_THRESHOLD: f64 = 6.0;

/// Observation window for near-first deliveries counted toward P3.
const MESH_MESSAGE_DELIVERIES_WINDOW: Duration = Duration::from_secs(12);

#[derive(Debug, Error, PartialEq)]
pub enum ScoreParamsError {
    #[error("active validator count is zero")]
    ZeroActiveValidators,
    #[error("expected aggregators per slot is zero")]
    ZeroAggregators,
    #[error("topic: {0}")]
    Topic(#[from] TopicError),
}

// ============================================================================
// Parameter Types
// ============================================================================

/// Per-topic scoring parameters (gossipsub v1.1 P1 to P4).
#[derive(Clone, Debug, PartialEq)]
pub struct TopicScoreParams {
    pub topic_weight: f64,

    // P1: time in mesh
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_quantum: Duration,
    pub time_in_mesh_cap: f64,

    // P2: first message deliveries
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,

    // P3: mesh message delivery rate
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_threshold: f64,
    pub mesh_message_deliveries_cap: f64,
    pub mesh_message_deliveries_activation: Duration,
    pub mesh_message_deliveries_window: Duration,

    // P3b: mesh failure penalty
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,

    // P4: invalid messages
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    /// Neutral parameters: time in mesh and first deliveries count a little,
    /// invalid messages are penalized, mesh delivery scoring is off.
    fn default() -> Self {
        Self {
            topic_weight: 0.5,
            time_in_mesh_weight: 0.027,
            time_in_mesh_quantum: Duration::from_secs(1),
            time_in_mesh_cap: 3600.0,
            first_message_deliveries_weight: 1.0,
            first_message_deliveries_decay: 0.5,
            first_message_deliveries_cap: 2000.0,
            mesh_message_deliveries_weight: 0.0,
            mesh_message_deliveries_decay: 0.0,
            mesh_message_deliveries_threshold: 0.0,
            mesh_message_deliveries_cap: 0.0,
            mesh_message_deliveries_activation: Duration::ZERO,
            mesh_message_deliveries_window: Duration::ZERO,
            mesh_failure_penalty_weight: 0.0,
            mesh_failure_penalty_decay: 0.0,
            invalid_message_deliveries_weight: -1.0,
            invalid_message_deliveries_decay: 0.3,
        }
    }
}

/// Peer-level scoring parameters plus the topic map.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerScoreParams {
    pub topics: HashMap<String, TopicScoreParams>,
    /// Cap on the summed positive topic contribution.
    pub topic_score_cap: f64,
    /// P5
    pub app_specific_weight: f64,
    /// P7
    pub behaviour_penalty_weight: f64,
    pub behaviour_penalty_threshold: f64,
    pub behaviour_penalty_decay: f64,
    pub decay_interval: Duration,
    pub decay_to_zero: f64,
    /// How long counters of a disconnected peer are remembered.
    pub retain_score: Duration,
}

impl Default for PeerScoreParams {
    /// Parameters with no topic map, derived for the mainnet slot timing.
    fn default() -> Self {
        peer_level_params(&ChainSpec::mainnet(), HashMap::new())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeerScoreThresholds {
    /// Below this, no IHAVE/IWANT gossip is exchanged with the peer.
    pub gossip_threshold: f64,
    /// Below this, the peer is excluded from outbound publishing.
    pub publish_threshold: f64,
    /// Below this, inbound frames are ignored and the peer is disconnected.
    pub graylist_threshold: f64,
    pub accept_px_threshold: f64,
    pub opportunistic_graft_threshold: f64,
}

impl Default for PeerScoreThresholds {
    fn default() -> Self {
        Self {
            gossip_threshold: -4000.0,
            publish_threshold: -8000.0,
            graylist_threshold: -16000.0,
            accept_px_threshold: 100.0,
            opportunistic_graft_threshold: 5.0,
        }
    }
}

// ============================================================================
// Inputs
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshMessageInfo {
    pub decay_slots: u64,
    pub cap_factor: f64,
    pub activation_window: Duration,
    pub current_slot: Slot,
}

/// Everything that differs between topics before parameters are derived.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TopicScoreInput {
    pub topic_weight: f64,
    /// Messages per slot.
    pub expected_message_rate: f64,
    pub first_message_decay_time: Duration,
    pub mesh_message_info: Option<MeshMessageInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregatorEstimate {
    pub aggregators_per_slot: u64,
    pub committees_per_slot: u64,
}

/// Expected number of aggregators per slot for `active_validators`.
pub fn expected_aggregator_count_per_slot(
    spec: &ChainSpec,
    active_validators: u64,
) -> AggregatorEstimate {
    let committees_per_slot = spec.committee_count_per_slot(active_validators);
    let committees_per_epoch = committees_per_slot * spec.slots_per_epoch;
    let smaller_committee_size = active_validators / committees_per_epoch;
    let larger_committee_size = smaller_committee_size + 1;
    let large_committees_per_epoch = active_validators - smaller_committee_size * committees_per_epoch;
    let small_committees_per_epoch = committees_per_epoch - large_committees_per_epoch;

    let target = spec.target_aggregators_per_committee;
    let modulo_smaller = (smaller_committee_size / target).max(1);
    let modulo_larger = (larger_committee_size / target).max(1);

    let small_per_epoch = ((smaller_committee_size as f64 / modulo_smaller as f64)
        * small_committees_per_epoch as f64)
        .floor();
    let large_per_epoch = ((larger_committee_size as f64 / modulo_larger as f64)
        * large_committees_per_epoch as f64)
        .floor();

    let per_slot = ((small_per_epoch + large_per_epoch) / spec.slots_per_epoch as f64).floor() as u64;
    AggregatorEstimate {
        aggregators_per_slot: per_slot.max(1),
        committees_per_slot,
    }
}

/// Score inputs for every scored topic type at `current_slot`.
///
/// Attestation subnets share one input; they are listed once per subnet.
pub fn topic_score_inputs(
    spec: &ChainSpec,
    current_slot: Slot,
    active_validators: u64,
) -> Result<Vec<(GossipType, TopicScoreInput)>, ScoreParamsError> {
    let slot = slot_duration(spec);
    let epoch = slot * spec.slots_per_epoch as u32;
    let slots = spec.slots_per_epoch;

    let mut inputs = vec![
        (
            GossipType::VoluntaryExit,
            TopicScoreInput {
                topic_weight: VOLUNTARY_EXIT_WEIGHT,
                expected_message_rate: 4.0 / slots as f64,
                first_message_decay_time: epoch * 100,
                mesh_message_info: None,
            },
        ),
        (
            GossipType::AttesterSlashing,
            TopicScoreInput {
                topic_weight: ATTESTER_SLASHING_WEIGHT,
                expected_message_rate: 1.0 / 5.0 / slots as f64,
                first_message_decay_time: epoch * 100,
                mesh_message_info: None,
            },
        ),
        (
            GossipType::ProposerSlashing,
            TopicScoreInput {
                topic_weight: PROPOSER_SLASHING_WEIGHT,
                expected_message_rate: 1.0 / 5.0 / slots as f64,
                first_message_decay_time: epoch * 100,
                mesh_message_info: None,
            },
        ),
        (
            GossipType::BeaconBlock,
            TopicScoreInput {
                topic_weight: BEACON_BLOCK_WEIGHT,
                expected_message_rate: 1.0,
                first_message_decay_time: epoch * 20,
                mesh_message_info: Some(MeshMessageInfo {
                    decay_slots: slots * 5,
                    cap_factor: 3.0,
                    activation_window: epoch,
                    current_slot,
                }),
            },
        ),
    ];

    if active_validators == 0 {
        return Err(ScoreParamsError::ZeroActiveValidators);
    }
    let estimate = expected_aggregator_count_per_slot(spec, active_validators);
    if estimate.aggregators_per_slot == 0 {
        return Err(ScoreParamsError::ZeroAggregators);
    }

    inputs.push((
        GossipType::BeaconAggregateAndProof,
        TopicScoreInput {
            topic_weight: BEACON_AGGREGATE_PROOF_WEIGHT,
            expected_message_rate: estimate.aggregators_per_slot as f64,
            first_message_decay_time: epoch,
            mesh_message_info: Some(MeshMessageInfo {
                decay_slots: slots * 2,
                cap_factor: 4.0,
                activation_window: epoch,
                current_slot,
            }),
        },
    ));

    let subnet_count = spec.attestation_subnet_count;
    let multiple_bursts = estimate.committees_per_slot as f64 >= (2 * subnet_count) as f64 / slots as f64;
    let attestation = TopicScoreInput {
        topic_weight: 1.0 / subnet_count as f64,
        expected_message_rate: active_validators as f64 / subnet_count as f64 / slots as f64,
        first_message_decay_time: if multiple_bursts { epoch } else { epoch * 4 },
        mesh_message_info: Some(MeshMessageInfo {
            decay_slots: if multiple_bursts { slots * 4 } else { slots * 16 },
            cap_factor: 16.0,
            activation_window: if multiple_bursts {
                slot * (slots / 2 + 1) as u32
            } else {
                epoch
            },
            current_slot,
        }),
    };
    inputs.extend((0..subnet_count).map(|subnet| (GossipType::BeaconAttestation(subnet), attestation)));

    Ok(inputs)
}

// ============================================================================
// Derivation
// ============================================================================

fn slot_duration(spec: &ChainSpec) -> Duration {
    Duration::from_secs(spec.seconds_per_slot)
}

/// Sum of all topic weights times the per-topic positive cap.
pub fn max_positive_score(spec: &ChainSpec) -> f64 {
    let subnets = spec.attestation_subnet_count as f64;
    (MAX_IN_MESH_SCORE + MAX_FIRST_MESSAGE_DELIVERIES_SCORE)
        * (BEACON_BLOCK_WEIGHT
            + BEACON_AGGREGATE_PROOF_WEIGHT
            + (1.0 / subnets) * subnets
            + VOLUNTARY_EXIT_WEIGHT
            + PROPOSER_SLASHING_WEIGHT
            + ATTESTER_SLASHING_WEIGHT)
}

/// Per-interval decay factor that reaches `DECAY_TO_ZERO` after `decay_time`.
pub fn score_parameter_decay(decay_time: Duration, decay_interval: Duration) -> f64 {
    let ticks = decay_time.as_secs_f64() / decay_interval.as_secs_f64();
    DECAY_TO_ZERO.powf(1.0 / ticks)
}

/// Steady-state counter value for a counter fed `rate` per interval.
pub fn decay_convergence(decay: f64, rate: f64) -> f64 {
    rate / (1.0 - decay)
}

fn threshold(decay: f64, rate: f64) -> f64 {
    decay_convergence(decay, rate) * decay
}

pub fn compute_topic_score_params(spec: &ChainSpec, input: &TopicScoreInput) -> TopicScoreParams {
    let slot = slot_duration(spec);
    let epoch = slot * spec.slots_per_epoch as u32;
    let decay = |t: Duration| score_parameter_decay(t, slot);
    let max_positive = max_positive_score(spec);

    let mut params = TopicScoreParams {
        topic_weight: input.topic_weight,
        ..TopicScoreParams::default()
    };

    params.time_in_mesh_quantum = slot;
    params.time_in_mesh_cap = 3600.0 / slot.as_secs_f64();
    params.time_in_mesh_weight = MAX_IN_MESH_SCORE / params.time_in_mesh_cap;

    params.first_message_deliveries_decay = decay(input.first_message_decay_time);
    params.first_message_deliveries_cap = decay_convergence(
        params.first_message_deliveries_decay,
        2.0 * input.expected_message_rate / GOSSIP_D as f64,
    );
    params.first_message_deliveries_weight =
        MAX_FIRST_MESSAGE_DELIVERIES_SCORE / params.first_message_deliveries_cap;

    match input.mesh_message_info {
        Some(info) => {
            let decay_time = slot * info.decay_slots as u32;
            params.mesh_message_deliveries_decay = decay(decay_time);
            params.mesh_message_deliveries_threshold = threshold(
                params.mesh_message_deliveries_decay,
                input.expected_message_rate / 50.0,
            );
            params.mesh_message_deliveries_cap =
                (info.cap_factor * params.mesh_message_deliveries_threshold).max(2.0);
            params.mesh_message_deliveries_activation = info.activation_window;
            params.mesh_message_deliveries_window = MESH_MESSAGE_DELIVERIES_WINDOW;
            params.mesh_failure_penalty_decay = params.mesh_message_deliveries_decay;
            params.mesh_message_deliveries_weight = -max_positive
                / (params.topic_weight * params.mesh_message_deliveries_threshold.powi(2));
            params.mesh_failure_penalty_weight = params.mesh_message_deliveries_weight;
            if info.decay_slots >= info.current_slot {
                params.mesh_message_deliveries_threshold = 0.0;
                params.mesh_message_deliveries_weight = 0.0;
            }
        }
        None => {
            params.mesh_message_deliveries_weight = 0.0;
            params.mesh_message_deliveries_threshold = 0.0;
            params.mesh_message_deliveries_decay = 0.0;
            params.mesh_message_deliveries_cap = 0.0;
            params.mesh_message_deliveries_window = Duration::ZERO;
            params.mesh_message_deliveries_activation = Duration::ZERO;
            params.mesh_failure_penalty_decay = 0.0;
            params.mesh_failure_penalty_weight = 0.0;
        }
    }

    params.invalid_message_deliveries_weight = -max_positive / params.topic_weight;
    params.invalid_message_deliveries_decay = decay(epoch * 50);
    params
}

fn peer_level_params(spec: &ChainSpec, topics: HashMap<String, TopicScoreParams>) -> PeerScoreParams {
    let slot = slot_duration(spec);
    let epoch = slot * spec.slots_per_epoch as u32;
    let behaviour_penalty_decay = score_parameter_decay(epoch * 10, slot);
    let target = decay_convergence(behaviour_penalty_decay, 10.0 / spec.slots_per_epoch as f64)
        - BEHAVIOUR_PENALTY_THRESHOLD;
    let thresholds = PeerScoreThresholds::default();

    PeerScoreParams {
        topics,
        topic_score_cap: max_positive_score(spec) * 0.5,
        app_specific_weight: 1.0,
        behaviour_penalty_weight: thresholds.gossip_threshold / (target * target),
        behaviour_penalty_threshold: BEHAVIOUR_PENALTY_THRESHOLD,
        behaviour_penalty_decay,
        decay_interval: slot,
        decay_to_zero: DECAY_TO_ZERO,
        retain_score: epoch * 100,
    }
}

/// Full parameter set for every scored topic of every fork active at `current_slot`.
pub fn compute_score_params_at(
    spec: &ChainSpec,
    schedule: &ForkSchedule,
    current_slot: Slot,
    active_validators: u64,
) -> Result<PeerScoreParams, ScoreParamsError> {
    let inputs = topic_score_inputs(spec, current_slot, active_validators)?;
    let epoch = spec.epoch_at_slot(current_slot);

    let mut topics = HashMap::new();
    let mut cache: HashMap<TopicScoreInputKey, TopicScoreParams> = HashMap::new();
    for fork in schedule.active_forks(epoch) {
        for (kind, input) in &inputs {
            let topic = stringify_topic(schedule, &GossipTopic::new(fork, *kind))?;
            let params = cache
                .entry(TopicScoreInputKey::from(input))
                .or_insert_with(|| compute_topic_score_params(spec, input))
                .clone();
            topics.insert(topic, params);
        }
    }
    Ok(peer_level_params(spec, topics))
}

/// Parameters for the chain's current state.
pub fn compute_score_params(ctx: &dyn ChainContext) -> Result<PeerScoreParams, ScoreParamsError> {
    compute_score_params_at(
        ctx.spec(),
        ctx.fork_schedule(),
        ctx.current_slot(),
        ctx.active_validator_count(),
    )
}

/// Bitwise key so identical inputs (the 64 attestation subnets) derive once.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct TopicScoreInputKey([u64; 4]);

impl From<&TopicScoreInput> for TopicScoreInputKey {
    fn from(input: &TopicScoreInput) -> Self {
        Self([
            input.topic_weight.to_bits(),
            input.expected_message_rate.to_bits(),
            input.first_message_decay_time.as_nanos() as u64,
            input.mesh_message_info.map_or(u64::MAX, |m| m.decay_slots),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ForkName;

    fn spec() -> ChainSpec {
        ChainSpec::mainnet()
    }

    fn attestation_input(inputs: &[(GossipType, TopicScoreInput)]) -> TopicScoreInput {
        inputs
            .iter()
            .find(|(kind, _)| *kind == GossipType::BeaconAttestation(0))
            .map(|(_, input)| *input)
            .expect("attestation input present")
    }

    #[test]
    fn max_positive_score_matches_weights() {
        assert!((max_positive_score(&spec()) - 107.5).abs() < 1e-9);
    }

    #[test]
    fn decay_reaches_zero_after_window() {
        let slot = Duration::from_secs(12);
        let d = score_parameter_decay(slot * 10, slot);
        assert!((d.powi(10) - DECAY_TO_ZERO).abs() < 1e-12);
        assert!((decay_convergence(0.5, 1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn aggregator_estimate() {
        // 2^16 validators: 16 committees per slot of 128 validators each.
        let est = expected_aggregator_count_per_slot(&spec(), 65_536);
        assert_eq!(est.committees_per_slot, 16);
        assert_eq!(est.aggregators_per_slot, 16 * 16);

        let tiny = expected_aggregator_count_per_slot(&spec(), 10);
        assert_eq!(tiny.committees_per_slot, 1);
        assert_eq!(tiny.aggregators_per_slot, 1);
    }

    #[test]
    fn zero_validators_is_an_error() {
        assert_eq!(
            topic_score_inputs(&spec(), 100, 0),
            Err(ScoreParamsError::ZeroActiveValidators)
        );
    }

    #[test]
    fn attestation_rate_for_large_network_at_genesis() {
        let inputs = topic_score_inputs(&spec(), 0, 1_500_000).expect("valid context");
        let att = attestation_input(&inputs);
        assert_eq!(att.expected_message_rate, 1_500_000.0 / 64.0 / 32.0);

        let params = compute_topic_score_params(&spec(), &att);
        assert_eq!(params.mesh_message_deliveries_weight, 0.0);
        assert_eq!(params.mesh_message_deliveries_threshold, 0.0);
        assert!(params.mesh_failure_penalty_weight < 0.0);
    }

    #[test]
    fn mesh_penalties_enable_once_window_elapsed() {
        let slot = 32 * 100;
        let inputs = topic_score_inputs(&spec(), slot, 500_000).expect("valid context");
        let block = inputs
            .iter()
            .find(|(k, _)| *k == GossipType::BeaconBlock)
            .map(|(_, i)| *i)
            .expect("block input");
        let params = compute_topic_score_params(&spec(), &block);
        assert!(params.mesh_message_deliveries_threshold > 0.0);
        assert!(params.mesh_message_deliveries_weight < 0.0);
        assert!(params.mesh_message_deliveries_cap >= 2.0);
        assert_eq!(params.mesh_message_deliveries_window, Duration::from_secs(12));
    }

    #[test]
    fn topics_without_mesh_info_disable_p3() {
        let inputs = topic_score_inputs(&spec(), 10_000, 500_000).expect("valid context");
        let exit = inputs
            .iter()
            .find(|(k, _)| *k == GossipType::VoluntaryExit)
            .map(|(_, i)| *i)
            .expect("exit input");
        let params = compute_topic_score_params(&spec(), &exit);
        assert_eq!(params.mesh_message_deliveries_weight, 0.0);
        assert_eq!(params.mesh_failure_penalty_weight, 0.0);
        assert_eq!(
            params.invalid_message_deliveries_weight,
            -max_positive_score(&spec()) / VOLUNTARY_EXIT_WEIGHT
        );
        assert!((params.time_in_mesh_cap - 300.0).abs() < 1e-9);
    }

    #[test]
    fn first_delivery_cap_saturates_reward() {
        let inputs = topic_score_inputs(&spec(), 10_000, 500_000).expect("valid context");
        for (_, input) in &inputs {
            let params = compute_topic_score_params(&spec(), input);
            let max_p2 = params.first_message_deliveries_weight * params.first_message_deliveries_cap;
            assert!((max_p2 - MAX_FIRST_MESSAGE_DELIVERIES_SCORE).abs() < 1e-9);
        }
    }

    #[test]
    fn params_cover_all_active_forks() {
        let schedule = ForkSchedule::new(
            [0u8; 32],
            [
                (ForkName::Phase0, 0, [0, 0, 0, 0]),
                (ForkName::Altair, 10, [1, 0, 0, 0]),
            ],
        )
        .expect("schedule");
        let at_boundary = compute_score_params_at(&spec(), &schedule, 9 * 32, 100_000)
            .expect("valid context");
        assert_eq!(at_boundary.topics.len(), 2 * (5 + 64));

        let later = compute_score_params_at(&spec(), &schedule, 20 * 32, 100_000)
            .expect("valid context");
        assert_eq!(later.topics.len(), 5 + 64);
        assert!((later.topic_score_cap - 53.75).abs() < 1e-9);
        assert_eq!(later.retain_score, Duration::from_secs(12 * 32 * 100));
    }

    #[test]
    fn behaviour_penalty_weight_is_negative() {
        let params = PeerScoreParams::default();
        assert!(params.behaviour_penalty_weight < 0.0);
        assert!(params.behaviour_penalty_decay > 0.0 && params.behaviour_penalty_decay < 1.0);
    }
}
