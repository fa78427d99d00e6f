//! # Node Configuration
//!
//! [`NetworkConfig`] aggregates the per-component configs. Every field is
//! optional in the JSON file; missing fields keep their defaults and
//! durations are written in milliseconds.
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:9000",
//!   "active_validators": 500000,
//!   "gossip": { "mesh_n": 8, "heartbeat_interval": 700 },
//!   "reqresp": { "ttfb_timeout": 5000 },
//!   "subnets": { "subscribe_all_subnets": true }
//! }
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainSpec, ForkName, ForkSchedule};
use crate::gossipsub::GossipSubConfig;
use crate::peer_score::ReputationConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::rpc::ReqRespConfig;
use crate::subnets::SubnetsConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen: SocketAddr,
    /// Peers dialed at startup.
    pub peers: Vec<SocketAddr>,
    /// Unix seconds; zero starts the chain when the node starts.
    pub genesis_time: u64,
    /// Hex encoded, 32 bytes.
    pub genesis_validators_root: String,
    /// Runs a single-fork devnet at this fork instead of the mainnet schedule.
    pub fork: Option<ForkName>,
    pub active_validators: u64,
    pub chain: ChainSpec,
    pub gossip: GossipSubConfig,
    pub reqresp: ReqRespConfig,
    pub rate_limiter: RateLimiterConfig,
    pub subnets: SubnetsConfig,
    pub reputation: ReputationConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            peers: Vec::new(),
            genesis_time: 0,
            genesis_validators_root: hex::encode([0u8; 32]),
            fork: None,
            active_validators: 16_384,
            chain: ChainSpec::mainnet(),
            gossip: GossipSubConfig::default(),
            reqresp: ReqRespConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            subnets: SubnetsConfig::default(),
            reputation: ReputationConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn genesis_validators_root(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(self.genesis_validators_root.trim_start_matches("0x"))
            .map_err(|e| ConfigError::Invalid(format!("genesis_validators_root: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::Invalid("genesis_validators_root must be 32 bytes".into()))
    }

    pub fn fork_schedule(&self) -> Result<ForkSchedule, ConfigError> {
        let root = self.genesis_validators_root()?;
        Ok(match self.fork {
            Some(fork) => ForkSchedule::single(fork, root),
            None => ForkSchedule::mainnet(root),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.genesis_validators_root()?;
        if self.active_validators == 0 {
            return Err(ConfigError::Invalid("active_validators must be greater than 0".into()));
        }

        let chain = &self.chain;
        if chain.seconds_per_slot == 0 || chain.slots_per_epoch == 0 {
            return Err(ConfigError::Invalid(
                "chain.seconds_per_slot and chain.slots_per_epoch must be greater than 0".into(),
            ));
        }
        if chain.attestation_subnet_count == 0 || chain.attestation_subnet_count > 64 {
            return Err(ConfigError::Invalid(
                "chain.attestation_subnet_count must be within 1..=64".into(),
            ));
        }
        if chain.attestation_subnet_prefix_bits > 63 {
            return Err(ConfigError::Invalid(
                "chain.attestation_subnet_prefix_bits must be below 64".into(),
            ));
        }

        let gossip = &self.gossip;
        if !(gossip.mesh_n_low <= gossip.mesh_n && gossip.mesh_n <= gossip.mesh_n_high) {
            return Err(ConfigError::Invalid(format!(
                "gossip mesh bounds must satisfy mesh_n_low <= mesh_n <= mesh_n_high, got {} {} {}",
                gossip.mesh_n_low, gossip.mesh_n, gossip.mesh_n_high
            )));
        }
        if gossip.mesh_outbound_min * 2 > gossip.mesh_n {
            return Err(ConfigError::Invalid(
                "gossip.mesh_outbound_min must be at most half of mesh_n".into(),
            ));
        }
        if gossip.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "gossip.heartbeat_interval must be greater than 0".into(),
            ));
        }

        let reqresp = &self.reqresp;
        if [
            reqresp.dial_timeout,
            reqresp.request_timeout,
            reqresp.ttfb_timeout,
            reqresp.resp_timeout,
        ]
        .iter()
        .any(|t| t.is_zero())
        {
            return Err(ConfigError::Invalid("reqresp timeouts must be greater than 0".into()));
        }
        if self.rate_limiter.window.is_zero() {
            return Err(ConfigError::Invalid("rate_limiter.window must be greater than 0".into()));
        }
        if self.reputation.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "reputation.max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        NetworkConfig::default().validate().expect("valid defaults");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{
            "active_validators": 500000,
            "gossip": { "mesh_n": 10, "heartbeat_interval": 1000 },
            "reqresp": { "ttfb_timeout": 2500 },
            "subnets": { "subscribe_all_subnets": true }
        }"#;
        let config: NetworkConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.active_validators, 500_000);
        assert_eq!(config.gossip.mesh_n, 10);
        assert_eq!(config.gossip.mesh_n_low, GossipSubConfig::default().mesh_n_low);
        assert_eq!(config.gossip.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.reqresp.ttfb_timeout, Duration::from_millis(2500));
        assert_eq!(config.reqresp.resp_timeout, Duration::from_secs(10));
        assert!(config.subnets.subscribe_all_subnets);
        config.validate().expect("valid");
    }

    #[test]
    fn rejects_inverted_mesh_bounds() {
        let mut config = NetworkConfig::default();
        config.gossip.mesh_n_low = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_active_validators() {
        let config = NetworkConfig {
            active_validators: 0,
            ..NetworkConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_root() {
        let config = NetworkConfig {
            genesis_validators_root: "abcd".into(),
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_roundtrips_as_millis() {
        let json = serde_json::to_value(ReqRespConfig::default()).expect("serialize");
        assert_eq!(json["resp_timeout"], 10_000);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NetworkConfig::load_from_path(Path::new("/nonexistent/beacon-p2p.json"))
            .expect_err("missing");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
