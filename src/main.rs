use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use beacon_p2p::gossipsub::PendingGossipMessage;
use beacon_p2p::protocols::GossipValidator;
use beacon_p2p::{ChainContext, NetworkConfig, NodeBuilder, PeerId, ValidationResult};

#[derive(Parser, Debug)]
#[command(name = "beacon-p2p")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; command-line values override it.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peer to dial at startup; repeatable.
    #[arg(short = 'p', long = "peer", value_name = "ADDR")]
    peers: Vec<SocketAddr>,

    /// Active validator count used for topic scoring.
    #[arg(long)]
    validators: Option<u64>,

    /// Genesis time in unix seconds.
    #[arg(long)]
    genesis_time: Option<u64>,

    #[arg(long)]
    subscribe_all_subnets: bool,

    #[arg(long)]
    allow_publish_to_zero_peers: bool,

    #[arg(short, long, default_value = "60")]
    telemetry_interval: u64,
}

/// Relays every well-formed message; chain validation lives outside this binary.
struct RelayValidator;

#[async_trait]
impl GossipValidator for RelayValidator {
    async fn validate(&self, message: &PendingGossipMessage) -> Result<ValidationResult> {
        debug!(topic = %message.topic, bytes = message.data.len(), "relaying gossip");
        Ok(ValidationResult::Accept)
    }
}

fn load_config(args: &Args) -> Result<NetworkConfig> {
    let mut config = match &args.config {
        Some(path) => NetworkConfig::load_from_path(path)?,
        None => NetworkConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    config.peers.extend(args.peers.iter().copied());
    if let Some(validators) = args.validators {
        config.active_validators = validators;
    }
    if let Some(genesis_time) = args.genesis_time {
        config.genesis_time = genesis_time;
    }
    if args.subscribe_all_subnets {
        config.subnets.subscribe_all_subnets = true;
    }
    if args.allow_publish_to_zero_peers {
        config.gossip.allow_publish_to_zero_peers = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args).context("loading configuration")?;
    let local = PeerId::random();
    info!("Peer id: {}", local.to_hex());

    let builder = NodeBuilder::new(config, Arc::new(RelayValidator))?;
    let (node, mut messages) = builder.bind_tcp(local).await?;

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(message) = messages.recv() => {
                debug!(topic = %message.topic, from = %message.from.short(), "gossip message");
            }
            _ = interval.tick() => {
                let subscriptions = node.gossip().subscriptions().await.map(|s| s.len()).unwrap_or(0);
                let active_subnets = node.subnets().active_subnets().await.map(|s| s.len()).unwrap_or(0);
                info!(
                    slot = node.chain().current_slot(),
                    peers = node.connected_peers().len(),
                    subscriptions,
                    active_subnets,
                    seq_number = node.metadata().seq_number,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
