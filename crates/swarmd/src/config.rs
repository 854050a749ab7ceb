//! Configuration for swarmd

use clap::{Parser, ValueEnum};
use std::ops::RangeInclusive;
use std::time::Duration;
use swarm_net::ConnectionConfig;

/// Signaling backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Shared key-value store with per-recipient mailboxes
    Mailbox,
    /// Chat relay with a shared channel and private messages
    Relay,
}

/// swarmd - local peer swarm computing the maximum of random values
#[derive(Parser, Debug, Clone)]
#[command(name = "swarmd")]
#[command(about = "Runs a swarm of peers that agree on the maximum of their random values")]
pub struct Config {
    /// Number of peers to run in this process
    #[arg(short, long, default_value = "3", env = "SWARM_PEERS")]
    pub peers: usize,

    /// Signaling backend
    #[arg(short, long, value_enum, default_value = "mailbox", env = "SWARM_BACKEND")]
    pub backend: Backend,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "3000", env = "SWARM_HEARTBEAT_MS")]
    pub heartbeat_ms: u64,

    /// Peer timeout in milliseconds
    #[arg(long, default_value = "7000", env = "SWARM_PEER_TIMEOUT_MS")]
    pub peer_timeout_ms: u64,

    /// Smallest value a peer may draw
    #[arg(long, default_value = "1")]
    pub min_value: i64,

    /// Largest value a peer may draw
    #[arg(long, default_value = "1000")]
    pub max_value: i64,

    /// Candidates buffered per peer before the offer/answer arrives
    #[arg(long, default_value = "32")]
    pub max_buffered_candidates: usize,

    /// Data channel label
    #[arg(long, default_value = "swarm")]
    pub channel_label: String,

    /// ICE servers (comma-separated URLs)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "SWARM_ICE_SERVERS"
    )]
    pub ice_servers: Vec<String>,

    /// Regenerate a random peer's value every N seconds
    #[arg(long)]
    pub regenerate_secs: Option<u64>,

    /// Stop after N seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// RNG seed for reproducible values
    #[arg(long, env = "SWARM_SEED")]
    pub seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peers == 0 {
            anyhow::bail!("At least one peer is required");
        }
        if self.min_value > self.max_value {
            anyhow::bail!(
                "Empty value range: {} > {}",
                self.min_value,
                self.max_value
            );
        }
        if self.heartbeat_ms == 0 {
            anyhow::bail!("Heartbeat interval must be positive");
        }
        if self.peer_timeout_ms < self.heartbeat_ms.saturating_mul(2) {
            anyhow::bail!(
                "Peer timeout ({} ms) must be at least twice the heartbeat interval ({} ms)",
                self.peer_timeout_ms,
                self.heartbeat_ms
            );
        }
        if self.max_buffered_candidates == 0 {
            anyhow::bail!("Candidate buffer must hold at least one candidate");
        }
        if self.regenerate_secs == Some(0) {
            anyhow::bail!("Regeneration period must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    /// Per-node settings derived from this configuration
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            value_range: self.min_value..=self.max_value,
            max_buffered_candidates: self.max_buffered_candidates,
            connection: ConnectionConfig {
                ice_servers: self.ice_servers.clone(),
                channel_label: self.channel_label.clone(),
            },
            seed: self.seed,
        }
    }
}

/// Runtime settings of one node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub heartbeat_interval: Duration,
    pub peer_timeout: Duration,
    pub value_range: RangeInclusive<i64>,
    pub max_buffered_candidates: usize,
    pub connection: ConnectionConfig,
    /// Seed for the value generator; entropy if unset
    pub seed: Option<u64>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            peer_timeout: Duration::from_secs(7),
            value_range: 1..=1000,
            max_buffered_candidates: 32,
            connection: ConnectionConfig::default(),
            seed: None,
        }
    }
}
