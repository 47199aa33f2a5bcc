//! Configuration for cached

use crate::membership::GcTrigger;
use crate::node::{NodeSettings, ProtocolErrorPolicy};
use crate::sync::MergePolicy;
use clap::{Parser, ValueEnum};
use gossip_cache_net::{BroadcastPolicy, ClusterConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Smallest packet that still carries a member list and one message
const MIN_PACKET_BUDGET: usize = 256;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// cached - replicated create-only record store
#[derive(Parser, Debug, Clone)]
#[command(name = "cached")]
#[command(author, version, about = "gossip-cache replicated record store node", long_about = None)]
pub struct Config {
    /// Gossip port (0 picks a free port)
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Gossip bind address
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Gossip address advertised to peers, if different from the bound one
    #[arg(long)]
    pub advertise: Option<SocketAddr>,

    /// Client HTTP listen address
    #[arg(short, long, default_value = "0.0.0.0:0")]
    pub listen: SocketAddr,

    /// Unique node name (random if unset)
    #[arg(short, long, env = "CACHED_NODE_NAME")]
    pub name: Option<String>,

    /// Seed peers (comma-separated gossip addresses)
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Retransmit multiplier for creation broadcasts
    #[arg(long, default_value = "3")]
    pub retransmit_mult: u32,

    /// Maximum queued broadcasts
    #[arg(long, default_value = "4096")]
    pub max_queue_depth: usize,

    /// Let a newer broadcast for an id replace a queued one
    #[arg(long)]
    pub coalesce: bool,

    /// Do not re-broadcast creations learned from peers
    #[arg(long)]
    pub no_relay: bool,

    /// Membership signal that purges a node's records
    #[arg(long, value_enum, default_value_t = GcTrigger::Both)]
    pub gc_trigger: GcTrigger,

    /// Conflict resolution for join merges
    #[arg(long, value_enum, default_value_t = MergePolicy::RemoteWins)]
    pub merge_policy: MergePolicy,

    /// Handling of malformed inter-node payloads
    #[arg(long, value_enum, default_value_t = ProtocolErrorPolicy::Discard)]
    pub protocol_errors: ProtocolErrorPolicy,

    /// Gossip round interval in milliseconds
    #[arg(long, default_value = "200")]
    pub gossip_interval_ms: u64,

    /// Members contacted per gossip round
    #[arg(long, default_value = "3")]
    pub gossip_nodes: usize,

    /// Probe round interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub probe_interval_ms: u64,

    /// Timeout of a single probe in milliseconds
    #[arg(long, default_value = "500")]
    pub probe_timeout_ms: u64,

    /// Failed probes in a row before a member is declared left
    #[arg(long, default_value = "3")]
    pub suspicion_probes: u32,

    /// Seconds a departed member and its collected records stay refused
    #[arg(long, default_value = "600")]
    pub tombstone_ttl_secs: u64,

    /// Maximum gossip packet size in bytes
    #[arg(long, default_value = "1400")]
    pub packet_budget: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                anyhow::bail!("Node name cannot be empty");
            }
        }
        if self.retransmit_mult == 0 {
            anyhow::bail!("Retransmit multiplier must be at least 1");
        }
        if self.max_queue_depth == 0 {
            anyhow::bail!("Broadcast queue depth must be at least 1");
        }
        if self.gossip_nodes == 0 {
            anyhow::bail!("At least one member must be contacted per gossip round");
        }
        if self.suspicion_probes == 0 {
            anyhow::bail!("Suspicion probe count must be at least 1");
        }
        if self.packet_budget < MIN_PACKET_BUDGET {
            anyhow::bail!(
                "Packet budget of {} bytes is below the minimum of {}",
                self.packet_budget,
                MIN_PACKET_BUDGET
            );
        }
        if self.gossip_interval_ms == 0 || self.probe_interval_ms == 0 {
            anyhow::bail!("Gossip and probe intervals must be positive");
        }
        if self.tombstone_ttl_secs == 0 {
            anyhow::bail!("Tombstone TTL must be at least one second");
        }
        Ok(())
    }

    /// Configured name, or a random one
    pub fn node_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("node-{}", hex::encode(rand::random::<[u8; 4]>())),
        }
    }

    /// Substrate settings for the node life `incarnation`
    pub fn cluster_config(&self, name: &str, incarnation: u64) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            incarnation: Some(incarnation),
            bind: SocketAddr::new(self.bind, self.port),
            advertise: self.advertise,
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            gossip_nodes: self.gossip_nodes,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            suspicion_probes: self.suspicion_probes,
            packet_budget: self.packet_budget,
            tombstone_ttl: self.tombstone_ttl(),
        }
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            broadcast: BroadcastPolicy {
                retransmit_mult: self.retransmit_mult,
                max_queue_depth: self.max_queue_depth,
                coalesce: self.coalesce,
            },
            relay: !self.no_relay,
            gc_trigger: self.gc_trigger,
            merge_policy: self.merge_policy,
            protocol_errors: self.protocol_errors,
            fence_ttl: self.tombstone_ttl(),
        }
    }

    fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    /// Default log filter directive
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "cached=debug,gossip_cache_net=debug"
        } else {
            "cached=info,gossip_cache_net=info"
        }
    }
}
