// src/config.rs

//! Layered TOML configuration: one file parsed with `serde` + `toml`,
//! validated at load time, overridable by a small set of CLI flags.
//!
//! Parses permissively with `#[serde(default = ...)]` on every field, then
//! runs a `validate()` pass that rejects nonsensical combinations before
//! the server ever binds a socket.

use crate::core::cluster::membership::NodeCapabilities;
use crate::core::persistence::SyncPolicy;
use crate::core::storage::EvictionPolicyKind;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Controls the `tracing-subscriber` `EnvFilter` used at startup.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    format!("node-{}", hex::encode(rand::random::<[u8; 8]>()))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_addr")]
    pub resp_bind_addr: String,
    #[serde(default = "default_resp_port")]
    pub resp_port: u16,
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,
    /// Address advertised to peers in `MOVED` replies and gossip; defaults
    /// to `resp_bind_addr` when unset.
    #[serde(default)]
    pub advertise_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_resp_port() -> u16 {
    6379
}
fn default_gossip_port() -> u16 {
    16379
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            resp_bind_addr: default_bind_addr(),
            resp_port: default_resp_port(),
            gossip_port: default_gossip_port(),
            advertise_addr: None,
        }
    }
}

impl NetworkConfig {
    pub fn advertised_host(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.resp_bind_addr)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(
        default = "default_failure_detection_timeout",
        with = "humantime_serde"
    )]
    pub failure_detection_timeout: Duration,
    /// Grace period a `Dead` node is retained before being reaped from the
    /// membership table entirely.
    #[serde(default = "default_reap_after", with = "humantime_serde")]
    pub reap_after: Duration,
    /// Virtual nodes per physical node on the replica-ordering hash ring
    /// (, default 256).
    #[serde(default = "default_vnodes")]
    pub vnodes_per_node: usize,
    /// Number of replicas fanned out to by the event bus / replication
    /// path for each key (beyond the owning node).
    #[serde(default = "default_replica_fanout")]
    pub replica_fanout: usize,
    /// Shared key used to HMAC-sign gossip envelopes so a stray UDP packet
    /// from outside the cluster can't forge membership state. Every node
    /// in a cluster must configure the same value.
    #[serde(default = "default_cluster_secret")]
    pub cluster_secret: String,
}

fn default_cluster_secret() -> String {
    "hypercache-default-secret-change-me".to_string()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_millis(500)
}
fn default_failure_detection_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_reap_after() -> Duration {
    Duration::from_secs(60)
}
fn default_vnodes() -> usize {
    256
}
fn default_replica_fanout() -> usize {
    2
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            heartbeat_interval: default_heartbeat_interval(),
            failure_detection_timeout: default_failure_detection_timeout(),
            reap_after: default_reap_after(),
            vnodes_per_node: default_vnodes(),
            replica_fanout: default_replica_fanout(),
            cluster_secret: default_cluster_secret(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_memory")]
    pub max_memory: MaxMemory,
    #[serde(default, with = "humantime_serde::option")]
    pub default_ttl: Option<Duration>,
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(default)]
    pub eviction_policy: EvictionPolicyKind,
    #[serde(default = "default_filter_fpr")]
    pub filter_false_positive_rate: f64,
    /// Initial sizing hint for the membership filter; not a hard cap on
    /// the store (the filter degrades gracefully past this, see
    /// `CuckooFilter::insert`'s saturation handling).
    #[serde(default = "default_filter_capacity")]
    pub filter_capacity_hint: usize,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_filter_fpr() -> f64 {
    0.01
}
fn default_filter_capacity() -> usize {
    100_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            default_ttl: None,
            cleanup_interval: default_cleanup_interval(),
            eviction_policy: EvictionPolicyKind::default(),
            filter_false_positive_rate: default_filter_fpr(),
            filter_capacity_hint: default_filter_capacity(),
        }
    }
}

/// Accepts either a raw byte count or a human string (`"512mb"`) in the
/// config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MaxMemory {
    Bytes(usize),
    Human(String),
}

fn default_max_memory() -> MaxMemory {
    MaxMemory::Bytes(512 * 1024 * 1024)
}

impl MaxMemory {
    pub fn resolve(&self) -> Result<usize> {
        match self {
            MaxMemory::Bytes(b) => Ok(*b),
            MaxMemory::Human(s) => parse_human_bytes(s),
        }
    }
}

fn parse_human_bytes(s: &str) -> Result<usize> {
    let lower = s.to_lowercase();
    let (digits, multiplier) = if let Some(v) = lower.strip_suffix("gb") {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix('g') {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix("mb") {
        (v, 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix('m') {
        (v, 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix("kb") {
        (v, 1024)
    } else if let Some(v) = lower.strip_suffix('k') {
        (v, 1024)
    } else {
        (lower.as_str(), 1)
    };
    let value: usize = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid cache.max_memory value '{s}'"))?;
    Ok(value * multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicyConfig {
    Always,
    #[default]
    Interval,
    Never,
}

impl From<SyncPolicyConfig> for SyncPolicy {
    fn from(v: SyncPolicyConfig) -> Self {
        match v {
            SyncPolicyConfig::Always => SyncPolicy::Always,
            SyncPolicyConfig::Interval => SyncPolicy::Interval,
            SyncPolicyConfig::Never => SyncPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub sync_policy: SyncPolicyConfig,
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,
    #[serde(default = "default_snapshot_interval", with = "humantime_serde")]
    pub snapshot_interval: Duration,
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    #[serde(default = "default_retain_logs")]
    pub retain_logs: usize,
    /// `0` disables zstd compression of snapshots.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_persistence_enabled() -> bool {
    true
}
fn default_sync_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_snapshot_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_max_log_size() -> u64 {
    64 * 1024 * 1024
}
fn default_retain_logs() -> usize {
    2
}
fn default_compression_level() -> i32 {
    3
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            sync_policy: SyncPolicyConfig::default(),
            sync_interval: default_sync_interval(),
            snapshot_interval: default_snapshot_interval(),
            max_log_size: default_max_log_size(),
            retain_logs: default_retain_logs(),
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

fn default_max_connections() -> usize {
    10_000
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            command_timeout: default_command_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// The fully resolved, validated server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Loads and validates a TOML configuration file. Missing sections and
    /// fields fall back to their defaults so a minimal file (or none at
    /// all, via `Config::default`) is usable.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.network.resp_port == 0 {
            return Err(anyhow!("network.resp_port cannot be 0"));
        }
        if self.network.gossip_port == 0 {
            return Err(anyhow!("network.gossip_port cannot be 0"));
        }
        if self.network.resp_port == self.network.gossip_port {
            return Err(anyhow!(
                "network.resp_port and network.gossip_port must differ"
            ));
        }
        if self.node.id.trim().is_empty() {
            return Err(anyhow!("node.id cannot be empty"));
        }
        if self.cluster.failure_detection_timeout <= self.cluster.heartbeat_interval {
            return Err(anyhow!(
                "cluster.failure_detection_timeout must be greater than cluster.heartbeat_interval"
            ));
        }
        if !(0.0..1.0).contains(&self.cache.filter_false_positive_rate) {
            return Err(anyhow!(
                "cache.filter_false_positive_rate must be in [0, 1)"
            ));
        }
        self.cache.max_memory.resolve().map(|_| ())?;
        if self.server.max_connections == 0 {
            return Err(anyhow!("server.max_connections cannot be 0"));
        }
        if self.cluster.cluster_secret.is_empty() {
            return Err(anyhow!("cluster.cluster_secret cannot be empty"));
        }
        Ok(())
    }

    /// `--node-id` CLI override.
    pub fn with_node_id_override(mut self, node_id: Option<String>) -> Self {
        if let Some(id) = node_id {
            self.node.id = id;
        }
        self
    }

    /// `--port` CLI override: overrides `network.resp_port`.
    pub fn with_port_override(mut self, port: Option<u16>) -> Self {
        if let Some(p) = port {
            self.network.resp_port = p;
        }
        self
    }

    pub fn node_data_dir(&self) -> PathBuf {
        self.node.data_dir.join(&self.node.id)
    }

    pub fn local_capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_matching_resp_and_gossip_ports() {
        let mut config = Config::default();
        config.network.gossip_port = config.network.resp_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_failure_timeout_not_greater_than_heartbeat() {
        let mut config = Config::default();
        config.cluster.failure_detection_timeout = config.cluster.heartbeat_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_human_readable_max_memory() {
        assert_eq!(parse_human_bytes("512mb").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_human_bytes("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_human_bytes("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_str = r#"
            [node]
            id = "node-a"

            [network]
            resp_port = 7000
            gossip_port = 7001
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.id, "node-a");
        assert_eq!(config.network.resp_port, 7000);
        assert_eq!(config.cache.eviction_policy, EvictionPolicyKind::Lru);
    }
}
