//! WolfLog Configuration
//!
//! This module provides configuration structures for a WolfLog node:
//! storage layout, cluster shape, epoch caching and replication tuning.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Main WolfLog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfLogConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Transaction log storage configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Epoch chain configuration
    #[serde(default)]
    pub epoch: EpochConfig,

    /// Replication session tuning
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human readable node name
    pub id: String,

    /// Address to bind for replica connections (leader only)
    pub bind_address: String,

    /// Data directory for chunks and checkpoints
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fixed instance id. A fresh one is generated per process when unset.
    #[serde(default)]
    pub instance_id: Option<Uuid>,
}

/// Transaction log storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Logical size of a chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Total number of voting nodes, leader included
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,

    /// Leader address replicas connect to (host:port)
    #[serde(default)]
    pub leader_address: Option<String>,

    /// Expected leader instance id; learned from the leader when unset
    #[serde(default)]
    pub leader_id: Option<Uuid>,

    /// Whether this node may count toward quorum as a follower
    #[serde(default = "default_true")]
    pub promotable: bool,
}

/// Epoch chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Number of most recent epochs kept in memory
    #[serde(default = "default_epoch_cache_size")]
    pub cache_size: usize,
}

/// Replication session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Maximum bytes read per bulk message
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Maximum unacknowledged bytes in flight per replica
    #[serde(default = "default_send_window")]
    pub send_window: i64,

    /// Interval between subscription pumps when idle, in milliseconds
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,

    /// Time without enough followers before reporting no quorum, in milliseconds
    #[serde(default = "default_no_quorum_timeout_ms")]
    pub no_quorum_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Base delay before a replica reconnects, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_chunk_size() -> u64 {
    256 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_cluster_size() -> usize {
    1
}

fn default_epoch_cache_size() -> usize {
    10
}

fn default_bulk_size() -> usize {
    8192
}

fn default_send_window() -> i64 {
    16 * 1024 * 1024
}

fn default_pump_interval_ms() -> u64 {
    50
}

fn default_no_quorum_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolflog")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            fsync: true,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_size: default_cluster_size(),
            leader_address: None,
            leader_id: None,
            promotable: true,
        }
    }
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            cache_size: default_epoch_cache_size(),
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            bulk_size: default_bulk_size(),
            send_window: default_send_window(),
            pump_interval_ms: default_pump_interval_ms(),
            no_quorum_timeout_ms: default_no_quorum_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl ReplicationSettings {
    /// Get pump interval as Duration
    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    /// Get no-quorum timeout as Duration
    pub fn no_quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.no_quorum_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfLogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfLogConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfLogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.cluster_size == 0 {
            return Err(crate::Error::Config("cluster.cluster_size must be at least 1".into()));
        }

        if self.epoch.cache_size == 0 {
            return Err(crate::Error::Config("epoch.cache_size must be at least 1".into()));
        }

        // Chunk numbers are stored as i32 and offsets must fit the header math
        if self.log.chunk_size < 4096 || self.log.chunk_size > i32::MAX as u64 {
            return Err(crate::Error::Config(format!(
                "log.chunk_size must be between 4096 and {} bytes",
                i32::MAX
            )));
        }

        if self.replication.bulk_size == 0 {
            return Err(crate::Error::Config("replication.bulk_size must be positive".into()));
        }

        if self.replication.send_window <= 0 {
            return Err(crate::Error::Config("replication.send_window must be positive".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the chunk directory path
    pub fn chunk_dir(&self) -> PathBuf {
        self.node.data_dir.join("chunks")
    }

    /// Instance id for this process
    pub fn instance_id(&self) -> Uuid {
        self.node.instance_id.unwrap_or_else(Uuid::new_v4)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }

    /// Get reconnect delay as Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.replication.reconnect_delay_ms)
    }

    /// Calculate quorum size
    pub fn quorum_size(&self) -> usize {
        (self.cluster.cluster_size / 2) + 1
    }
}
