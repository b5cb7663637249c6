//! Configuration module for the tablet master
//!
//! Supports YAML configuration files with module-based organization

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// HTTP API listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Snapshot save interval (seconds)
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
    /// Tablet manager configuration
    #[serde(default)]
    pub tablet_manager: TabletManagerConfig,
    /// Tablet tracker configuration
    #[serde(default)]
    pub tracker: TabletTrackerConfig,
    /// Tablet action configuration
    #[serde(default)]
    pub actions: TabletActionConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            data_dir: default_data_dir(),
            http_addr: default_http_addr(),
            save_interval_secs: default_save_interval_secs(),
            tablet_manager: TabletManagerConfig::default(),
            tracker: TabletTrackerConfig::default(),
            actions: TabletActionConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Merge with another config (other takes precedence)
    pub fn merge(&mut self, other: MasterConfig) {
        if !other.cluster_name.is_empty() {
            self.cluster_name = other.cluster_name;
        }
        if !other.data_dir.is_empty() {
            self.data_dir = other.data_dir;
        }
        if !other.http_addr.is_empty() {
            self.http_addr = other.http_addr;
        }
        if other.save_interval_secs > 0 {
            self.save_interval_secs = other.save_interval_secs;
        }
        self.tablet_manager.merge(other.tablet_manager);
        self.tracker.merge(other.tracker);
        self.actions.merge(other.actions);
        self.log.merge(other.log);
    }

    /// Get save interval as Duration
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

/// Tablet manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletManagerConfig {
    /// Per-tablet cost added to placement sizes (bytes)
    #[serde(default = "default_tablet_data_size_footprint")]
    pub tablet_data_size_footprint: i64,
    /// Maximum number of tablets per table
    #[serde(default = "default_max_tablet_count")]
    pub max_tablet_count: usize,
    /// Maximum number of running actions per bundle (0 = unlimited)
    #[serde(default)]
    pub max_active_actions_per_bundle: usize,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        Self {
            tablet_data_size_footprint: default_tablet_data_size_footprint(),
            max_tablet_count: default_max_tablet_count(),
            max_active_actions_per_bundle: 0,
        }
    }
}

impl TabletManagerConfig {
    fn merge(&mut self, other: Self) {
        if other.tablet_data_size_footprint > 0 {
            self.tablet_data_size_footprint = other.tablet_data_size_footprint;
        }
        if other.max_tablet_count > 0 {
            self.max_tablet_count = other.max_tablet_count;
        }
        if other.max_active_actions_per_bundle > 0 {
            self.max_active_actions_per_bundle = other.max_active_actions_per_bundle;
        }
    }
}

/// Tablet tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletTrackerConfig {
    /// Interval between cell scans (milliseconds)
    #[serde(default = "default_cell_scan_period_ms")]
    pub cell_scan_period_ms: u64,
    /// Unseen peers are revoked after this timeout (seconds)
    #[serde(default = "default_peer_revocation_timeout_secs")]
    pub peer_revocation_timeout_secs: u64,
    /// Unseen leaders are replaced after this timeout (seconds)
    #[serde(default = "default_leader_reassignment_timeout_secs")]
    pub leader_reassignment_timeout_secs: u64,
    /// Scans are skipped while fewer nodes are online
    #[serde(default)]
    pub safe_online_node_count: usize,
    /// Nodes are marked offline after this heartbeat silence (seconds)
    #[serde(default = "default_node_heartbeat_timeout_secs")]
    pub node_heartbeat_timeout_secs: u64,
}

impl Default for TabletTrackerConfig {
    fn default() -> Self {
        Self {
            cell_scan_period_ms: default_cell_scan_period_ms(),
            peer_revocation_timeout_secs: default_peer_revocation_timeout_secs(),
            leader_reassignment_timeout_secs: default_leader_reassignment_timeout_secs(),
            safe_online_node_count: 0,
            node_heartbeat_timeout_secs: default_node_heartbeat_timeout_secs(),
        }
    }
}

impl TabletTrackerConfig {
    fn merge(&mut self, other: Self) {
        if other.cell_scan_period_ms > 0 {
            self.cell_scan_period_ms = other.cell_scan_period_ms;
        }
        if other.peer_revocation_timeout_secs > 0 {
            self.peer_revocation_timeout_secs = other.peer_revocation_timeout_secs;
        }
        if other.leader_reassignment_timeout_secs > 0 {
            self.leader_reassignment_timeout_secs = other.leader_reassignment_timeout_secs;
        }
        if other.safe_online_node_count > 0 {
            self.safe_online_node_count = other.safe_online_node_count;
        }
        if other.node_heartbeat_timeout_secs > 0 {
            self.node_heartbeat_timeout_secs = other.node_heartbeat_timeout_secs;
        }
    }

    /// Get cell scan period as Duration
    pub fn cell_scan_period(&self) -> Duration {
        Duration::from_millis(self.cell_scan_period_ms)
    }

    /// Get peer revocation timeout as Duration
    pub fn peer_revocation_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_revocation_timeout_secs)
    }

    /// Get leader reassignment timeout as Duration
    pub fn leader_reassignment_timeout(&self) -> Duration {
        Duration::from_secs(self.leader_reassignment_timeout_secs)
    }
}

/// Tablet action configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletActionConfig {
    /// Interval between cleanups of expired actions (seconds)
    #[serde(default = "default_actions_cleanup_period_secs")]
    pub cleanup_period_secs: u64,
    /// Retention of finished actions created with `keep_finished` (seconds)
    #[serde(default = "default_action_expiration_timeout_secs")]
    pub expiration_timeout_secs: u64,
}

impl Default for TabletActionConfig {
    fn default() -> Self {
        Self {
            cleanup_period_secs: default_actions_cleanup_period_secs(),
            expiration_timeout_secs: default_action_expiration_timeout_secs(),
        }
    }
}

impl TabletActionConfig {
    fn merge(&mut self, other: Self) {
        if other.cleanup_period_secs > 0 {
            self.cleanup_period_secs = other.cleanup_period_secs;
        }
        if other.expiration_timeout_secs > 0 {
            self.expiration_timeout_secs = other.expiration_timeout_secs;
        }
    }

    /// Get cleanup period as Duration
    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_period_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: Self) {
        if !other.level.is_empty() {
            self.level = other.level;
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_data_dir() -> String {
    "./tablet_master_data".to_string()
}

fn default_http_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_save_interval_secs() -> u64 {
    60
}

fn default_tablet_data_size_footprint() -> i64 {
    64 * 1024 * 1024 // 64MB
}

fn default_max_tablet_count() -> usize {
    10000
}

fn default_cell_scan_period_ms() -> u64 {
    5000 // 5 seconds
}

fn default_peer_revocation_timeout_secs() -> u64 {
    60 // 1 minute
}

fn default_leader_reassignment_timeout_secs() -> u64 {
    15
}

fn default_node_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_actions_cleanup_period_secs() -> u64 {
    60
}

fn default_action_expiration_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}
