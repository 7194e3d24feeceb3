//! Configuration system for Cairn.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub swarm: SwarmConfig,
    pub task: TaskConfig,
    pub transfer: TransferConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the Ed25519 secret key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen address for peer streams.
    pub listen_addr: String,
    /// Local HTTP API port (bound to 127.0.0.1).
    pub api_port: u16,
    /// Peers dialled at startup, as `peer_id_hex@host:port`.
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Lifetime of a discovery session from its first request.
    pub ttl_secs: u64,
    /// Requests held while busy. Further requests are not cached.
    pub pending_capacity: usize,
    pub sweep_interval_secs: u64,
    /// How long `discover` waits for the requested number of answers.
    pub collect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Join and leave waits.
    pub join_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Poll interval of the running-job monitor.
    pub monitor_interval_secs: u64,
    /// Run, inspect and list-images waits.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Where incoming image archives are staged before loading.
    pub temp_dir: PathBuf,
    pub reply_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4700".to_string(),
            api_port: 9001,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            pending_capacity: 5,
            sweep_interval_secs: 10,
            collect_timeout_secs: 30,
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            join_timeout_secs: 60,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("cairn-transfer"),
            reply_timeout_secs: 300,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("cairn.db"),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn collect_timeout(&self) -> Duration {
        Duration::from_secs(self.collect_timeout_secs)
    }
}

impl SwarmConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl TaskConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl TransferConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* overrides. `get` looks a variable up by name.
    /// Unparseable numbers leave the current value in place.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("CAIRN_IDENTITY__KEYPAIR_PATH") {
            self.identity.keypair_path = PathBuf::from(v);
        }
        if let Some(v) = get("CAIRN_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(p) = get("CAIRN_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = get("CAIRN_NETWORK__BOOTSTRAP_PEERS") {
            self.network.bootstrap_peers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = get("CAIRN_DISCOVERY__TTL_SECS").and_then(|v| v.parse().ok()) {
            self.discovery.ttl_secs = n;
        }
        if let Some(n) = get("CAIRN_DISCOVERY__PENDING_CAPACITY").and_then(|v| v.parse().ok()) {
            self.discovery.pending_capacity = n;
        }
        if let Some(n) = get("CAIRN_DISCOVERY__COLLECT_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.discovery.collect_timeout_secs = n;
        }
        if let Some(n) = get("CAIRN_DISCOVERY__SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.discovery.sweep_interval_secs = n;
        }
        if let Some(n) = get("CAIRN_SWARM__JOIN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.swarm.join_timeout_secs = n;
        }
        if let Some(n) = get("CAIRN_TASK__MONITOR_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.task.monitor_interval_secs = n;
        }
        if let Some(n) = get("CAIRN_TASK__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.task.request_timeout_secs = n;
        }
        if let Some(v) = get("CAIRN_TRANSFER__TEMP_DIR") {
            self.transfer.temp_dir = PathBuf::from(v);
        }
        if let Some(n) = get("CAIRN_TRANSFER__REPLY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.transfer.reply_timeout_secs = n;
        }
        if let Some(v) = get("CAIRN_STORE__PATH") {
            self.store.path = PathBuf::from(v);
        }
    }
}
