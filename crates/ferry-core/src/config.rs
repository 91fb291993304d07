//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::new_id;
use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub scheduler: SchedulerConfig,
    pub sessions: SessionsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// 32 hex chars. Generated when empty.
    pub device_id: String,
    /// Name shown to other peers.
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Multicast announcements, falling back to scan if the socket fails.
    Broadcast,
    /// Active /24 subnet probing only.
    Scan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port of the transfer listener.
    pub listen_port: u16,
    /// Port of the local HTTP control API.
    pub api_port: u16,
    pub discovery: DiscoveryMode,
    pub announce_interval_secs: u64,
    /// Clamped to 5..=10.
    pub refresh_interval_secs: u64,
    /// Clamped to 15..=30.
    pub peer_timeout_secs: u64,
    pub probe_timeout_ms: u64,
    pub max_concurrent_probes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub idle_timeout_secs: u64,
    pub max_chunk_retries: u32,
    /// Bytes. 0 = adaptive tier.
    pub chunk_size: u32,
    /// 0 = unlimited.
    pub speed_limit_bytes_per_sec: u64,
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    pub backoff_step_secs: u64,
    pub max_concurrent: usize,
    pub min_free_bytes: u64,
    pub min_battery_percent: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub retention_days: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunks, sessions and the work queue live under here.
    pub data_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "ferry".to_string()),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: wire::DEFAULT_PORT,
            api_port: 4280,
            discovery: DiscoveryMode::Broadcast,
            announce_interval_secs: wire::ANNOUNCE_INTERVAL_SECS,
            refresh_interval_secs: wire::REFRESH_INTERVAL_SECS,
            peer_timeout_secs: wire::PEER_TIMEOUT_SECS,
            probe_timeout_ms: 500,
            max_concurrent_probes: wire::MAX_CONCURRENT_PROBES,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: wire::IDLE_TIMEOUT_SECS,
            max_chunk_retries: 3,
            chunk_size: 0,
            speed_limit_bytes_per_sec: 0,
            download_dir: dirs_or_home().join("Downloads").join("ferry"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_secs: 60,
            max_concurrent: 2,
            min_free_bytes: 64 * 1024 * 1024,
            min_battery_percent: 5,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            cleanup_interval_secs: 3600,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: data_dir() }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl NetworkConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.clamp(5, 10))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.clamp(15, 30))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }
}

impl TransferConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    /// `None` selects the adaptive tier.
    pub fn chunk_size_override(&self) -> Option<u32> {
        (self.chunk_size > 0).then_some(self.chunk_size)
    }
}

impl SessionsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

impl IdentityConfig {
    /// Device id as the 16 raw bytes carried in announcements.
    pub fn device_id_bytes(&self) -> Option<[u8; 16]> {
        hex::decode(&self.device_id).ok()?.try_into().ok()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
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

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        config.ensure_device_id();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    ///
    /// The seeded file carries a freshly generated device id so the
    /// identity stays stable across restarts.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let mut config = FerryConfig::default();
            config.ensure_device_id();
            let text = toml::to_string_pretty(&config).map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Replace a missing or malformed device id with a generated one.
    pub fn ensure_device_id(&mut self) {
        if self.identity.device_id_bytes().is_none() {
            self.identity.device_id = new_id();
        }
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.storage.data_dir.join("chunks")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.storage.data_dir.join("sessions")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.storage.data_dir.join("queue.json")
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("FERRY_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(p) = var("FERRY_NETWORK__API_PORT").and_then(|v| v.parse().ok()) {
            self.network.api_port = p;
        }
        if let Some(v) = var("FERRY_NETWORK__DISCOVERY") {
            match v.as_str() {
                "broadcast" => self.network.discovery = DiscoveryMode::Broadcast,
                "scan" => self.network.discovery = DiscoveryMode::Scan,
                _ => {}
            }
        }
        if let Some(n) = var("FERRY_TRANSFER__SPEED_LIMIT").and_then(|v| v.parse().ok()) {
            self.transfer.speed_limit_bytes_per_sec = n;
        }
        if let Some(v) = var("FERRY_TRANSFER__DOWNLOAD_DIR") {
            self.transfer.download_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FERRY_STORAGE__DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FERRY_IDENTITY__DEVICE_NAME") {
            self.identity.device_name = v;
        }
    }
}
