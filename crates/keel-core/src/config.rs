//! Configuration system for Keel.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $KEEL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/keel/config.toml
//!   3. ~/.config/keel/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub file: FileConfig,
    pub mempool: MempoolConfig,
    pub acl: AclConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Soft cap per priority queue. Queued plus session-parked requests
    /// above this fail with queue overflow. Highest is exempt.
    pub max_queue_depth: usize,
    /// Default per-request timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Weighted round across priority classes instead of draining
    /// higher classes fully first.
    pub weighted_dequeue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Body size ceiling in bytes. Larger requests are answered with
    /// RequestTooBig without reading the body.
    pub max_message_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of connections the pool owns.
    pub connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Bounded LRU capacity for decrypted chunks. 0 disables the cache
    /// (a single inlined chunk slot is used instead).
    pub max_cached_chunks: usize,
    /// Block size for whole-file digest/MAC passes, in bytes.
    pub max_processing_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Cell count of the first bucket in each size class.
    pub initial_cells: usize,
    /// Ceiling on a single bucket's byte size; growth doubling stops here.
    pub max_bucket_bytes: usize,
    /// Garbage-collection period in seconds.
    pub gc_interval_secs: u64,
    /// An empty bucket is dropped after this many seconds unless reused.
    pub drop_bucket_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    /// Cache Deny/Unknown outcomes as well as Grant. Off by default so
    /// a rule edit is not shadowed by a cached negative.
    pub cache_negative: bool,
    /// Decision cache TTL in seconds. 0 = no expiry.
    pub cache_ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            file: FileConfig::default(),
            mempool: MempoolConfig::default(),
            acl: AclConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 64,
            default_timeout_ms: 10_000,
            weighted_dequeue: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { connections: 4 }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            max_cached_chunks: 8,
            max_processing_size: 0x100000, // 1 MiB
        }
    }
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            initial_cells: 64,
            max_bucket_bytes: 16 * 1024 * 1024,
            gc_interval_secs: 15,
            drop_bucket_delay_secs: 30,
        }
    }
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            cache_negative: false,
            cache_ttl_secs: 60,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("keel")
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

impl KeelConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            KeelConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("KEEL_CONFIG")
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
            let text = toml::to_string_pretty(&KeelConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply KEEL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KEEL_CLIENT__MAX_QUEUE_DEPTH") {
            if let Ok(n) = v.parse() {
                self.client.max_queue_depth = n;
            }
        }
        if let Ok(v) = std::env::var("KEEL_CLIENT__DEFAULT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                self.client.default_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("KEEL_CLIENT__WEIGHTED_DEQUEUE") {
            self.client.weighted_dequeue = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("KEEL_SERVER__MAX_MESSAGE_SIZE") {
            if let Ok(n) = v.parse() {
                self.server.max_message_size = n;
            }
        }
        if let Ok(v) = std::env::var("KEEL_POOL__CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.pool.connections = n;
            }
        }
        if let Ok(v) = std::env::var("KEEL_ACL__CACHE_NEGATIVE") {
            self.acl.cache_negative = v == "true" || v == "1";
        }
    }
}
