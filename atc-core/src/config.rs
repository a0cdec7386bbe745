//! Configuration for the ATC core

use crate::types::{Currency, PartyId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Which store to open
    pub storage: StorageBackend,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,

    /// Tenant currency
    pub currency: Currency,

    /// Grant policy
    pub policy: GrantPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/atc"),
            service_name: "atc-engine".to_string(),
            storage: StorageBackend::Memory,
            rocksdb: RocksDbConfig::default(),
            currency: Currency::KES,
            policy: GrantPolicy::default(),
        }
    }
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory maps (lost on restart)
    Memory,
    /// RocksDB under `data_dir`
    Rocksdb,
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Tenant policy for grants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantPolicy {
    /// New grants start in pending-approval instead of draft
    pub require_approval: bool,

    /// Parties allowed to grant without holding a parent grant
    pub root_authorities: Vec<PartyId>,

    /// Deepest allowed grant chain
    pub max_hierarchy_depth: usize,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self {
            require_approval: false,
            root_authorities: Vec::new(),
            max_hierarchy_depth: 8,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `ATC_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("ATC_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("ATC_STORAGE") {
            self.storage = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "rocksdb" => StorageBackend::Rocksdb,
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown storage backend: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(code) = std::env::var("ATC_CURRENCY") {
            self.currency = Currency::from_code(&code)
                .ok_or_else(|| crate::Error::Config(format!("Unknown currency: {}", code)))?;
        }

        if let Ok(flag) = std::env::var("ATC_REQUIRE_APPROVAL") {
            self.policy.require_approval = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        if let Ok(list) = std::env::var("ATC_ROOT_AUTHORITIES") {
            self.policy.root_authorities = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Uuid::parse_str(s)
                        .map(PartyId::new)
                        .map_err(|e| crate::Error::Config(format!("Bad party id {}: {}", s, e)))
                })
                .collect::<crate::Result<Vec<_>>>()?;
        }

        Ok(())
    }
}
