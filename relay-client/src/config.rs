//! Configuration for the relay client.
//!
//! Configuration is loaded from a TOML file or built in code. Every field
//! has a default, so an empty file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use mte_relay_core::{RepairPolicy, StatusRange};
use serde::{Deserialize, Serialize};

/// Bounds for the streaming channel depth.
const MIN_CHANNEL_DEPTH: usize = 1;
const MAX_CHANNEL_DEPTH: usize = 4;

/// Per-host relay client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Session pairs per host (default: 3).
    pub pool_size: usize,
    /// Consecutive re-pairs allowed (default: `pool_size`).
    pub repair_budget: Option<u32>,
    /// Statuses meaning "pairing invalid" (default: 559-569).
    pub repair_status: StatusRange,
    /// Plaintext bytes per upload chunk (default: 64 KiB).
    pub upload_chunk_size: usize,
    /// Ciphertext bytes per download chunk (default: 64 KiB).
    pub download_chunk_size: usize,
    /// Bounded channel depth for streaming, clamped to 1-4 (default: 2).
    pub channel_depth: usize,
    /// Bodies larger than this are streamed (default: 1 MiB).
    pub stream_threshold: usize,
    /// Persist pairing state between runs (default: true).
    pub persist_state: bool,
    /// Timeout for one relayed request in seconds (default: 30).
    pub request_timeout_secs: u64,
    /// Header names encrypted in addition to `content-type`.
    pub headers_to_encrypt: Vec<String>,
    /// Capability probe route (default: `api/mte-relay`).
    pub probe_route: String,
    /// Pairing route (default: `api/mte-pair`).
    pub pair_route: String,
}

// Default value functions
fn default_pool_size() -> usize {
    3
}

fn default_chunk_size() -> usize {
    64 * 1024 // 64 KiB
}

fn default_channel_depth() -> usize {
    2
}

fn default_stream_threshold() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            repair_budget: None,
            repair_status: StatusRange::default(),
            upload_chunk_size: default_chunk_size(),
            download_chunk_size: default_chunk_size(),
            channel_depth: default_channel_depth(),
            stream_threshold: default_stream_threshold(),
            persist_state: true,
            request_timeout_secs: default_request_timeout_secs(),
            headers_to_encrypt: Vec::new(),
            probe_route: "api/mte-relay".to_string(),
            pair_route: "api/mte-pair".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.upload_chunk_size == 0 || self.download_chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk sizes must be non-zero".into()));
        }
        if self.repair_budget == Some(0) {
            return Err(ConfigError::Invalid("repair_budget must be at least 1".into()));
        }
        self.repair_status
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// Re-pair budget, defaulting to the pool size.
    pub fn repair_budget(&self) -> u32 {
        self.repair_budget
            .unwrap_or_else(|| u32::try_from(self.pool_size).unwrap_or(u32::MAX))
    }

    /// Reserved range plus budget.
    pub fn repair_policy(&self) -> RepairPolicy {
        RepairPolicy {
            reserved: self.repair_status,
            budget: self.repair_budget(),
        }
    }

    /// Channel depth clamped to the supported range.
    pub fn channel_depth(&self) -> usize {
        self.channel_depth.clamp(MIN_CHANNEL_DEPTH, MAX_CHANNEL_DEPTH)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
