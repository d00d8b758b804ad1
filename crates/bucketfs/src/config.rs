//! Mount configuration.
//!
//! Every option has a default, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn default_metadata_ttl_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_stream_flush_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_max_buffered_bytes() -> u64 {
    1024 * 1024 * 1024
}

/// Content block cache and read-ahead policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ContentCacheConfig {
    /// Maximum cached bytes, in megabytes
    pub max_size_mb: u64,
    /// Block granularity for cached ranges
    pub block_size_bytes: u64,
    /// Extra blocks fetched past the requested range on sequential reads
    pub readahead_blocks: u64,
    /// Non-contiguous reads before a handle is treated as random
    pub random_seek_threshold: u32,
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 256,
            block_size_bytes: 1024 * 1024,
            readahead_blocks: 2,
            random_seek_threshold: 2,
        }
    }
}

impl ContentCacheConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountConfig {
    /// Metadata TTL in seconds. Zero disables the metadata cache.
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_cache_ttl_secs: u64,

    #[serde(default)]
    pub content_cache: ContentCacheConfig,

    /// Serve gzip-encoded objects as stored instead of decoding them
    #[serde(default = "default_true")]
    pub gzip_passthrough: bool,

    /// Newly created files are written through unfinalized streams
    #[serde(default = "default_true")]
    pub streaming_writes: bool,

    /// Pending bytes on a streaming handle before they are appended
    #[serde(default = "default_stream_flush_bytes")]
    pub stream_flush_bytes: u64,

    /// Largest content a handle may hold locally before upload. Writes and
    /// truncations past it fail with `EFBIG`.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: u64,

    #[serde(default)]
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            metadata_cache_ttl_secs: default_metadata_ttl_secs(),
            content_cache: ContentCacheConfig::default(),
            gzip_passthrough: true,
            streaming_writes: true,
            stream_flush_bytes: default_stream_flush_bytes(),
            max_buffered_bytes: default_max_buffered_bytes(),
            read_only: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MountConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_cache_ttl_secs)
    }

    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.content_cache.block_size_bytes == 0 {
            errors.push("content-cache.block-size-bytes must be greater than zero".to_string());
        }
        if self.stream_flush_bytes == 0 {
            errors.push("stream-flush-bytes must be greater than zero".to_string());
        }
        if self.max_buffered_bytes == 0 {
            errors.push("max-buffered-bytes must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading mount configuration.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}
