//! Configuration types for the TFS client
//!
//! Every field has a default; a TOML file and `TFS__*` environment variables
//! can override them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{DEFAULT_BLOCK_CACHE_ITEMS, DEFAULT_BLOCK_CACHE_TIME};

/// Client configuration
///
/// Durations are in milliseconds unless the field name says otherwise. The
/// tunables keep the signed 64-bit type of the runtime setters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default name server address (`host:port`)
    pub ns_addr: String,
    /// Resolver cache and idle connection lifetime in seconds
    pub cache_time_secs: i64,
    /// Resolver cache capacity
    pub cache_items: i64,
    /// Write buffer size and large-file segment size in bytes
    pub segment_size: i64,
    /// Large-file segments uploaded concurrently
    pub batch_count: i64,
    /// Statistics reporting interval
    pub stat_interval_ms: i64,
    /// Orphan segment collection interval
    pub gc_interval_ms: i64,
    /// Age after which an orphan segment is removed
    pub gc_expired_time_ms: i64,
    /// Upper bound for one batch of segment uploads
    pub batch_timeout_ms: i64,
    /// Per-attempt request timeout; zero or negative disables it
    pub wait_timeout_ms: i64,
    /// Total attempts for a retryable request
    pub client_retry_count: i64,
    /// Maximum simultaneously open descriptors
    pub max_open_files: usize,
    /// Maximum cached connections per kind
    pub max_connections: usize,
    /// Run the background maintenance task
    pub start_background: bool,
    /// Logging configuration
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ns_addr: "127.0.0.1:8108".to_string(),
            cache_time_secs: DEFAULT_BLOCK_CACHE_TIME,
            cache_items: DEFAULT_BLOCK_CACHE_ITEMS,
            segment_size: 2 * 1024 * 1024,
            batch_count: 8,
            stat_interval_ms: 120_000,
            gc_interval_ms: 43_200_000,
            gc_expired_time_ms: 86_400_000,
            batch_timeout_ms: 30_000,
            wait_timeout_ms: 3_000,
            client_retry_count: 3,
            max_open_files: 65_534,
            max_connections: 1_024,
            start_background: true,
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at `ns_addr` with the given cache settings
    #[must_use]
    pub fn with_server(ns_addr: impl Into<String>, cache_time_secs: i64, cache_items: i64) -> Self {
        Self {
            ns_addr: ns_addr.into(),
            cache_time_secs,
            cache_items,
            ..Self::default()
        }
    }

    /// Load configuration from defaults, an optional TOML file and the
    /// environment (`TFS__WAIT_TIMEOUT_MS=500`, `TFS__LOG__LEVEL=debug`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("TFS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Write logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
