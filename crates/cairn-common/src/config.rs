//! Configuration types for Cairn
//!
//! This module defines the configuration tree of a storage node. Every field
//! has a default so a partial TOML file is enough to start a node.

use crate::error::{Error, Result};
use crate::types::Mode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a Cairn node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        for (i, shard) in self.shards.iter().enumerate() {
            if shard.weight <= 0.0 {
                return Err(Error::configuration(format!(
                    "shard #{i}: weight must be positive"
                )));
            }
            let wc = &shard.writecache;
            if wc.enabled && wc.small_object_size > wc.max_object_size {
                return Err(Error::configuration(format!(
                    "shard #{i}: writecache small_object_size exceeds max_object_size"
                )));
            }
            if wc.enabled && wc.flush_workers == 0 {
                return Err(Error::configuration(format!(
                    "shard #{i}: writecache needs at least one flush worker"
                )));
            }
        }
        Ok(())
    }
}

/// Node identity
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Base directory; relative shard paths are resolved against it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_node_name() -> String {
    "cairn-node".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cairn")
}

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Transient errors a shard may report before it is switched to read-only
    /// (0 disables the switch)
    #[serde(default = "default_error_threshold")]
    pub shard_ro_error_threshold: u32,
    /// Capacity of every shard's GC event channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_ro_error_threshold: default_error_threshold(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

const fn default_error_threshold() -> u32 {
    100
}

const fn default_event_capacity() -> usize {
    16
}

/// Configuration of one shard
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Stable shard identifier; generated from the path when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Shard root directory
    pub path: PathBuf,
    /// Placement weight (higher = preferred more often)
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Mode the shard starts in
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub blobstor: BlobStorConfig,
    #[serde(default)]
    pub writecache: WriteCacheConfig,
    #[serde(default)]
    pub gc: GcConfig,
}

impl ShardConfig {
    /// Shard config with defaults rooted at `path`
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            id: None,
            path: path.into(),
            weight: default_weight(),
            mode: Mode::default(),
            blobstor: BlobStorConfig::default(),
            writecache: WriteCacheConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

const fn default_weight() -> f64 {
    1.0
}

/// Blob store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStorConfig {
    /// Compress objects with zstd unless the caller opts out
    #[serde(default)]
    pub compress: bool,
    /// Objects up to this size go to the small-object database
    #[serde(default = "default_blob_small_size")]
    pub small_object_size: u64,
}

impl Default for BlobStorConfig {
    fn default() -> Self {
        Self {
            compress: false,
            small_object_size: default_blob_small_size(),
        }
    }
}

const fn default_blob_small_size() -> u64 {
    1024 * 1024 // 1 MB
}

/// Write-cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Cache directory, relative to the shard path when not absolute
    #[serde(default = "default_wc_path")]
    pub path: PathBuf,
    /// Objects up to this size go to the keyed database
    #[serde(default = "default_wc_small_size")]
    pub small_object_size: u64,
    /// Objects above this size bypass the cache
    #[serde(default = "default_wc_max_size")]
    pub max_object_size: u64,
    /// Total bytes the cache may hold
    #[serde(default = "default_wc_size_limit")]
    pub size_limit: u64,
    /// Workers moving small objects to the main storage
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,
    /// Interval between small-object flush scans (milliseconds)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Interval between big-object eviction passes (milliseconds); ten
    /// small-object intervals when unset
    #[serde(default)]
    pub big_flush_interval_ms: Option<u64>,
    /// Keys read from the database per flush batch
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    /// Flushed addresses remembered before their cache copy is evicted
    #[serde(default = "default_flushed_capacity")]
    pub flushed_capacity: usize,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_wc_path(),
            small_object_size: default_wc_small_size(),
            max_object_size: default_wc_max_size(),
            size_limit: default_wc_size_limit(),
            flush_workers: default_flush_workers(),
            flush_interval_ms: default_flush_interval_ms(),
            big_flush_interval_ms: None,
            flush_batch_size: default_flush_batch_size(),
            flushed_capacity: default_flushed_capacity(),
        }
    }
}

impl WriteCacheConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub const fn big_flush_interval(&self) -> Duration {
        match self.big_flush_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(self.flush_interval_ms.saturating_mul(10)),
        }
    }
}

fn default_wc_path() -> PathBuf {
    PathBuf::from("writecache")
}

const fn default_wc_small_size() -> u64 {
    32 * 1024 // 32 KB
}

const fn default_wc_max_size() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

const fn default_wc_size_limit() -> u64 {
    1024 * 1024 * 1024 // 1 GB
}

const fn default_flush_workers() -> usize {
    20
}

const fn default_flush_interval_ms() -> u64 {
    1000
}

const fn default_flush_batch_size() -> usize {
    512
}

const fn default_flushed_capacity() -> usize {
    10_000
}

/// Garbage collector configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Interval between physical remover passes (milliseconds)
    #[serde(default = "default_remover_interval_ms")]
    pub remover_interval_ms: u64,
    /// Maximum objects deleted per remover pass
    #[serde(default = "default_remover_batch_size")]
    pub remover_batch_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            remover_interval_ms: default_remover_interval_ms(),
            remover_batch_size: default_remover_batch_size(),
        }
    }
}

impl GcConfig {
    #[must_use]
    pub const fn remover_interval(&self) -> Duration {
        Duration::from_millis(self.remover_interval_ms)
    }
}

const fn default_remover_interval_ms() -> u64 {
    10_000
}

const fn default_remover_batch_size() -> usize {
    100
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
