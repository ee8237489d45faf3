//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file is valid.
//!
//! ```toml
//! [engine]
//! worker_count = 8
//! log_level = "info"
//!
//! [chunking]
//! target_chunk_size = 32768
//!
//! [blocks]
//! max_block_size = 8388608
//! max_chunks_per_block = 1024
//! min_block_usage_percent = 0
//!
//! [store]
//! retry_count = 3
//! retry_backoff_ms = 50
//! lru_block_count = 32
//! compression = "zstd"
//! ```

use depot_core::{Error, Result};
use depot_store::{CompressionRegistry, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub chunking: ChunkingSection,
    #[serde(default)]
    pub blocks: BlocksSection,
    #[serde(default)]
    pub store: StoreSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Job pool and runtime size; 0 uses every logical CPU
    #[serde(default)]
    pub worker_count: usize,
    /// `tracing-subscriber` filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_count: 0,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingSection {
    #[serde(default = "default_target_chunk_size")]
    pub target_chunk_size: u32,
}

impl Default for ChunkingSection {
    fn default() -> Self {
        Self {
            target_chunk_size: default_target_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksSection {
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u32,
    #[serde(default = "default_max_chunks_per_block")]
    pub max_chunks_per_block: u32,
    #[serde(default)]
    pub min_block_usage_percent: u32,
}

impl Default for BlocksSection {
    fn default() -> Self {
        Self {
            max_block_size: default_max_block_size(),
            max_chunks_per_block: default_max_chunks_per_block(),
            min_block_usage_percent: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Blocks kept in memory while updating; 0 disables the cache
    #[serde(default = "default_lru_block_count")]
    pub lru_block_count: usize,
    /// `none`, `zstd-min`, `zstd`, `zstd-max`, `deflate-fast`, `deflate` or `deflate-best`
    #[serde(default = "default_compression")]
    pub compression: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lru_block_count: default_lru_block_count(),
            compression: default_compression(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_target_chunk_size() -> u32 {
    32 * 1024
}

fn default_max_block_size() -> u32 {
    8 * 1024 * 1024
}

fn default_max_chunks_per_block() -> u32 {
    1024
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_lru_block_count() -> usize {
    32
}

fn default_compression() -> String {
    "zstd".to_string()
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::invalid(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::from_io(e, path.display().to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::invalid(format!("config: {}", e)))
    }

    /// Range checks
    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_chunk_size < 64 {
            return Err(Error::invalid(format!(
                "chunking.target_chunk_size must be at least 64, got {}",
                self.chunking.target_chunk_size
            )));
        }
        if self.blocks.max_block_size == 0 || self.blocks.max_chunks_per_block == 0 {
            return Err(Error::invalid("blocks.max_block_size and blocks.max_chunks_per_block must be non-zero"));
        }
        if self.blocks.min_block_usage_percent > 100 {
            return Err(Error::invalid(format!(
                "blocks.min_block_usage_percent must be at most 100, got {}",
                self.blocks.min_block_usage_percent
            )));
        }
        if self.store.retry_count > 16 {
            return Err(Error::invalid("store.retry_count must be at most 16"));
        }
        CompressionRegistry::tag_for_name(&self.store.compression)?;
        Ok(())
    }

    /// Configured worker count, resolving 0 to the number of logical CPUs
    pub fn worker_count(&self) -> usize {
        match self.engine.worker_count {
            0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.store.retry_count,
            base_backoff: Duration::from_millis(self.store.retry_backoff_ms),
        }
    }

    /// Block tag for new content
    pub fn compression_tag(&self) -> Result<u32> {
        CompressionRegistry::tag_for_name(&self.store.compression)
    }
}
