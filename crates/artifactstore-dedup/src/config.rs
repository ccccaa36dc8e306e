//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::compression::CompressionBackend;
use crate::dedup::ChunkerConfig;
use crate::error::{DedupError, DedupResult};
use crate::vso::HashingBackend;

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Retention limits for the engine's pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle 2 MiB block buffers kept for reuse
    pub block_buffers_to_keep: usize,
    /// Idle SHA-256 contexts kept by the portable block hasher
    pub hashers_to_keep: usize,
    /// Idle compression workspaces kept
    pub workspaces_to_keep: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = available_cpus();
        Self {
            block_buffers_to_keep: 1000,
            hashers_to_keep: 2 * cpus,
            workspaces_to_keep: 4 * cpus,
        }
    }
}

/// Bloom filter sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Number of bits; rounded up to a whole word
    pub bit_count: u64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self { bit_count: 1 << 24 }
    }
}

/// Chunk compression settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// When false every chunk is stored uncompressed
    pub enabled: bool,
    /// Codec selection
    pub backend: CompressionBackend,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CompressionBackend::Auto,
        }
    }
}

/// Block hashing settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Block digest backend selection
    pub backend: HashingBackend,
}

/// Complete configuration for a [`crate::DedupEngine`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Pool retention
    pub pools: PoolConfig,
    /// Bloom filter sizing
    pub bloom: BloomConfig,
    /// Chunker and tree shape
    pub chunker: ChunkerConfig,
    /// Chunk compression
    pub compression: CompressionConfig,
    /// Block hashing
    pub hashing: HashingConfig,
}

impl DedupConfig {
    /// Parse from JSON; missing fields take their defaults. The result is validated.
    pub fn from_json(text: &str) -> DedupResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| DedupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> DedupResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| DedupError::Config(e.to_string()))
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> DedupResult<()> {
        if self.bloom.bit_count == 0 {
            return Err(DedupError::Config("bloom bit_count must be positive".into()));
        }
        self.chunker.validate()
    }
}
