//! Content-defined chunking (FastCDC) and chunk/node tree construction

pub mod node;

pub use node::{DedupNode, NodeKind, SERIALIZED_CHILD_LEN};

use std::io::Read;

use bytes::Bytes;
use fastcdc::v2020::FastCDC;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::compression::MAX_CHUNK_SIZE;
use crate::error::{DedupError, DedupResult};
use crate::identifier::{ChunkDedupIdentifier, DedupIdentifier};

// Bounds accepted by the v2020 FastCDC constructor.
const FASTCDC_MIN_SIZE: usize = 64;
const FASTCDC_AVG_SIZE: usize = 256;
const FASTCDC_MAX_SIZE: usize = 1024;

/// Configuration for the FastCDC chunker and tree shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Average (target) chunk size in bytes
    pub avg_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Fan-out of inner nodes
    pub max_children_per_node: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 32 * 1024,
            avg_size: 64 * 1024,
            max_size: MAX_CHUNK_SIZE,
            max_children_per_node: 512,
        }
    }
}

impl ChunkerConfig {
    /// Check sizes are ordered, within FastCDC's limits and compressible,
    /// and that the tree fan-out can make progress.
    pub fn validate(&self) -> DedupResult<()> {
        if self.min_size < FASTCDC_MIN_SIZE
            || self.avg_size < FASTCDC_AVG_SIZE
            || self.max_size < FASTCDC_MAX_SIZE
        {
            return Err(DedupError::Config(format!(
                "chunk sizes {}/{}/{} below chunker minimums {}/{}/{}",
                self.min_size,
                self.avg_size,
                self.max_size,
                FASTCDC_MIN_SIZE,
                FASTCDC_AVG_SIZE,
                FASTCDC_MAX_SIZE
            )));
        }
        if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
            return Err(DedupError::Config(
                "chunk sizes must satisfy min <= avg <= max".into(),
            ));
        }
        if self.max_size > MAX_CHUNK_SIZE {
            return Err(DedupError::Config(format!(
                "max chunk size {} exceeds {}",
                self.max_size, MAX_CHUNK_SIZE
            )));
        }
        if self.max_children_per_node < 2 {
            return Err(DedupError::Config(
                "max_children_per_node must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// A content-defined chunk produced by the chunker
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Byte offset of this chunk in the original data stream
    pub offset: u64,
    /// Chunk content
    pub data: Bytes,
    /// Chunk identifier
    pub id: ChunkDedupIdentifier,
}

impl ChunkRecord {
    /// Leaf node for this chunk
    pub fn to_node(&self) -> DedupNode {
        DedupNode::chunk(*self.id.hash(), self.data.len() as u64)
    }
}

/// Splits content into chunks and builds the chunk/node tree over them
#[derive(Debug, Clone)]
pub struct DedupHasher {
    config: ChunkerConfig,
}

impl Default for DedupHasher {
    fn default() -> Self {
        Self {
            config: ChunkerConfig::default(),
        }
    }
}

impl DedupHasher {
    /// Hasher with a validated configuration
    pub fn new(config: ChunkerConfig) -> DedupResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active configuration
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk data using FastCDC and hash every chunk.
    /// Concatenating all chunk data reconstructs the input.
    pub fn chunk(&self, data: &[u8]) -> Vec<ChunkRecord> {
        if data.is_empty() {
            return Vec::new();
        }
        let shared = Bytes::copy_from_slice(data);
        FastCDC::new(
            data,
            self.config.min_size as u32,
            self.config.avg_size as u32,
            self.config.max_size as u32,
        )
        .map(|c| {
            let content = shared.slice(c.offset..c.offset + c.length);
            ChunkRecord {
                offset: c.offset as u64,
                id: ChunkDedupIdentifier::calculate(&content),
                data: content,
            }
        })
        .collect()
    }

    /// Group leaves bottom-up into inner nodes of at most
    /// `max_children_per_node` children until one root remains. A level that
    /// leaves a single node behind promotes it unchanged.
    pub fn build_tree(&self, leaves: Vec<DedupNode>) -> DedupResult<DedupNode> {
        let fanout = self.config.max_children_per_node.max(2);
        let mut level = leaves;
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(fanout));
            let mut pending = level.into_iter().peekable();
            while pending.peek().is_some() {
                let group: Vec<DedupNode> = pending.by_ref().take(fanout).collect();
                if group.len() == 1 {
                    next.extend(group);
                } else {
                    next.push(DedupNode::inner(group)?);
                }
            }
            level = next;
        }
        // An empty stream is one empty chunk
        Ok(level.pop().unwrap_or_else(|| DedupNode::chunk_of(&[])))
    }

    /// Root of the chunk tree for `data`
    pub fn compute_node_of_bytes(&self, data: &[u8]) -> DedupResult<DedupNode> {
        let leaves = self.chunk(data).iter().map(ChunkRecord::to_node).collect();
        self.build_tree(leaves)
    }

    /// Read the whole stream and build its chunk tree
    #[instrument(skip(self, reader))]
    pub fn compute_node<R: Read>(&self, mut reader: R) -> DedupResult<DedupNode> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let root = self.compute_node_of_bytes(&data)?;
        debug!(
            bytes = data.len(),
            root = %root.dedup_id(),
            "dedup tree computed"
        );
        Ok(root)
    }

    /// Identifier of the stream's root node (or its single chunk)
    pub fn compute_identifier<R: Read>(&self, reader: R) -> DedupResult<DedupIdentifier> {
        Ok(self.compute_node(reader)?.dedup_id())
    }
}
