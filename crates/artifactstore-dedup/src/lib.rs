#![warn(missing_docs)]

//! Artifact store dedup core: content identifiers, chunk compression, pooling, membership filtering and proofs
//!
//! Upload path: Stream → VSO blob id | Chunk (FastCDC) → Chunk/Node ids → Bloom check → Compress (Xpress) → Store
//! Proof path:  Chunk tree → Parent lookup → Ancestors of targets → Greedy coverage → Verify from roots

pub mod bloom;
pub mod compression;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod metrics;
pub mod pool;
pub mod proof;
pub mod vso;

pub use bloom::{BloomCheck, BloomFilter};
pub use compression::{
    select_codec, ChunkCompressor, CodecBackend, CompressedChunk, CompressionBackend,
    DedupCompressedBuffer, FastCodec, SafeCodec, MAX_CHUNK_SIZE,
};
pub use config::{BloomConfig, CompressionConfig, DedupConfig, HashingConfig, PoolConfig};
pub use dedup::{ChunkRecord, ChunkerConfig, DedupHasher, DedupNode, NodeKind};
pub use engine::DedupEngine;
pub use error::{DedupError, DedupResult};
pub use identifier::{
    AlgorithmId, BlobDedupLevel, BlobIdentifier, ChunkDedupIdentifier, DedupIdentifier, LongHash,
    NodeDedupIdentifier,
};
pub use metrics::{DedupMetric, DedupMetrics, MetricKind, MetricValue, MetricsSnapshot};
pub use pool::{ByteArrayPool, Pool, PoolHandle, PoolStats};
pub use proof::{
    approximate_min_coverage, build_parent_lookup, build_proof, build_proof_nodes, check_proof,
    determine_unvalidated_ids, verify_proof, NodeSet, ProofReport, TargetSizes,
};
pub use vso::{
    identifier_from_block_hashes, select_backend, BlobBlockHash, BlobIdentifierWithBlocks,
    BlockHashBackend, HashingBackend, RollingBlobIdentifier, VsoHasher,
};
