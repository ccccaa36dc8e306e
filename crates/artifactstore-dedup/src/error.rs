//! Error types for the artifact store dedup core

use crate::identifier::{AlgorithmId, DedupIdentifier};

/// Result alias used throughout the crate
pub type DedupResult<T> = Result<T, DedupError>;

/// All errors that can occur while identifying, compressing or proving content
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Identifier bytes were missing, too short, odd-length, or not valid hex
    #[error("Invalid hash: {len} byte algorithm result is not a valid identifier digest")]
    InvalidHash {
        /// Length of the rejected digest in bytes
        len: usize,
    },
    /// Algorithm id byte is not in the registry
    #[error("Unsupported algorithm id: {0}")]
    UnsupportedAlgorithm(u8),
    /// A fallible chunk/node cast was applied to the other kind of identifier
    #[error("Wrong identifier kind: expected {expected}, found algorithm id {actual}")]
    WrongIdentifierKind {
        /// Kind required by the cast
        expected: AlgorithmId,
        /// Algorithm byte actually carried by the identifier
        actual: u8,
    },
    /// Stream ended before the declared number of bytes was read
    #[error("Truncated stream: expected {expected} bytes, stream ended after {actual}")]
    TruncatedStream {
        /// Declared stream length
        expected: u64,
        /// Bytes read before end of stream
        actual: u64,
    },
    /// Rolling identifier received a block after its final block
    #[error("Final block already added")]
    FinalBlockAlreadyAdded,
    /// Blob identifier requested from an empty block hash sequence
    #[error("At least one block hash is required to compute a blob identifier")]
    EmptyBlockList,
    /// Compression destination is too small; store the chunk uncompressed
    #[error("Compression buffer too small")]
    BufferTooSmall,
    /// Compressed input is malformed
    #[error("Corrupt compressed stream: {0}")]
    CorruptStream(String),
    /// A proof claims a size that disagrees with the tree
    #[error("Size mismatch for {id}: claimed {claimed} bytes, tree records {actual}")]
    SizeMismatch {
        /// Identifier whose size is inconsistent
        id: DedupIdentifier,
        /// Size claimed by the caller
        claimed: u64,
        /// Transitive size recorded by the node
        actual: u64,
    },
    /// Proof nodes do not reach every target
    #[error("Incomplete coverage: {} target(s) not covered by the proof", uncovered.len())]
    IncompleteCoverage {
        /// Targets left uncovered
        uncovered: Vec<DedupIdentifier>,
    },
    /// A proof target is neither a known node nor the child of one
    #[error("Proof target not found: {0}")]
    ProofTargetNotFound(DedupIdentifier),
    /// A pooled item was accessed after it went back to its pool
    #[error("Pooled item used after release")]
    UseAfterRelease,
    /// A node or chunk was used where the other shape is required
    #[error("Invalid node: {0}")]
    InvalidNode(String),
    /// An argument was outside its accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Configuration failed to parse or validate
    #[error("Configuration error: {0}")]
    Config(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DedupError {
    /// True for errors that signal corrupted or forged data rather than a bad call
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DedupError::CorruptStream(_)
                | DedupError::SizeMismatch { .. }
                | DedupError::IncompleteCoverage { .. }
        )
    }
}
