//! VSO whole-content hash.
//!
//! Content is cut into 2 MiB blocks of 32 × 64 KiB pages. Each block gets a
//! digest over its page digests (see [`backend`]), and block digests are folded
//! in stream order into a rolling SHA-256 seeded with a fixed constant:
//!
//! ```text
//! rolling = SHA256(rolling ‖ block_hash ‖ is_final)
//! ```
//!
//! The blob identifier is the final rolling value tagged with algorithm id 0.

pub mod backend;

use std::fmt;
use std::io::{ErrorKind, Read};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, trace};

use crate::error::{DedupError, DedupResult};
use crate::identifier::{AlgorithmId, BlobIdentifier};
use crate::metrics::DedupMetrics;
use crate::pool::{ByteArrayPool, Pool};

pub use backend::{
    select_backend, BlockHashBackend, HashingBackend, ParallelBlockHasher, PortableBlockHasher,
};

/// Algorithm tag of VSO identifiers
pub const ALGORITHM_ID: u8 = AlgorithmId::Vso.as_byte();
/// Page size in bytes
pub const PAGE_SIZE: usize = 64 * 1024;
/// Pages per block
pub const PAGES_PER_BLOCK: usize = 32;
/// Block size in bytes
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;
/// Identifier of the empty stream
pub const OF_NOTHING_HEX: &str = "1E57CF2792A900D06C1CDFB3C453F35BC86F72788AA9724C96C929D1CC6B456A00";

const ROLLING_SEED: &[u8] = b"VSO Content Identifier Seed";

/// Digest of one block
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobBlockHash(pub [u8; 32]);

impl BlobBlockHash {
    /// Uppercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse the hex form
    pub fn from_hex(text: &str) -> DedupResult<Self> {
        let bytes = hex::decode(text.trim()).map_err(|_| DedupError::InvalidHash {
            len: text.len() / 2,
        })?;
        let hash: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DedupError::InvalidHash { len: bytes.len() })?;
        Ok(Self(hash))
    }
}

impl fmt::Debug for BlobBlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobBlockHash({})", self.to_hex())
    }
}

/// Accumulates block digests into a blob identifier.
///
/// Accepts any number of [`update`](Self::update)s followed by exactly one
/// [`finalize`](Self::finalize); nothing is accepted after that.
#[derive(Debug, Clone)]
pub struct RollingBlobIdentifier {
    rolling_id: Vec<u8>,
    finalized: bool,
}

impl Default for RollingBlobIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingBlobIdentifier {
    /// Fresh accumulator holding the seed
    pub fn new() -> Self {
        Self {
            rolling_id: ROLLING_SEED.to_vec(),
            finalized: false,
        }
    }

    fn fold(&mut self, block_hash: &BlobBlockHash, is_final: bool) -> DedupResult<()> {
        if self.finalized {
            return Err(DedupError::FinalBlockAlreadyAdded);
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.rolling_id);
        hasher.update(block_hash.0);
        hasher.update([u8::from(is_final)]);
        self.rolling_id = hasher.finalize().to_vec();
        self.finalized = is_final;
        Ok(())
    }

    /// Fold in a non-final block
    pub fn update(&mut self, block_hash: &BlobBlockHash) -> DedupResult<()> {
        self.fold(block_hash, false)
    }

    /// Fold in the last block and produce the identifier
    pub fn finalize(&mut self, block_hash: &BlobBlockHash) -> DedupResult<BlobIdentifier> {
        self.fold(block_hash, true)?;
        BlobIdentifier::from_algorithm_result(&self.rolling_id, ALGORITHM_ID)
    }

    /// Whether the final block has been folded in
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// A blob identifier together with the block digests it was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobIdentifierWithBlocks {
    /// Whole-content identifier
    pub blob_id: BlobIdentifier,
    /// Block digests in stream order
    pub block_hashes: Vec<BlobBlockHash>,
}

/// [`RollingBlobIdentifier`] that also records every block digest
#[derive(Debug, Clone, Default)]
pub struct RollingBlobIdentifierWithBlocks {
    rolling: RollingBlobIdentifier,
    block_hashes: Vec<BlobBlockHash>,
}

impl RollingBlobIdentifierWithBlocks {
    /// Fresh accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a non-final block
    pub fn update(&mut self, block_hash: BlobBlockHash) -> DedupResult<()> {
        self.rolling.update(&block_hash)?;
        self.block_hashes.push(block_hash);
        Ok(())
    }

    /// Fold in the last block
    pub fn finalize(&mut self, block_hash: BlobBlockHash) -> DedupResult<BlobIdentifierWithBlocks> {
        let blob_id = self.rolling.finalize(&block_hash)?;
        self.block_hashes.push(block_hash);
        Ok(BlobIdentifierWithBlocks {
            blob_id,
            block_hashes: std::mem::take(&mut self.block_hashes),
        })
    }
}

/// One block delivered to a [`VsoHasher::walk_blocks`] callback
#[derive(Debug)]
pub struct BlockEvent<'a> {
    /// Zero-based block index
    pub index: u64,
    /// Block content
    pub data: &'a [u8],
    /// Block digest
    pub hash: BlobBlockHash,
    /// True for the last block of the stream
    pub is_final: bool,
}

/// Computes VSO identifiers over streams.
///
/// Construct once and share; block buffers come from an internal pool.
pub struct VsoHasher {
    backend: Arc<dyn BlockHashBackend>,
    block_buffers: Arc<ByteArrayPool>,
    metrics: Option<Arc<DedupMetrics>>,
}

impl fmt::Debug for VsoHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VsoHasher")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl VsoHasher {
    /// Create a hasher over `backend`, keeping up to `block_buffers_to_keep`
    /// idle 2 MiB buffers
    pub fn new(backend: Arc<dyn BlockHashBackend>, block_buffers_to_keep: usize) -> Self {
        Self {
            backend,
            block_buffers: Pool::byte_arrays(BLOCK_SIZE, block_buffers_to_keep),
            metrics: None,
        }
    }

    /// Record hashing counters into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<DedupMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Name of the block digest backend in use
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Digest of a single block
    pub fn hash_block(&self, block: &[u8]) -> BlobBlockHash {
        let hash = self.backend.hash_block(block);
        if let Some(metrics) = &self.metrics {
            metrics.record_block_hashed(block.len() as u64);
        }
        hash
    }

    /// Identifier of everything `reader` yields
    pub fn compute_identifier<R: Read>(&self, reader: &mut R) -> DedupResult<BlobIdentifier> {
        Ok(self.walk_blocks(reader, None, |_| Ok(()))?.blob_id)
    }

    /// Identifier and block digests of everything `reader` yields
    pub fn compute_identifier_with_blocks<R: Read>(
        &self,
        reader: &mut R,
    ) -> DedupResult<BlobIdentifierWithBlocks> {
        self.walk_blocks(reader, None, |_| Ok(()))
    }

    /// Identifier of exactly `len` bytes of `reader`
    pub fn compute_identifier_with_len<R: Read>(
        &self,
        reader: &mut R,
        len: u64,
    ) -> DedupResult<BlobIdentifier> {
        Ok(self.walk_blocks(reader, Some(len), |_| Ok(()))?.blob_id)
    }

    /// Identifier of an in-memory buffer
    pub fn compute_identifier_of_bytes(&self, content: &[u8]) -> DedupResult<BlobIdentifier> {
        let mut reader = content;
        self.compute_identifier_with_len(&mut reader, content.len() as u64)
    }

    /// Hash `reader` block by block, handing each block to `on_block` in order.
    ///
    /// With `len = Some(n)` exactly `n` bytes are read and a shorter stream is
    /// `TruncatedStream`; with `None` the stream is read to its end. A blob of at
    /// most one block produces a single final event.
    #[instrument(skip(self, reader, on_block), fields(backend = self.backend.name(), declared_len = ?len))]
    pub fn walk_blocks<R, F>(
        &self,
        reader: &mut R,
        len: Option<u64>,
        mut on_block: F,
    ) -> DedupResult<BlobIdentifierWithBlocks>
    where
        R: Read,
        F: FnMut(BlockEvent<'_>) -> DedupResult<()>,
    {
        let mut rolling = RollingBlobIdentifierWithBlocks::new();
        let mut consumed = 0u64;
        let mut current = self.block_buffers.acquire();
        let mut current_len = fill_block(reader, current.as_mut_slice(), len, consumed)?;
        consumed += current_len as u64;
        let mut index = 0u64;

        loop {
            let more = match len {
                Some(total) => consumed < total,
                None => current_len == BLOCK_SIZE,
            };
            let mut next = None;
            if more {
                let mut buffer = self.block_buffers.acquire();
                let read = fill_block(reader, buffer.as_mut_slice(), len, consumed)?;
                if read > 0 {
                    consumed += read as u64;
                    next = Some((buffer, read));
                }
            }

            let data = &current.as_slice()[..current_len];
            let hash = self.hash_block(data);
            trace!(index, bytes = current_len, is_final = next.is_none(), "Hashed block");
            match next {
                Some((buffer, read)) => {
                    rolling.update(hash)?;
                    on_block(BlockEvent {
                        index,
                        data,
                        hash,
                        is_final: false,
                    })?;
                    current = buffer;
                    current_len = read;
                    index += 1;
                }
                None => {
                    let result = rolling.finalize(hash)?;
                    on_block(BlockEvent {
                        index,
                        data,
                        hash,
                        is_final: true,
                    })?;
                    debug!(blocks = index + 1, bytes = consumed, blob_id = %result.blob_id, "Computed blob identifier");
                    return Ok(result);
                }
            }
        }
    }

    /// Identifier of the empty stream
    pub fn of_nothing(&self) -> DedupResult<BlobIdentifier> {
        RollingBlobIdentifier::new().finalize(&self.hash_block(&[]))
    }
}

/// Rebuild a blob identifier from block digests already computed elsewhere
pub fn identifier_from_block_hashes<I>(block_hashes: I) -> DedupResult<BlobIdentifier>
where
    I: IntoIterator<Item = BlobBlockHash>,
{
    let mut rolling = RollingBlobIdentifier::new();
    let mut hashes = block_hashes.into_iter().peekable();
    while let Some(hash) = hashes.next() {
        if hashes.peek().is_none() {
            return rolling.finalize(&hash);
        }
        rolling.update(&hash)?;
    }
    Err(DedupError::EmptyBlockList)
}

/// Fill `buffer` with the next block. Returns the number of bytes read, which
/// is less than a full block only at the end of the stream.
fn fill_block<R: Read>(
    reader: &mut R,
    buffer: &mut [u8],
    len: Option<u64>,
    consumed: u64,
) -> DedupResult<usize> {
    let want = match len {
        Some(total) => (total - consumed).min(BLOCK_SIZE as u64) as usize,
        None => BLOCK_SIZE,
    };
    let target = &mut buffer[..want];
    let mut filled = 0;
    while filled < want {
        match reader.read(&mut target[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(total) = len {
        if filled < want {
            return Err(DedupError::TruncatedStream {
                expected: total,
                actual: consumed + filled as u64,
            });
        }
    }
    Ok(filled)
}
