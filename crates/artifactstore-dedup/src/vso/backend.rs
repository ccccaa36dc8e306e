//! Block digest backends.
//!
//! A block digest is `SHA256(SHA256(page_0) ‖ SHA256(page_1) ‖ …)` over the
//! 64 KiB pages of the block. Both backends compute exactly that; the parallel
//! one hashes pages on the rayon pool.

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{BlobBlockHash, PAGE_SIZE};
use crate::pool::Pool;

/// Computes block digests
pub trait BlockHashBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs and metrics
    fn name(&self) -> &'static str;

    /// Digest of one block (at most `BLOCK_SIZE` bytes, possibly empty)
    fn hash_block(&self, block: &[u8]) -> BlobBlockHash;
}

/// Backend choice in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashingBackend {
    /// Probe at startup and prefer the parallel backend
    #[default]
    Auto,
    /// Sequential page hashing
    Portable,
    /// Pages hashed concurrently
    Parallel,
}

/// Sequential page hashing with pooled SHA-256 contexts
pub struct PortableBlockHasher {
    hashers: Arc<Pool<Sha256>>,
}

impl PortableBlockHasher {
    /// Create a backend that keeps up to `hashers_to_keep` idle contexts
    pub fn new(hashers_to_keep: usize) -> Self {
        Self {
            hashers: Pool::new(
                <Sha256 as Digest>::new,
                <Sha256 as Digest>::reset,
                hashers_to_keep,
            ),
        }
    }
}

impl fmt::Debug for PortableBlockHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortableBlockHasher").finish_non_exhaustive()
    }
}

impl BlockHashBackend for PortableBlockHasher {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn hash_block(&self, block: &[u8]) -> BlobBlockHash {
        let mut page_hasher = self.hashers.acquire();
        let mut block_hasher = self.hashers.acquire();
        for page in block.chunks(PAGE_SIZE) {
            page_hasher.update(page);
            block_hasher.update(page_hasher.finalize_reset());
        }
        BlobBlockHash(block_hasher.finalize_reset().into())
    }
}

/// Page hashing fanned out over the rayon thread pool
#[derive(Debug, Default)]
pub struct ParallelBlockHasher;

impl BlockHashBackend for ParallelBlockHasher {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn hash_block(&self, block: &[u8]) -> BlobBlockHash {
        let page_hashes: Vec<[u8; 32]> = block
            .par_chunks(PAGE_SIZE)
            .map(|page| Sha256::digest(page).into())
            .collect();
        let mut block_hasher = Sha256::new();
        for page_hash in &page_hashes {
            block_hasher.update(page_hash);
        }
        BlobBlockHash(block_hasher.finalize().into())
    }
}

fn probe_block() -> Vec<u8> {
    // Three full pages and a ragged tail
    (0..PAGE_SIZE * 3 + 17)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).to_le_bytes()[3])
        .collect()
}

/// Build the configured backend. `Auto` takes the parallel backend only if more
/// than one worker is available and it agrees with the portable backend on a
/// probe block.
pub fn select_backend(choice: HashingBackend, hashers_to_keep: usize) -> Arc<dyn BlockHashBackend> {
    let portable = PortableBlockHasher::new(hashers_to_keep);
    match choice {
        HashingBackend::Portable => Arc::new(portable),
        HashingBackend::Parallel => Arc::new(ParallelBlockHasher),
        HashingBackend::Auto => {
            let workers = rayon::current_num_threads();
            if workers < 2 {
                debug!(workers, "Single worker available, using portable block hasher");
                return Arc::new(portable);
            }
            let probe = probe_block();
            let parallel = ParallelBlockHasher;
            if parallel.hash_block(&probe) == portable.hash_block(&probe) {
                debug!(workers, "Using parallel block hasher");
                Arc::new(parallel)
            } else {
                warn!("Parallel block hasher disagrees with portable hasher, falling back");
                Arc::new(portable)
            }
        }
    }
}
