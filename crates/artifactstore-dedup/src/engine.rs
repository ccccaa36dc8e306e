//! The dedup engine: one place that builds every pool, backend and shared
//! structure from a [`DedupConfig`] and hands them to callers by reference.

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::bloom::{BloomCheck, BloomFilter};
use crate::compression::{select_codec, ChunkCompressor, CompressedChunk};
use crate::config::DedupConfig;
use crate::dedup::{ChunkRecord, DedupHasher, DedupNode};
use crate::error::DedupResult;
use crate::identifier::{BlobIdentifier, DedupIdentifier};
use crate::metrics::DedupMetrics;
use crate::proof::{self, NodeSet, TargetSizes};
use crate::vso::{select_backend, VsoHasher};

/// Content identification, chunk compression, membership filtering and
/// proofs behind a single configured facade
pub struct DedupEngine {
    config: DedupConfig,
    metrics: Arc<DedupMetrics>,
    vso: VsoHasher,
    dedup: DedupHasher,
    compressor: ChunkCompressor,
    bloom: BloomFilter<DedupIdentifier>,
}

impl std::fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("hashing_backend", &self.vso.backend_name())
            .field("codec", &self.compressor.codec_name())
            .field("bloom", &self.bloom)
            .finish_non_exhaustive()
    }
}

impl DedupEngine {
    /// Validate `config`, then build pools and select backends
    pub fn new(config: DedupConfig) -> DedupResult<Self> {
        config.validate()?;
        let metrics = Arc::new(DedupMetrics::new());
        let vso = VsoHasher::new(
            select_backend(config.hashing.backend, config.pools.hashers_to_keep),
            config.pools.block_buffers_to_keep,
        )
        .with_metrics(Arc::clone(&metrics));
        let compressor = ChunkCompressor::new(
            select_codec(config.compression.backend),
            config.pools.workspaces_to_keep,
        )
        .with_metrics(Arc::clone(&metrics));
        let dedup = DedupHasher::new(config.chunker.clone())?;
        let bloom = BloomFilter::new(config.bloom.bit_count)?;
        info!(
            hashing_backend = vso.backend_name(),
            codec = compressor.codec_name(),
            bloom_bits = bloom.bit_count(),
            "Dedup engine ready"
        );
        Ok(Self {
            config,
            metrics,
            vso,
            dedup,
            compressor,
            bloom,
        })
    }

    /// Configuration the engine was built from
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Shared counters
    pub fn metrics(&self) -> &Arc<DedupMetrics> {
        &self.metrics
    }

    /// Whole-content hasher
    pub fn vso_hasher(&self) -> &VsoHasher {
        &self.vso
    }

    /// Chunker and tree builder
    pub fn dedup_hasher(&self) -> &DedupHasher {
        &self.dedup
    }

    /// Chunk compressor
    pub fn compressor(&self) -> &ChunkCompressor {
        &self.compressor
    }

    /// VSO identifier of everything `reader` yields
    pub fn compute_identifier<R: Read>(&self, reader: &mut R) -> DedupResult<BlobIdentifier> {
        self.vso.compute_identifier(reader)
    }

    /// Root identifier of the chunk tree over `reader`
    pub fn compute_dedup_identifier<R: Read>(&self, reader: R) -> DedupResult<DedupIdentifier> {
        self.dedup.compute_identifier(reader)
    }

    /// Root node of the chunk tree over `reader`
    pub fn compute_dedup_node<R: Read>(&self, reader: R) -> DedupResult<DedupNode> {
        self.dedup.compute_node(reader)
    }

    /// Content-defined chunks of `data`
    pub fn chunk(&self, data: &[u8]) -> Vec<ChunkRecord> {
        self.dedup.chunk(data)
    }

    /// Compress a chunk; `None` means store it as is
    pub fn compress(&self, chunk: &[u8]) -> DedupResult<Option<CompressedChunk>> {
        if !self.config.compression.enabled {
            self.metrics.record_stored_uncompressed();
            return Ok(None);
        }
        self.compressor.compress(chunk)
    }

    /// Expand a compressed chunk
    pub fn decompress(&self, chunk: &CompressedChunk) -> DedupResult<Bytes> {
        self.compressor.decompress(chunk)
    }

    /// Record `id` in the membership filter; true if a bit was newly set
    pub fn bloom_insert(&self, id: &DedupIdentifier) -> bool {
        self.metrics.record_bloom_insert();
        self.bloom.insert(id)
    }

    /// Membership check; never a false negative
    pub fn bloom_check(&self, id: &DedupIdentifier) -> BloomCheck {
        let result = self.bloom.check(id);
        self.metrics
            .record_bloom_check(result == BloomCheck::MaybeInserted);
        result
    }

    /// Membership filter
    pub fn bloom(&self) -> &BloomFilter<DedupIdentifier> {
        &self.bloom
    }

    /// Proof set for `targets` drawn from `all_nodes`
    #[instrument(skip_all, fields(nodes = all_nodes.len(), targets = targets.len()))]
    pub fn build_proof(&self, all_nodes: &NodeSet, targets: &TargetSizes) -> DedupResult<NodeSet> {
        let proof = proof::build_proof(all_nodes, targets)?;
        self.metrics.record_proof_built();
        debug!(proof_nodes = proof.len(), "Proof built");
        Ok(proof)
    }

    /// Check a received proof against the trusted `roots`
    #[instrument(skip_all, fields(proof_nodes = proof.len(), targets = targets.len()))]
    pub fn verify_proof(
        &self,
        proof: &NodeSet,
        roots: &[DedupIdentifier],
        targets: &TargetSizes,
    ) -> DedupResult<()> {
        let report = proof::check_proof(proof, roots, targets);
        self.metrics
            .record_proof_verified(report.unvalidated.len() as u64);
        if !report.is_valid() {
            debug!(unvalidated = report.unvalidated.len(), "Proof left targets unvalidated");
        }
        report.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionBackend;
    use crate::config::{BloomConfig, CompressionConfig};
    use crate::error::DedupError;
    use crate::identifier::ChunkDedupIdentifier;
    use crate::vso::OF_NOTHING_HEX;

    fn engine() -> DedupEngine {
        DedupEngine::new(DedupConfig {
            bloom: BloomConfig { bit_count: 1 << 16 },
            ..DedupConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn empty_stream_identifiers() {
        let engine = engine();
        let id = engine.compute_identifier(&mut &[][..]).unwrap();
        assert_eq!(id.to_hex(), OF_NOTHING_HEX);
        let dedup = engine.compute_dedup_identifier(&[][..]).unwrap();
        assert_eq!(dedup, ChunkDedupIdentifier::calculate(&[]).into());
        assert_eq!(engine.metrics().snapshot().blocks_hashed, 1);
    }

    #[test]
    fn compress_round_trip_updates_metrics() {
        let engine = engine();
        let chunk = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabc".repeat(50);
        let compressed = engine.compress(&chunk).unwrap().unwrap();
        assert!(compressed.data.len() < chunk.len());
        assert_eq!(engine.decompress(&compressed).unwrap(), chunk);
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.chunks_compressed, 1);
        assert_eq!(snapshot.chunks_decompressed, 1);
        assert!(snapshot.compression_bytes_saved > 0);
    }

    #[test]
    fn disabled_compression_stores_raw() {
        let engine = DedupEngine::new(DedupConfig {
            compression: CompressionConfig {
                enabled: false,
                backend: CompressionBackend::Safe,
            },
            ..DedupConfig::default()
        })
        .unwrap();
        assert!(engine.compress(&[7u8; 4096]).unwrap().is_none());
        assert_eq!(engine.metrics().snapshot().chunks_stored_uncompressed, 1);
    }

    #[test]
    fn bloom_has_no_false_negatives() {
        let engine = engine();
        let ids: Vec<DedupIdentifier> = (0..200u32)
            .map(|i| ChunkDedupIdentifier::calculate(&i.to_le_bytes()).into())
            .collect();
        for id in &ids {
            engine.bloom_insert(id);
        }
        for id in &ids {
            assert_eq!(engine.bloom_check(id), BloomCheck::MaybeInserted);
        }
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.bloom_inserts, 200);
        assert_eq!(snapshot.bloom_maybe_hits, 200);
    }

    #[test]
    fn proofs_through_the_engine() {
        let engine = engine();
        let leaves: Vec<_> = (0..6u8).map(|i| DedupNode::chunk_of(&[i; 40])).collect();
        let left = DedupNode::inner(leaves[..3].to_vec()).unwrap();
        let right = DedupNode::inner(leaves[3..].to_vec()).unwrap();
        let root = DedupNode::inner(vec![left, right]).unwrap();
        let nodes = proof::collect_node_set(&root).unwrap();
        let targets: TargetSizes = leaves
            .iter()
            .map(|l| (l.dedup_id(), l.transitive_content_bytes()))
            .collect();
        let built = engine.build_proof(&nodes, &targets).unwrap();
        engine.verify_proof(&built, &[root.dedup_id()], &targets).unwrap();

        let mut forged = targets.clone();
        forged.insert(leaves[0].dedup_id(), 41);
        let err = engine
            .verify_proof(&built, &[root.dedup_id()], &forged)
            .unwrap_err();
        assert!(matches!(err, DedupError::SizeMismatch { .. }));
        assert!(err.is_corruption());
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.proofs_built, 1);
        assert_eq!(snapshot.proofs_verified, 2);
        assert_eq!(snapshot.unvalidated_ids, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = DedupEngine::new(DedupConfig {
            bloom: BloomConfig { bit_count: 0 },
            ..DedupConfig::default()
        });
        assert!(matches!(result, Err(DedupError::Config(_))));
    }
}
