//! Property-based tests for artifactstore-dedup using proptest.
//!
//! Identifier text round-trips, block hashing backend equivalence and the
//! compression contract: accepted output is strictly smaller and expands back
//! to the input.

mod common;

use std::sync::Arc;

use artifactstore_dedup::{
    compression::{
        select_codec, ChunkCompressor, CompressionBackend, MAX_CHUNK_SIZE, MIN_COMPRESS_INPUT,
    },
    identifier::{AlgorithmId, BlobIdentifier, DedupIdentifier},
    vso::{ParallelBlockHasher, PortableBlockHasher, VsoHasher, PAGE_SIZE},
    BloomCheck, BloomFilter,
};
use proptest::prelude::*;

fn portable() -> VsoHasher {
    VsoHasher::new(Arc::new(PortableBlockHasher::new(2)), 2)
}

fn parallel() -> VsoHasher {
    VsoHasher::new(Arc::new(ParallelBlockHasher), 2)
}

/// Digests of at least 3 bytes with an even length
fn any_digest() -> impl Strategy<Value = Vec<u8>> {
    (2usize..40).prop_flat_map(|half| proptest::collection::vec(any::<u8>(), half * 2))
}

/// Chunks with enough repetition that some of them compress
fn any_chunk() -> impl Strategy<Value = Vec<u8>> {
    (
        proptest::collection::vec(any::<u8>(), 1..48),
        1usize..2000,
        proptest::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(seed, repeats, noise)| {
            let mut chunk: Vec<u8> = seed.iter().copied().cycle().take(seed.len() * repeats).collect();
            chunk.extend_from_slice(&noise);
            chunk.truncate(MAX_CHUNK_SIZE);
            chunk
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// deserialize(to_hex(id)) == id for generic identifiers
    #[test]
    fn prop_blob_identifier_hex_round_trip(digest in any_digest(), algorithm in any::<u8>()) {
        let id = BlobIdentifier::from_algorithm_result(&digest, algorithm).unwrap();
        let hex = id.to_hex();
        prop_assert_eq!(BlobIdentifier::deserialize(&hex).unwrap(), id.clone());
        prop_assert_eq!(BlobIdentifier::deserialize(&hex.to_lowercase()).unwrap(), id);
    }

    /// Dedup identifiers keep their variant through text
    #[test]
    fn prop_dedup_identifier_hex_round_trip(hash in any::<[u8; 32]>(), node in any::<bool>()) {
        let algorithm = if node { AlgorithmId::Node } else { AlgorithmId::Chunk };
        let id = DedupIdentifier::create(&hash, algorithm.as_byte()).unwrap();
        let parsed = DedupIdentifier::deserialize(&id.to_hex()).unwrap();
        prop_assert_eq!(parsed, id);
        prop_assert_eq!(parsed.is_node(), node);
        let blob: BlobIdentifier = id.into();
        prop_assert_eq!(DedupIdentifier::try_from(&blob).unwrap(), id);
    }

    /// Both block hashing backends agree on block digests and blob identifiers
    #[test]
    fn prop_block_backends_agree(len in 0usize..(3 * PAGE_SIZE + 77), seed in any::<u64>()) {
        let data = common::random_bytes(len, seed);
        let a = portable();
        let b = parallel();
        prop_assert_eq!(a.hash_block(&data), b.hash_block(&data));
        prop_assert_eq!(
            a.compute_identifier_of_bytes(&data).unwrap(),
            b.compute_identifier_of_bytes(&data).unwrap()
        );
    }

    /// Accepted compression output is strictly smaller and round-trips
    #[test]
    fn prop_compression_round_trip(chunk in any_chunk(), fast in any::<bool>()) {
        let backend = if fast { CompressionBackend::Fast } else { CompressionBackend::Safe };
        let compressor = ChunkCompressor::new(select_codec(backend), 2);
        let result = compressor.compress(&chunk).unwrap();
        if chunk.len() < MIN_COMPRESS_INPUT {
            prop_assert!(result.is_none());
        }
        if let Some(compressed) = result {
            prop_assert!(compressed.data.len() < chunk.len());
            prop_assert_eq!(compressed.uncompressed_len, chunk.len());
            let decompressed = compressor.decompress(&compressed).unwrap();
            prop_assert_eq!(decompressed.as_ref(), chunk.as_slice());
        }
    }

    /// Streams compressed by one codec decode identically with the other
    #[test]
    fn prop_codecs_interoperate(chunk in any_chunk()) {
        let safe = ChunkCompressor::new(select_codec(CompressionBackend::Safe), 1);
        let fast = ChunkCompressor::new(select_codec(CompressionBackend::Fast), 1);
        if let Some(compressed) = safe.compress(&chunk).unwrap() {
            prop_assert_eq!(fast.decompress(&compressed).unwrap(), safe.decompress(&compressed).unwrap());
        }
    }

    /// Inserted elements always check as maybe-inserted
    #[test]
    fn prop_bloom_no_false_negatives(
        hashes in proptest::collection::vec(any::<[u8; 32]>(), 1..200),
        bits in 1u64..4096,
    ) {
        let bloom = BloomFilter::new(bits).unwrap();
        let ids: Vec<DedupIdentifier> = hashes
            .iter()
            .map(|h| DedupIdentifier::create(h, AlgorithmId::Chunk.as_byte()).unwrap())
            .collect();
        for id in &ids {
            bloom.insert(id);
        }
        for id in &ids {
            prop_assert_eq!(bloom.check(id), BloomCheck::MaybeInserted);
        }
        prop_assert!(bloom.bits_set() <= bloom.bit_count());
    }
}

#[test]
fn multi_block_backends_agree() {
    common::init_tracing();
    let data = common::random_bytes(2 * 2 * 1024 * 1024 + 12345, 99);
    let a = portable().compute_identifier_with_blocks(&mut data.as_slice()).unwrap();
    let b = parallel().compute_identifier_with_blocks(&mut data.as_slice()).unwrap();
    assert_eq!(a.block_hashes.len(), 3);
    assert_eq!(a.block_hashes, b.block_hashes);
    assert_eq!(a.blob_id, b.blob_id);
}
