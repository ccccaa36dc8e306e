//! Prometheus-compatible metrics for the dedup core.
//!
//! Lock-free `AtomicU64` counters shared by the hashers, the compressor, the
//! Bloom filter and the proof engine. Upload/download orchestration reads
//! compression savings from [`MetricsSnapshot::compression_bytes_saved`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// The type of metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A value that can go up or down.
    Gauge,
}

/// The value of a metric
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A counter value.
    Counter(u64),
    /// A gauge value.
    Gauge(f64),
}

/// A single metric with metadata and value
#[derive(Debug, Clone, PartialEq)]
pub struct DedupMetric {
    /// The metric name.
    pub name: String,
    /// Help text describing the metric.
    pub help: String,
    /// The kind of metric.
    pub kind: MetricKind,
    /// The metric value.
    pub value: MetricValue,
}

/// Thread-safe counters for every dedup operation
#[derive(Debug, Default)]
pub struct DedupMetrics {
    blocks_hashed: AtomicU64,
    bytes_hashed: AtomicU64,
    chunks_compressed: AtomicU64,
    chunks_stored_uncompressed: AtomicU64,
    compress_bytes_in: AtomicU64,
    compress_bytes_out: AtomicU64,
    chunks_decompressed: AtomicU64,
    corrupt_streams: AtomicU64,
    bloom_inserts: AtomicU64,
    bloom_checks: AtomicU64,
    bloom_maybe_hits: AtomicU64,
    proofs_built: AtomicU64,
    proofs_verified: AtomicU64,
    unvalidated_ids: AtomicU64,
}

impl DedupMetrics {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// A block digest was computed
    #[inline]
    pub fn record_block_hashed(&self, bytes: u64) {
        self.blocks_hashed.fetch_add(1, Ordering::Relaxed);
        self.bytes_hashed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A chunk compressed from `bytes_in` to `bytes_out`
    #[inline]
    pub fn record_compressed(&self, bytes_in: u64, bytes_out: u64) {
        self.chunks_compressed.fetch_add(1, Ordering::Relaxed);
        self.compress_bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.compress_bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// A chunk was left uncompressed
    #[inline]
    pub fn record_stored_uncompressed(&self) {
        self.chunks_stored_uncompressed.fetch_add(1, Ordering::Relaxed);
    }

    /// A chunk was decompressed
    #[inline]
    pub fn record_decompressed(&self) {
        self.chunks_decompressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Decompression rejected its input
    #[inline]
    pub fn record_corrupt_stream(&self) {
        self.corrupt_streams.fetch_add(1, Ordering::Relaxed);
    }

    /// Bloom filter insert
    #[inline]
    pub fn record_bloom_insert(&self) {
        self.bloom_inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Bloom filter check and whether it may be a hit
    #[inline]
    pub fn record_bloom_check(&self, maybe_inserted: bool) {
        self.bloom_checks.fetch_add(1, Ordering::Relaxed);
        if maybe_inserted {
            self.bloom_maybe_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A proof node set was built
    #[inline]
    pub fn record_proof_built(&self) {
        self.proofs_built.fetch_add(1, Ordering::Relaxed);
    }

    /// A proof was verified, leaving `unvalidated` targets unconfirmed
    #[inline]
    pub fn record_proof_verified(&self, unvalidated: u64) {
        self.proofs_verified.fetch_add(1, Ordering::Relaxed);
        self.unvalidated_ids.fetch_add(unvalidated, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let compress_bytes_in = self.compress_bytes_in.load(Ordering::Relaxed);
        let compress_bytes_out = self.compress_bytes_out.load(Ordering::Relaxed);
        MetricsSnapshot {
            blocks_hashed: self.blocks_hashed.load(Ordering::Relaxed),
            bytes_hashed: self.bytes_hashed.load(Ordering::Relaxed),
            chunks_compressed: self.chunks_compressed.load(Ordering::Relaxed),
            chunks_stored_uncompressed: self.chunks_stored_uncompressed.load(Ordering::Relaxed),
            compress_bytes_in,
            compress_bytes_out,
            compression_bytes_saved: compress_bytes_in.saturating_sub(compress_bytes_out),
            chunks_decompressed: self.chunks_decompressed.load(Ordering::Relaxed),
            corrupt_streams: self.corrupt_streams.load(Ordering::Relaxed),
            bloom_inserts: self.bloom_inserts.load(Ordering::Relaxed),
            bloom_checks: self.bloom_checks.load(Ordering::Relaxed),
            bloom_maybe_hits: self.bloom_maybe_hits.load(Ordering::Relaxed),
            proofs_built: self.proofs_built.load(Ordering::Relaxed),
            proofs_verified: self.proofs_verified.load(Ordering::Relaxed),
            unvalidated_ids: self.unvalidated_ids.load(Ordering::Relaxed),
        }
    }

    /// Collect all metrics with Prometheus names and help text
    pub fn collect(&self) -> Vec<DedupMetric> {
        let s = self.snapshot();
        let counter = |name: &str, help: &str, value: u64| DedupMetric {
            name: format!("artifactstore_dedup_{name}"),
            help: help.to_string(),
            kind: MetricKind::Counter,
            value: MetricValue::Counter(value),
        };
        vec![
            counter("blocks_hashed_total", "Total VSO blocks hashed", s.blocks_hashed),
            counter("bytes_hashed_total", "Total bytes fed to the block hasher", s.bytes_hashed),
            counter("chunks_compressed_total", "Chunks stored in compressed form", s.chunks_compressed),
            counter(
                "chunks_stored_uncompressed_total",
                "Chunks kept raw because compression did not pay off",
                s.chunks_stored_uncompressed,
            ),
            counter("compress_bytes_in_total", "Bytes fed to the compressor", s.compress_bytes_in),
            counter("compress_bytes_out_total", "Bytes produced by the compressor", s.compress_bytes_out),
            counter(
                "compression_bytes_saved_total",
                "Bytes saved by compression",
                s.compression_bytes_saved,
            ),
            counter("chunks_decompressed_total", "Chunks decompressed", s.chunks_decompressed),
            counter("corrupt_streams_total", "Compressed chunks rejected as corrupt", s.corrupt_streams),
            counter("bloom_inserts_total", "Bloom filter inserts", s.bloom_inserts),
            counter("bloom_checks_total", "Bloom filter membership checks", s.bloom_checks),
            counter(
                "bloom_maybe_hits_total",
                "Bloom filter checks answering maybe-inserted",
                s.bloom_maybe_hits,
            ),
            counter("proofs_built_total", "Proof node sets built", s.proofs_built),
            counter("proofs_verified_total", "Proofs verified", s.proofs_verified),
            counter(
                "unvalidated_ids_total",
                "Targets a proof failed to confirm",
                s.unvalidated_ids,
            ),
            DedupMetric {
                name: "artifactstore_dedup_compression_ratio".to_string(),
                help: "Compression ratio (bytes_in / bytes_out)".to_string(),
                kind: MetricKind::Gauge,
                value: MetricValue::Gauge(s.compression_ratio()),
            },
        ]
    }
}

/// A point-in-time snapshot of all dedup metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// VSO blocks hashed.
    pub blocks_hashed: u64,
    /// Bytes fed to the block hasher.
    pub bytes_hashed: u64,
    /// Chunks stored compressed.
    pub chunks_compressed: u64,
    /// Chunks kept raw.
    pub chunks_stored_uncompressed: u64,
    /// Bytes fed to the compressor for chunks that compressed.
    pub compress_bytes_in: u64,
    /// Compressed bytes produced.
    pub compress_bytes_out: u64,
    /// `compress_bytes_in - compress_bytes_out`.
    pub compression_bytes_saved: u64,
    /// Chunks decompressed.
    pub chunks_decompressed: u64,
    /// Compressed chunks rejected.
    pub corrupt_streams: u64,
    /// Bloom filter inserts.
    pub bloom_inserts: u64,
    /// Bloom filter checks.
    pub bloom_checks: u64,
    /// Checks answering maybe-inserted.
    pub bloom_maybe_hits: u64,
    /// Proofs built.
    pub proofs_built: u64,
    /// Proofs verified.
    pub proofs_verified: u64,
    /// Targets left unvalidated across all verifications.
    pub unvalidated_ids: u64,
}

impl MetricsSnapshot {
    /// Compression ratio, 1.0 before anything was compressed
    pub fn compression_ratio(&self) -> f64 {
        if self.compress_bytes_out == 0 {
            1.0
        } else {
            self.compress_bytes_in as f64 / self.compress_bytes_out as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let metrics = DedupMetrics::new();
        metrics.record_block_hashed(100);
        metrics.record_block_hashed(50);
        metrics.record_compressed(1000, 400);
        metrics.record_bloom_check(true);
        metrics.record_bloom_check(false);
        metrics.record_proof_verified(2);
        let s = metrics.snapshot();
        assert_eq!(s.blocks_hashed, 2);
        assert_eq!(s.bytes_hashed, 150);
        assert_eq!(s.compression_bytes_saved, 600);
        assert_eq!(s.bloom_checks, 2);
        assert_eq!(s.bloom_maybe_hits, 1);
        assert_eq!(s.unvalidated_ids, 2);
        assert!((s.compression_ratio() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn ratio_defaults_to_one() {
        assert_eq!(MetricsSnapshot::default().compression_ratio(), 1.0);
    }

    #[test]
    fn collect_uses_prometheus_names() {
        let metrics = DedupMetrics::new();
        metrics.record_bloom_insert();
        let collected = metrics.collect();
        assert!(collected
            .iter()
            .all(|m| m.name.starts_with("artifactstore_dedup_")));
        let inserts = collected
            .iter()
            .find(|m| m.name == "artifactstore_dedup_bloom_inserts_total")
            .unwrap();
        assert_eq!(inserts.value, MetricValue::Counter(1));
        assert_eq!(inserts.kind, MetricKind::Counter);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let metrics = Arc::new(DedupMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_bloom_insert();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot().bloom_inserts, 8000);
    }
}
