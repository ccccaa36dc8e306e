//! Chunk compression with the Xpress LZ77 codec.
//!
//! Compression is opportunistic: [`ChunkCompressor::compress`] returns `None`
//! whenever the compressed form would not be strictly smaller than the chunk,
//! and the caller stores the chunk as is.

pub mod fast;
pub mod xpress;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{DedupError, DedupResult};
use crate::metrics::DedupMetrics;
use crate::pool::{ByteArrayPool, Pool};

pub use xpress::{EncoderWorkspace, MIN_COMPRESS_INPUT, WINDOW_SIZE};

/// Largest chunk the compressor accepts
pub const MAX_CHUNK_SIZE: usize = 128 * 1024;

/// Compressed chunk plus the length it expands to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChunk {
    /// Xpress stream
    pub data: Bytes,
    /// Length of the original chunk
    pub uncompressed_len: usize,
}

/// An Xpress codec implementation
pub trait CodecBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Compress `src` into `dst`; `BufferTooSmall` when it does not fit
    fn compress_into(
        &self,
        src: &[u8],
        dst: &mut [u8],
        workspace: &mut EncoderWorkspace,
    ) -> DedupResult<usize>;

    /// Decompress `src` into `dst`, returning the number of bytes written
    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> DedupResult<usize>;
}

/// Codec that bound-checks every read and write
#[derive(Debug, Default, Clone, Copy)]
pub struct SafeCodec;

impl CodecBackend for SafeCodec {
    fn name(&self) -> &'static str {
        "safe"
    }

    fn compress_into(
        &self,
        src: &[u8],
        dst: &mut [u8],
        workspace: &mut EncoderWorkspace,
    ) -> DedupResult<usize> {
        xpress::compress_into(src, dst, workspace)
    }

    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> DedupResult<usize> {
        xpress::decompress_checked(src, dst)
    }
}

/// Codec whose decoder copies in bulk while headroom allows
#[derive(Debug, Default, Clone, Copy)]
pub struct FastCodec;

impl CodecBackend for FastCodec {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn compress_into(
        &self,
        src: &[u8],
        dst: &mut [u8],
        workspace: &mut EncoderWorkspace,
    ) -> DedupResult<usize> {
        xpress::compress_into(src, dst, workspace)
    }

    fn decompress_into(&self, src: &[u8], dst: &mut [u8]) -> DedupResult<usize> {
        fast::decompress_fast(src, dst)
    }
}

/// Codec choice in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionBackend {
    /// Probe at startup and prefer the fast decoder
    #[default]
    Auto,
    /// Always bound-check per item
    Safe,
    /// Bulk-copy decoder
    Fast,
}

fn probe_sample() -> Vec<u8> {
    let mut sample = Vec::with_capacity(24 * 1024);
    let mut state: u32 = 0x2545_f491;
    while sample.len() < 24 * 1024 {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let word = state.to_le_bytes();
        // Mix short literals with repeats of varying length and distance
        sample.extend_from_slice(&word[..2]);
        let back = (state as usize % 4096).min(sample.len());
        let take = 3 + (state >> 20) as usize % 40;
        let from = sample.len() - back;
        for i in 0..take.min(back) {
            let byte = sample[from + i];
            sample.push(byte);
        }
    }
    sample
}

/// Build the configured codec. `Auto` picks the fast decoder only if it
/// reproduces the safe decoder's output on a probe sample.
pub fn select_codec(choice: CompressionBackend) -> Arc<dyn CodecBackend> {
    match choice {
        CompressionBackend::Safe => Arc::new(SafeCodec),
        CompressionBackend::Fast => Arc::new(FastCodec),
        CompressionBackend::Auto => {
            let sample = probe_sample();
            let mut compressed = vec![0u8; sample.len()];
            let mut workspace = EncoderWorkspace::new();
            let agreed = SafeCodec
                .compress_into(&sample, &mut compressed, &mut workspace)
                .and_then(|len| {
                    let mut safe = vec![0u8; sample.len()];
                    let mut fast = vec![0u8; sample.len()];
                    let a = SafeCodec.decompress_into(&compressed[..len], &mut safe)?;
                    let b = FastCodec.decompress_into(&compressed[..len], &mut fast)?;
                    Ok(a == b && safe == fast && safe == sample)
                })
                .unwrap_or(false);
            if agreed {
                debug!("Using fast xpress decoder");
                Arc::new(FastCodec)
            } else {
                warn!("Fast xpress decoder failed its probe, using safe decoder");
                Arc::new(SafeCodec)
            }
        }
    }
}

/// Compresses and decompresses chunks with pooled scratch space
pub struct ChunkCompressor {
    codec: Arc<dyn CodecBackend>,
    workspaces: Arc<Pool<EncoderWorkspace>>,
    scratch: Arc<ByteArrayPool>,
    metrics: Option<Arc<DedupMetrics>>,
}

impl fmt::Debug for ChunkCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCompressor")
            .field("codec", &self.codec.name())
            .finish_non_exhaustive()
    }
}

impl ChunkCompressor {
    /// Create a compressor keeping up to `workspaces_to_keep` idle encoder
    /// workspaces and scratch buffers
    pub fn new(codec: Arc<dyn CodecBackend>, workspaces_to_keep: usize) -> Self {
        Self {
            codec,
            workspaces: Pool::new(
                EncoderWorkspace::new,
                EncoderWorkspace::reset,
                workspaces_to_keep,
            ),
            scratch: Pool::byte_arrays(MAX_CHUNK_SIZE, workspaces_to_keep),
            metrics: None,
        }
    }

    /// Record compression counters into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<DedupMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Name of the codec in use
    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    fn stored_uncompressed(&self) -> DedupResult<Option<CompressedChunk>> {
        if let Some(metrics) = &self.metrics {
            metrics.record_stored_uncompressed();
        }
        Ok(None)
    }

    /// Compress a chunk. `None` means "keep the original bytes".
    #[instrument(skip(self, chunk), fields(len = chunk.len(), codec = self.codec.name()))]
    pub fn compress(&self, chunk: &[u8]) -> DedupResult<Option<CompressedChunk>> {
        if chunk.len() > MAX_CHUNK_SIZE {
            debug!(len = chunk.len(), max = MAX_CHUNK_SIZE, "Chunk exceeds max chunk size, storing uncompressed");
            return self.stored_uncompressed();
        }
        if chunk.len() < MIN_COMPRESS_INPUT {
            return self.stored_uncompressed();
        }

        let mut workspace = self.workspaces.acquire();
        let mut scratch = self.scratch.acquire();
        // One byte short of the input: a fit means a strict saving
        let limit = chunk.len() - 1;
        match self
            .codec
            .compress_into(chunk, &mut scratch.as_mut_slice()[..limit], &mut workspace)
        {
            Ok(size) => {
                let data = Bytes::copy_from_slice(&scratch.as_slice()[..size]);
                if let Some(metrics) = &self.metrics {
                    metrics.record_compressed(chunk.len() as u64, size as u64);
                }
                debug!(compressed = size, "Compressed chunk");
                Ok(Some(CompressedChunk {
                    data,
                    uncompressed_len: chunk.len(),
                }))
            }
            Err(DedupError::BufferTooSmall) => self.stored_uncompressed(),
            Err(e) => Err(e),
        }
    }

    /// Expand a compressed chunk back to its original bytes
    #[instrument(skip(self, chunk), fields(len = chunk.data.len(), uncompressed_len = chunk.uncompressed_len))]
    pub fn decompress(&self, chunk: &CompressedChunk) -> DedupResult<Bytes> {
        let result = self.decompress_checked_len(chunk);
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(_) => metrics.record_decompressed(),
                Err(_) => metrics.record_corrupt_stream(),
            }
        }
        result
    }

    fn decompress_checked_len(&self, chunk: &CompressedChunk) -> DedupResult<Bytes> {
        if chunk.uncompressed_len > MAX_CHUNK_SIZE {
            return Err(DedupError::CorruptStream(format!(
                "declared length {} exceeds max chunk size",
                chunk.uncompressed_len
            )));
        }
        let mut out = vec![0u8; chunk.uncompressed_len];
        let produced = self.codec.decompress_into(&chunk.data, &mut out)?;
        if produced != chunk.uncompressed_len {
            return Err(DedupError::CorruptStream(format!(
                "expanded to {produced} bytes, expected {}",
                chunk.uncompressed_len
            )));
        }
        Ok(Bytes::from(out))
    }
}

/// A chunk held in whichever of its forms is at hand, converting lazily.
#[derive(Debug, Clone)]
pub struct DedupCompressedBuffer {
    uncompressed: Option<Bytes>,
    compressed: Option<CompressedChunk>,
    compression_attempted: bool,
    uncompressed_len: usize,
}

impl DedupCompressedBuffer {
    /// Wrap raw chunk bytes
    pub fn from_uncompressed(data: Bytes) -> Self {
        Self {
            uncompressed_len: data.len(),
            uncompressed: Some(data),
            compressed: None,
            compression_attempted: false,
        }
    }

    /// Wrap a compressed chunk received from storage
    pub fn from_compressed(chunk: CompressedChunk) -> Self {
        Self {
            uncompressed_len: chunk.uncompressed_len,
            uncompressed: None,
            compressed: Some(chunk),
            compression_attempted: true,
        }
    }

    /// Length of the raw chunk
    pub fn uncompressed_len(&self) -> usize {
        self.uncompressed_len
    }

    /// Raw bytes, decompressing on first use
    pub fn uncompressed(&mut self, compressor: &ChunkCompressor) -> DedupResult<Bytes> {
        if let Some(data) = &self.uncompressed {
            return Ok(data.clone());
        }
        match &self.compressed {
            Some(chunk) => {
                let data = compressor.decompress(chunk)?;
                self.uncompressed = Some(data.clone());
                Ok(data)
            }
            None => Err(DedupError::InvalidArgument(
                "compressed buffer holds no data".into(),
            )),
        }
    }

    /// Bytes to put on the wire: `(true, compressed)` when compression pays
    /// off, otherwise `(false, raw)`. Compression is attempted at most once.
    pub fn bytes_try_compress(&mut self, compressor: &ChunkCompressor) -> DedupResult<(bool, Bytes)> {
        if let Some(chunk) = &self.compressed {
            return Ok((true, chunk.data.clone()));
        }
        let raw = self.uncompressed(compressor)?;
        if !self.compression_attempted {
            self.compression_attempted = true;
            if let Some(chunk) = compressor.compress(&raw)? {
                let data = chunk.data.clone();
                self.compressed = Some(chunk);
                return Ok((true, data));
            }
        }
        Ok((false, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn compressor(codec: CompressionBackend) -> ChunkCompressor {
        ChunkCompressor::new(select_codec(codec), 2)
    }

    fn random(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(len as u64).fill_bytes(&mut data);
        data
    }

    #[test]
    fn auto_selects_fast_codec() {
        assert_eq!(select_codec(CompressionBackend::Auto).name(), "fast");
        assert_eq!(select_codec(CompressionBackend::Safe).name(), "safe");
    }

    #[test]
    fn probe_sample_roundtrips_with_both_codecs() {
        let sample = probe_sample();
        for codec in [CompressionBackend::Safe, CompressionBackend::Fast] {
            let c = compressor(codec);
            let compressed = c.compress(&sample[..MAX_CHUNK_SIZE.min(sample.len())]).unwrap().unwrap();
            assert!(compressed.data.len() < sample.len());
            assert_eq!(c.decompress(&compressed).unwrap(), sample);
        }
    }

    #[test]
    fn codecs_accept_a_workspace_reused_without_reset() {
        for codec in [&SafeCodec as &dyn CodecBackend, &FastCodec] {
            let mut workspace = EncoderWorkspace::new();
            let long = vec![b'a'; 10_000];
            let short = vec![b'a'; 100];
            let mut dst = vec![0u8; long.len()];
            codec.compress_into(&long, &mut dst, &mut workspace).unwrap();
            let len = codec.compress_into(&short, &mut dst, &mut workspace).unwrap();
            let mut out = vec![0u8; short.len()];
            assert_eq!(codec.decompress_into(&dst[..len], &mut out).unwrap(), short.len());
            assert_eq!(out, short);
        }
    }

    #[test]
    fn tiny_and_oversized_chunks_stay_raw() {
        let c = compressor(CompressionBackend::Safe);
        assert!(c.compress(&[0u8; 15]).unwrap().is_none());
        assert!(c.compress(&vec![0u8; MAX_CHUNK_SIZE + 1]).unwrap().is_none());
        assert!(c.compress(&vec![0u8; MAX_CHUNK_SIZE]).unwrap().is_some());
    }

    #[test]
    fn incompressible_chunks_return_none() {
        let c = compressor(CompressionBackend::Auto);
        assert!(c.compress(&random(64 * 1024)).unwrap().is_none());
    }

    #[test]
    fn wrong_declared_length_is_corrupt() {
        let c = compressor(CompressionBackend::Auto);
        let data = vec![3u8; 5000];
        let mut chunk = c.compress(&data).unwrap().unwrap();
        chunk.uncompressed_len -= 1;
        assert!(matches!(c.decompress(&chunk), Err(DedupError::CorruptStream(_))));
        chunk.uncompressed_len += 2;
        assert!(matches!(c.decompress(&chunk), Err(DedupError::CorruptStream(_))));
        chunk.uncompressed_len = MAX_CHUNK_SIZE + 1;
        assert!(matches!(c.decompress(&chunk), Err(DedupError::CorruptStream(_))));
    }

    #[test]
    fn metrics_track_outcomes() {
        let metrics = Arc::new(DedupMetrics::new());
        let c = compressor(CompressionBackend::Safe).with_metrics(Arc::clone(&metrics));
        let chunk = c.compress(&vec![1u8; 10_000]).unwrap().unwrap();
        c.compress(&random(1000)).unwrap();
        c.decompress(&chunk).unwrap();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_compressed, 1);
        assert_eq!(snapshot.chunks_stored_uncompressed, 1);
        assert_eq!(snapshot.chunks_decompressed, 1);
        assert_eq!(
            snapshot.compression_bytes_saved,
            10_000 - chunk.data.len() as u64
        );
    }

    #[test]
    fn compressed_buffer_converts_lazily() {
        let c = compressor(CompressionBackend::Auto);
        let raw = Bytes::from(vec![9u8; 4000]);
        let mut buffer = DedupCompressedBuffer::from_uncompressed(raw.clone());
        let (compressed, wire) = buffer.bytes_try_compress(&c).unwrap();
        assert!(compressed);
        assert!(wire.len() < raw.len());

        let mut received = DedupCompressedBuffer::from_compressed(CompressedChunk {
            data: wire,
            uncompressed_len: raw.len(),
        });
        assert_eq!(received.uncompressed_len(), 4000);
        assert_eq!(received.uncompressed(&c).unwrap(), raw);
    }

    #[test]
    fn compressed_buffer_keeps_incompressible_data_raw() {
        let c = compressor(CompressionBackend::Auto);
        let raw = Bytes::from(random(2000));
        let mut buffer = DedupCompressedBuffer::from_uncompressed(raw.clone());
        assert_eq!(buffer.bytes_try_compress(&c).unwrap(), (false, raw.clone()));
        assert_eq!(buffer.bytes_try_compress(&c).unwrap(), (false, raw));
    }
}
