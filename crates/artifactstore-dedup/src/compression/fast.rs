//! Throughput-oriented decoder for the Xpress plain format.
//!
//! While at least one full worst-case tag block of input remains, a block is
//! decoded with bulk copies: runs of literal flags are found with
//! `leading_zeros` and copied in one slice copy, and matches are copied in
//! non-overlapping spans. Near the end of the input the decoder drops to the
//! checked per-item path, which also detects the end of the stream.

use super::xpress::{Decoder, Step, MAX_MATCH_ITEM_BYTES};
use crate::error::{DedupError, DedupResult};

const TAGS_PER_WORD: u32 = 32;

// Tag word plus 32 items of the largest encoding. The final block of a stream
// is never this long, so a block decoded here always holds 32 real items.
const FAST_INPUT_HEADROOM: usize = 4 + TAGS_PER_WORD as usize * MAX_MATCH_ITEM_BYTES;

impl Decoder<'_> {
    fn has_fast_headroom(&self) -> bool {
        self.src.len() - self.ip > FAST_INPUT_HEADROOM
    }

    fn copy_match_spans(&mut self, offset: usize, len: usize) -> DedupResult<()> {
        let start = self.check_match(offset, len)?;
        let mut copied = 0;
        while copied < len {
            let span = offset.min(len - copied);
            self.dst
                .copy_within(start + copied..start + copied + span, self.op + copied);
            copied += span;
        }
        self.op += len;
        Ok(())
    }

    fn block_fast(&mut self) -> DedupResult<()> {
        let tags = self.read_tags()?;
        let mut consumed = 0u32;
        while consumed < TAGS_PER_WORD {
            let run = (tags << consumed)
                .leading_zeros()
                .min(TAGS_PER_WORD - consumed);
            if run > 0 {
                let n = run as usize;
                let literals = self
                    .src
                    .get(self.ip..self.ip + n)
                    .ok_or_else(|| DedupError::CorruptStream("unexpected end of input".into()))?;
                let target = self.dst.get_mut(self.op..self.op + n).ok_or_else(|| {
                    DedupError::CorruptStream("literal past end of output".into())
                })?;
                target.copy_from_slice(literals);
                self.ip += n;
                self.op += n;
                consumed += run;
            } else {
                let (offset, len) = self.match_header()?;
                self.copy_match_spans(offset, len)?;
                consumed += 1;
            }
        }
        Ok(())
    }
}

/// Decompress using the fast path where headroom allows. Produces exactly the
/// output of [`super::xpress::decompress_checked`] and rejects the same inputs.
pub fn decompress_fast(src: &[u8], dst: &mut [u8]) -> DedupResult<usize> {
    let mut decoder = Decoder::new(src, dst);
    loop {
        if decoder.has_fast_headroom() {
            decoder.block_fast()?;
        } else if decoder.block_checked()? == Step::Done {
            return Ok(decoder.op);
        }
    }
}
