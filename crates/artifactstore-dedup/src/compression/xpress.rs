//! Xpress LZ77 "plain" format: encoder and bounds-checked decoder.
//!
//! Stream layout:
//!
//! * a 32-bit little-endian tag word precedes every group of 32 items; its bits
//!   are read most-significant first, `0` for a literal and `1` for a match;
//! * a literal is one raw byte;
//! * a match is a 16-bit little-endian word `(offset - 1) << 3 | min(len - 3, 7)`.
//!   A small length of 7 continues in a 4-bit nibble (two matches share one
//!   nibble byte, low half first), a nibble of 15 continues in one byte, and a
//!   byte of 255 continues in a 16-bit length (or, when that is zero, a 32-bit
//!   one) holding `len - 3`;
//! * unused flags of the last tag word are set to 1, so the decoder stops at
//!   the first match flag that finds the input exhausted.

use crate::error::{DedupError, DedupResult};

/// Maximum match distance
pub const WINDOW_SIZE: usize = 8192;
/// Inputs shorter than this are never compressed
pub const MIN_COMPRESS_INPUT: usize = 16;
/// Smallest destination the encoder accepts
pub const MIN_DESTINATION: usize = 64;

const MIN_MATCH: usize = 3;
const SMALL_LEN_MAX: usize = 7;
const NIBBLE_MAX: usize = 15;
const BYTE_ESCAPE: usize = 255;
const TAGS_PER_WORD: u32 = 32;
const HASH_SIZE: usize = 1 << 15;
const CHAIN_SIZE: usize = 2 * WINDOW_SIZE;
const MAX_CHAIN: usize = 24;
// The last few bytes are always emitted as literals
const TAIL_LITERALS: usize = 5;

/// Worst-case input bytes consumed by one match item
pub(super) const MAX_MATCH_ITEM_BYTES: usize = 2 + 1 + 1 + 2 + 4;

const fn build_hash_tables() -> [[u16; 256]; 3] {
    let mut tables = [[0u16; 256]; 3];
    let mut val1: u32 = 0x1357_9bdf;
    let val2: u32 = 0x8765_4321;
    let mut k = 0;
    while k < 3 {
        let mut j = 0;
        while j < 256 {
            let mut val3 = val2;
            let mut val4 = val1;
            let mut diff: u32 = 0;
            let mut i = 0;
            while i < 32 {
                diff = diff.wrapping_add(0x9e37_79b9);
                val3 = val3.wrapping_add(diff);
                val4 = val4.wrapping_add(diff);
                val1 = val1.wrapping_add(
                    (val2 << 3).wrapping_add(val3)
                        ^ val2.wrapping_add(diff)
                        ^ (val2 >> 5).wrapping_add(val4),
                );
                val1 = val1.wrapping_add(
                    (val1 << 3).wrapping_add(val4)
                        ^ val1.wrapping_add(diff)
                        ^ (val1 >> 5).wrapping_add(val3),
                );
                i += 1;
            }
            val1 = val1.wrapping_add(val2);
            tables[k][j] = (val1 % HASH_SIZE as u32) as u16;
            j += 1;
        }
        k += 1;
    }
    tables
}

static HASH_TABLES: [[u16; 256]; 3] = build_hash_tables();

fn hash3(src: &[u8], pos: usize) -> usize {
    usize::from(
        HASH_TABLES[0][usize::from(src[pos])]
            ^ HASH_TABLES[1][usize::from(src[pos + 1])]
            ^ HASH_TABLES[2][usize::from(src[pos + 2])],
    )
}

/// Match-finder state: hash heads and a ring of previous positions.
///
/// Positions are stored plus one so that zero means "none". A workspace should
/// be [`reset`](Self::reset) before it is used on a new input; stale positions
/// are skipped or fail the byte comparison, so they only affect which matches
/// are found.
pub struct EncoderWorkspace {
    head: Vec<u32>,
    chain: Vec<u32>,
}

impl Default for EncoderWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderWorkspace {
    /// Zeroed workspace
    pub fn new() -> Self {
        Self {
            head: vec![0; HASH_SIZE],
            chain: vec![0; CHAIN_SIZE],
        }
    }

    /// Forget every recorded position
    pub fn reset(&mut self) {
        self.head.fill(0);
        self.chain.fill(0);
    }

    fn insert(&mut self, src: &[u8], pos: usize) {
        let slot = hash3(src, pos);
        self.chain[pos % CHAIN_SIZE] = self.head[slot];
        self.head[slot] = (pos + 1) as u32;
    }

    /// Longest earlier match for `pos`, as `(len, offset)`
    fn longest_match(&self, src: &[u8], pos: usize) -> (usize, usize) {
        let max_len = src.len() - pos;
        let mut best = (0, 0);
        let mut candidate = self.chain[pos % CHAIN_SIZE];
        let mut probes = 0;
        while candidate != 0 && probes < MAX_CHAIN {
            let earlier = (candidate - 1) as usize;
            // Left over from an earlier input
            if earlier >= pos {
                break;
            }
            let offset = pos - earlier;
            if offset > WINDOW_SIZE {
                break;
            }
            let len = src[earlier..]
                .iter()
                .zip(&src[pos..])
                .take(max_len)
                .take_while(|(a, b)| a == b)
                .count();
            if len > best.0 {
                best = (len, offset);
                if len == max_len {
                    break;
                }
            }
            candidate = self.chain[earlier % CHAIN_SIZE];
            probes += 1;
        }
        best
    }
}

struct TagWriter<'a> {
    dst: &'a mut [u8],
    out: usize,
    tag_pos: usize,
    tags: u32,
    tag_count: u32,
    nibble_pos: Option<usize>,
}

impl<'a> TagWriter<'a> {
    fn new(dst: &'a mut [u8]) -> DedupResult<Self> {
        let mut writer = Self {
            dst,
            out: 0,
            tag_pos: 0,
            tags: 0,
            tag_count: 0,
            nibble_pos: None,
        };
        writer.put(&[0; 4])?;
        Ok(writer)
    }

    fn put(&mut self, bytes: &[u8]) -> DedupResult<()> {
        let end = self.out + bytes.len();
        let target = self
            .dst
            .get_mut(self.out..end)
            .ok_or(DedupError::BufferTooSmall)?;
        target.copy_from_slice(bytes);
        self.out = end;
        Ok(())
    }

    fn push_flag(&mut self, is_match: bool) -> DedupResult<()> {
        self.tags = (self.tags << 1) | u32::from(is_match);
        self.tag_count += 1;
        if self.tag_count == TAGS_PER_WORD {
            self.dst[self.tag_pos..self.tag_pos + 4].copy_from_slice(&self.tags.to_le_bytes());
            self.tag_pos = self.out;
            self.tags = 0;
            self.tag_count = 0;
            self.put(&[0; 4])?;
        }
        Ok(())
    }

    fn literal(&mut self, byte: u8) -> DedupResult<()> {
        self.put(&[byte])?;
        self.push_flag(false)
    }

    fn matched(&mut self, offset: usize, len: usize) -> DedupResult<()> {
        let offset_bits = ((offset - 1) << 3) as u16;
        let mut extra = len - MIN_MATCH;
        if extra < SMALL_LEN_MAX {
            self.put(&(offset_bits | extra as u16).to_le_bytes())?;
            return self.push_flag(true);
        }
        self.put(&(offset_bits | SMALL_LEN_MAX as u16).to_le_bytes())?;
        extra -= SMALL_LEN_MAX;

        let nibble = extra.min(NIBBLE_MAX) as u8;
        match self.nibble_pos.take() {
            Some(pos) => self.dst[pos] |= nibble << 4,
            None => {
                self.nibble_pos = Some(self.out);
                self.put(&[nibble])?;
            }
        }

        if extra >= NIBBLE_MAX {
            extra -= NIBBLE_MAX;
            if extra < BYTE_ESCAPE {
                self.put(&[extra as u8])?;
            } else {
                self.put(&[BYTE_ESCAPE as u8])?;
                let full = len - MIN_MATCH;
                match u16::try_from(full) {
                    Ok(short) => self.put(&short.to_le_bytes())?,
                    Err(_) => {
                        self.put(&0u16.to_le_bytes())?;
                        self.put(&(full as u32).to_le_bytes())?;
                    }
                }
            }
        }
        self.push_flag(true)
    }

    fn finish(self) -> usize {
        let pad = TAGS_PER_WORD - self.tag_count;
        let word = if pad == TAGS_PER_WORD {
            u32::MAX
        } else {
            (self.tags << pad) | ((1u32 << pad) - 1)
        };
        self.dst[self.tag_pos..self.tag_pos + 4].copy_from_slice(&word.to_le_bytes());
        self.out
    }
}

/// Compress `src` into `dst`, returning the compressed length.
///
/// `BufferTooSmall` means the output did not fit (or the input is too short to
/// bother); the caller keeps the uncompressed form.
pub fn compress_into(
    src: &[u8],
    dst: &mut [u8],
    workspace: &mut EncoderWorkspace,
) -> DedupResult<usize> {
    if src.len() < MIN_COMPRESS_INPUT || dst.len() < MIN_DESTINATION {
        return Err(DedupError::BufferTooSmall);
    }
    if src.len() >= u32::MAX as usize {
        return Err(DedupError::InvalidArgument(format!(
            "{} byte input is too large to compress",
            src.len()
        )));
    }
    let mut writer = TagWriter::new(dst)?;
    let search_end = src.len() - TAIL_LITERALS;
    let mut pos = 0;
    let mut inserted = 0;
    while pos < search_end {
        while inserted <= pos {
            workspace.insert(src, inserted);
            inserted += 1;
        }
        let (len, offset) = workspace.longest_match(src, pos);
        if len >= MIN_MATCH {
            writer.matched(offset, len)?;
            pos += len;
        } else {
            writer.literal(src[pos])?;
            pos += 1;
        }
    }
    for &byte in &src[pos..] {
        writer.literal(byte)?;
    }
    Ok(writer.finish())
}

fn corrupt(what: &str) -> DedupError {
    DedupError::CorruptStream(what.to_string())
}

/// Outcome of decoding one tag block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Step {
    Continue,
    Done,
}

/// Decoder cursor shared by the checked and fast paths
pub(super) struct Decoder<'a> {
    pub(super) src: &'a [u8],
    pub(super) dst: &'a mut [u8],
    pub(super) ip: usize,
    pub(super) op: usize,
    nibble_pos: Option<usize>,
}

impl<'a> Decoder<'a> {
    pub(super) fn new(src: &'a [u8], dst: &'a mut [u8]) -> Self {
        Self {
            src,
            dst,
            ip: 0,
            op: 0,
            nibble_pos: None,
        }
    }

    fn read_u8(&mut self) -> DedupResult<u8> {
        let byte = *self
            .src
            .get(self.ip)
            .ok_or_else(|| corrupt("unexpected end of input"))?;
        self.ip += 1;
        Ok(byte)
    }

    fn read_array<const N: usize>(&mut self) -> DedupResult<[u8; N]> {
        let bytes = self
            .src
            .get(self.ip..self.ip + N)
            .ok_or_else(|| corrupt("unexpected end of input"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.ip += N;
        Ok(out)
    }

    pub(super) fn read_tags(&mut self) -> DedupResult<u32> {
        self.read_array::<4>()
            .map(u32::from_le_bytes)
            .map_err(|_| corrupt("missing tag word"))
    }

    /// Parse a match item into `(offset, len)`
    pub(super) fn match_header(&mut self) -> DedupResult<(usize, usize)> {
        let token = usize::from(u16::from_le_bytes(self.read_array::<2>()?));
        let offset = (token >> 3) + 1;
        let mut len = token & SMALL_LEN_MAX;
        if len == SMALL_LEN_MAX {
            len = match self.nibble_pos.take() {
                Some(pos) => usize::from(self.src[pos] >> 4),
                None => {
                    self.nibble_pos = Some(self.ip);
                    usize::from(self.read_u8()? & 0x0f)
                }
            };
            if len == NIBBLE_MAX {
                len = usize::from(self.read_u8()?);
                if len == BYTE_ESCAPE {
                    len = usize::from(u16::from_le_bytes(self.read_array::<2>()?));
                    if len == 0 {
                        len = u32::from_le_bytes(self.read_array::<4>()?) as usize;
                    }
                    if len < NIBBLE_MAX + SMALL_LEN_MAX {
                        return Err(corrupt("long match length below escape threshold"));
                    }
                    len -= NIBBLE_MAX + SMALL_LEN_MAX;
                }
                len += NIBBLE_MAX;
            }
            len += SMALL_LEN_MAX;
        }
        Ok((offset, len + MIN_MATCH))
    }

    /// Validate a match against the output written so far
    pub(super) fn check_match(&self, offset: usize, len: usize) -> DedupResult<usize> {
        if offset > self.op {
            return Err(corrupt("match reaches before start of output"));
        }
        if len > self.dst.len() - self.op {
            return Err(corrupt("match runs past end of output"));
        }
        Ok(self.op - offset)
    }

    fn copy_match_bytewise(&mut self, offset: usize, len: usize) -> DedupResult<()> {
        let start = self.check_match(offset, len)?;
        for i in 0..len {
            self.dst[self.op + i] = self.dst[start + i];
        }
        self.op += len;
        Ok(())
    }

    /// Handle a match flag: `Done` if the input ended cleanly here
    pub(super) fn at_match_flag(&self) -> Option<Step> {
        let remaining = self.src.len() - self.ip;
        if remaining == 0 || (remaining == 1 && self.op == self.dst.len()) {
            Some(Step::Done)
        } else {
            None
        }
    }

    /// Decode one tag word and its items with a check on every access
    pub(super) fn block_checked(&mut self) -> DedupResult<Step> {
        let tags = self.read_tags()?;
        for bit in (0..TAGS_PER_WORD).rev() {
            if (tags >> bit) & 1 == 0 {
                let byte = self.read_u8()?;
                let slot = self
                    .dst
                    .get_mut(self.op)
                    .ok_or_else(|| corrupt("literal past end of output"))?;
                *slot = byte;
                self.op += 1;
            } else {
                if let Some(step) = self.at_match_flag() {
                    return Ok(step);
                }
                let (offset, len) = self.match_header()?;
                self.copy_match_bytewise(offset, len)?;
            }
        }
        Ok(Step::Continue)
    }
}

/// Decompress with every read and write bounds-checked. Returns the number of
/// bytes written to `dst`.
pub fn decompress_checked(src: &[u8], dst: &mut [u8]) -> DedupResult<usize> {
    let mut decoder = Decoder::new(src, dst);
    while decoder.block_checked()? == Step::Continue {}
    Ok(decoder.op)
}
