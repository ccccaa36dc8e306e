//! Lock-free Bloom filter over identifiers.
//!
//! One hash function (`k = 1`): an element's [`LongHash`] modulo the bit count
//! selects a single bit. Bits only ever go from 0 to 1, each set with a
//! compare-exchange on its containing word, so concurrent inserts and checks
//! need no lock and never produce a false negative.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};
use crate::identifier::LongHash;

/// Outcome of a membership check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomCheck {
    /// The element may have been inserted
    MaybeInserted,
    /// The element was certainly never inserted
    DefinitelyNotInserted,
}

/// Fixed-size, insert-only Bloom filter
pub struct BloomFilter<T> {
    words: Box<[AtomicU64]>,
    bit_count: u64,
    bits_set: AtomicU64,
    _element: PhantomData<fn(&T)>,
}

impl<T: LongHash> BloomFilter<T> {
    /// Create a filter of `bit_count` bits
    pub fn new(bit_count: u64) -> DedupResult<Self> {
        if bit_count == 0 {
            return Err(DedupError::Config(
                "bloom filter bit count must be greater than zero".into(),
            ));
        }
        let word_count = usize::try_from(bit_count.div_ceil(64)).map_err(|_| {
            DedupError::Config(format!("bloom filter of {bit_count} bits does not fit in memory"))
        })?;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            words,
            bit_count,
            bits_set: AtomicU64::new(0),
            _element: PhantomData,
        })
    }

    fn locate(&self, item: &T) -> (&AtomicU64, u64) {
        let bit = item.long_hash() % self.bit_count;
        (&self.words[(bit / 64) as usize], 1u64 << (bit % 64))
    }

    /// Set the element's bit. Returns true if this call flipped it from 0 to 1.
    pub fn insert(&self, item: &T) -> bool {
        let (word, mask) = self.locate(item);
        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.bits_set.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Check membership
    pub fn check(&self, item: &T) -> BloomCheck {
        let (word, mask) = self.locate(item);
        if word.load(Ordering::Acquire) & mask != 0 {
            BloomCheck::MaybeInserted
        } else {
            BloomCheck::DefinitelyNotInserted
        }
    }

    /// Size of the bit array
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Approximate number of set bits
    pub fn bits_set(&self) -> u64 {
        self.bits_set.load(Ordering::Relaxed)
    }

    /// False-positive probability for a fresh element given the current fill
    pub fn estimated_false_positive_rate(&self) -> f64 {
        self.bits_set() as f64 / self.bit_count as f64
    }
}

impl<T> std::fmt::Debug for BloomFilter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bit_count", &self.bit_count)
            .field("bits_set", &self.bits_set.load(Ordering::Relaxed))
            .finish()
    }
}
