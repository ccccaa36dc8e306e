//! Shared helpers for the integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Incompressible bytes from a seeded generator
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Word salad with some noise: chunkable and compressible
pub fn text_bytes(len: usize, seed: u64) -> Vec<u8> {
    const WORDS: [&[u8]; 10] = [
        b"artifact ", b"manifest ", b"chunk ", b"node ", b"upload ", b"download ",
        b"pipeline ", b"build ", b"release ", b"drop ",
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        out.extend_from_slice(WORDS[rng.gen_range(0..WORDS.len())]);
        if rng.gen_ratio(1, 8) {
            out.push(rng.gen());
        }
    }
    out.truncate(len);
    out
}
