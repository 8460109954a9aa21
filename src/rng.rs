//! Random stream management.
//!
//! Each worker owns one statistically independent stream for the duration of
//! a top-level call. Stream seeds are derived from the master seed by
//! hashing, so a catalog build is reproducible for a fixed seed and worker
//! count regardless of thread scheduling.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::{RngCore, SeedableRng};
use rand_chacha::{ChaCha12Rng, ChaCha20Rng, ChaCha8Rng};

use crate::params::EngineKind;

/// Hands out per-worker random streams for one top-level call.
#[derive(Clone, Copy, Debug)]
pub struct StreamPool {
    master_seed: u64,
    engine: EngineKind,
}

impl StreamPool {
    pub fn new(master_seed: u64, engine: EngineKind) -> Self {
        Self { master_seed, engine }
    }

    /// The independent stream for worker `index`.
    pub fn stream(&self, index: usize) -> StreamRng {
        let seed = derive_seed(self.master_seed, index);
        match self.engine {
            EngineKind::ChaCha8 => StreamRng::ChaCha8(ChaCha8Rng::seed_from_u64(seed)),
            EngineKind::Diverse => match index % 3 {
                0 => StreamRng::ChaCha8(ChaCha8Rng::seed_from_u64(seed)),
                1 => StreamRng::ChaCha12(ChaCha12Rng::seed_from_u64(seed)),
                _ => StreamRng::ChaCha20(ChaCha20Rng::seed_from_u64(seed)),
            },
        }
    }
}

/// One worker's generator. Variants only differ in ChaCha round count.
pub enum StreamRng {
    ChaCha8(ChaCha8Rng),
    ChaCha12(ChaCha12Rng),
    ChaCha20(ChaCha20Rng),
}

impl RngCore for StreamRng {
    fn next_u32(&mut self) -> u32 {
        match self {
            StreamRng::ChaCha8(r) => r.next_u32(),
            StreamRng::ChaCha12(r) => r.next_u32(),
            StreamRng::ChaCha20(r) => r.next_u32(),
        }
    }

    fn next_u64(&mut self) -> u64 {
        match self {
            StreamRng::ChaCha8(r) => r.next_u64(),
            StreamRng::ChaCha12(r) => r.next_u64(),
            StreamRng::ChaCha20(r) => r.next_u64(),
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        match self {
            StreamRng::ChaCha8(r) => r.fill_bytes(dest),
            StreamRng::ChaCha12(r) => r.fill_bytes(dest),
            StreamRng::ChaCha20(r) => r.fill_bytes(dest),
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        match self {
            StreamRng::ChaCha8(r) => r.try_fill_bytes(dest),
            StreamRng::ChaCha12(r) => r.try_fill_bytes(dest),
            StreamRng::ChaCha20(r) => r.try_fill_bytes(dest),
        }
    }
}

/// Derive a per-stream seed from the master seed and the stream index.
fn derive_seed(master: u64, index: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    master.hash(&mut hasher);
    index.hash(&mut hasher);
    hasher.finish()
}
