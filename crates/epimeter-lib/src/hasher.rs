//! Deterministic seed derivation using ahash.
//!
//! Every tree of every shard draws from its own RNG. The RNG seed is derived
//! from the build seed, the shard's k and the tree index, so a seeded build
//! is reproducible no matter how rayon schedules the trees.
//!
//! Reproducibility holds for one build of the binary. ahash does not promise
//! a stable output across crate versions or target platforms, so the same
//! seed may give different trees after an `ahash` upgrade or on another
//! architecture. Saved shards are unaffected: they store their trees.

use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// A deterministic hasher with a seeded state
#[derive(Clone)]
pub struct SeedHasher {
    state: RandomState,
}

impl SeedHasher {
    /// Create a new hasher for the given build seed
    pub fn new(seed: u64) -> Self {
        let state = RandomState::with_seeds(seed, !seed, seed.rotate_left(32), !seed.rotate_left(32));
        Self { state }
    }

    /// RNG seed for tree `tree` of the shard holding `k`-mers
    #[inline]
    pub fn tree_seed(&self, k: usize, tree: usize) -> u64 {
        let mut hasher = self.state.build_hasher();
        hasher.write_u64(k as u64);
        hasher.write_u64(tree as u64);
        hasher.finish()
    }
}
