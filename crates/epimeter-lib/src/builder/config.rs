//! Build configuration for the peptide index
//!
//! Forest parameters and the range of k-mer lengths to index.

use crate::constants::{DEFAULT_LEAF_SIZE, DEFAULT_MAX_K, DEFAULT_MIN_K, DEFAULT_N_TREES};
use crate::error::{EpimeterError, Result};

/// Configuration parameters for building shard forests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Number of trees per shard
    pub n_trees: usize,

    /// Maximum number of items in a leaf bucket
    pub leaf_size: usize,

    /// Seed for reference selection (`None` = fresh seed per build)
    pub seed: Option<u64>,

    /// Number of threads for building (0 = all available cores)
    pub num_threads: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            n_trees: DEFAULT_N_TREES,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed: None,
            num_threads: 0,
        }
    }
}

impl IndexConfig {
    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(EpimeterError::Config("n_trees must be at least 1".to_string()));
        }
        if self.leaf_size == 0 {
            return Err(EpimeterError::Config("leaf_size must be at least 1".to_string()));
        }
        if self.n_trees > u32::MAX as usize || self.leaf_size > u32::MAX as usize {
            return Err(EpimeterError::Config(format!(
                "n_trees ({}) and leaf_size ({}) must fit in 32 bits",
                self.n_trees, self.leaf_size
            )));
        }
        Ok(())
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Index Configuration:");
        tracing::info!("  n_trees = {}", self.n_trees);
        tracing::debug!("  leaf_size = {}", self.leaf_size);
        match self.seed {
            Some(seed) => tracing::info!("  seed = {}", seed),
            None => tracing::debug!("  seed = random"),
        }
        if self.num_threads == 0 {
            tracing::info!("  num_threads = all available cores");
        } else {
            tracing::info!("  num_threads = {}", self.num_threads);
        }
    }
}

/// Closed range of k-mer lengths to index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmerBounds {
    min_k: usize,
    max_k: usize,
}

impl KmerBounds {
    /// Create bounds `[min_k, max_k]`
    ///
    /// # Errors
    /// Returns `Config` if `min_k` is zero or greater than `max_k`
    pub fn new(min_k: usize, max_k: usize) -> Result<Self> {
        if min_k == 0 {
            return Err(EpimeterError::Config("min_k must be at least 1".to_string()));
        }
        if min_k > max_k {
            return Err(EpimeterError::Config(format!(
                "min_k must not exceed max_k, got min_k={}, max_k={}",
                min_k, max_k
            )));
        }
        Ok(Self { min_k, max_k })
    }

    /// Smallest indexed k
    pub fn min_k(&self) -> usize {
        self.min_k
    }

    /// Largest indexed k
    pub fn max_k(&self) -> usize {
        self.max_k
    }

    /// All k values in ascending order
    pub fn iter(&self) -> std::ops::RangeInclusive<usize> {
        self.min_k..=self.max_k
    }
}

impl Default for KmerBounds {
    fn default() -> Self {
        Self {
            min_k: DEFAULT_MIN_K,
            max_k: DEFAULT_MAX_K,
        }
    }
}
