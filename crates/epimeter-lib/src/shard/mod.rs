//! Shard index - one approximate nearest-neighbor forest per k-mer length
//!
//! A shard collects fixed-length peptide vectors, builds a forest of
//! reference-point partition trees over them and answers approximate
//! top-n queries under the substitution metric.
//!
//! Lifecycle:
//! - `Open`: accepts [`ShardIndex::add`]
//! - `Built`: forest constructed, query-only
//! - `Persisted`: built and written to disk
//! - `Loaded`: read back from disk, query-only

pub(crate) mod tree;

use crate::error::{EpimeterError, Result};
use crate::hasher::SeedHasher;
use crate::substitution::SubstitutionMetric;
use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use tree::{collect_candidates, Items, Tree};

/// Lifecycle state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Accepting items
    Open,
    /// Forest built in memory
    Built,
    /// Forest built and written to storage
    Persisted,
    /// Read back from storage
    Loaded,
}

impl ShardState {
    /// Whether the forest is available for queries
    pub fn is_queryable(&self) -> bool {
        !matches!(self, ShardState::Open)
    }
}

/// Candidate budget for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchK {
    /// `num_neighbors * n_trees` candidates
    #[default]
    Auto,
    /// Visit every leaf of every tree (brute force)
    Exhaustive,
    /// Stop after collecting this many candidates
    Budget(usize),
}

impl SearchK {
    /// Candidate count at which traversal stops
    pub fn budget(&self, num_neighbors: usize, n_trees: usize) -> usize {
        match *self {
            SearchK::Auto => num_neighbors.saturating_mul(n_trees),
            SearchK::Exhaustive => usize::MAX,
            SearchK::Budget(n) => n,
        }
    }
}

impl FromStr for SearchK {
    type Err = EpimeterError;

    /// `auto` (or `-1`), `all` / `exhaustive`, or a candidate count
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "auto" | "-1" => Ok(SearchK::Auto),
            "all" | "exhaustive" => Ok(SearchK::Exhaustive),
            other => other
                .parse::<usize>()
                .map(SearchK::Budget)
                .map_err(|_| EpimeterError::Config(format!("invalid search_k {:?}", other))),
        }
    }
}

impl fmt::Display for SearchK {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchK::Auto => write!(f, "auto"),
            SearchK::Exhaustive => write!(f, "all"),
            SearchK::Budget(n) => write!(f, "{}", n),
        }
    }
}

/// One neighbor returned by a shard query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit<'a> {
    /// Caller-assigned item id
    pub item_id: u64,
    /// Distance from the query vector
    pub distance: f32,
    /// Stored vector of the item
    pub vector: &'a [u8],
}

/// ANN forest over the vectors of one k-mer length
#[derive(Debug)]
pub struct ShardIndex {
    k: usize,
    metric: Arc<SubstitutionMetric>,
    item_ids: Vec<u64>,
    /// Item vectors, `k` bytes per slot
    vectors: Vec<u8>,
    slots: AHashMap<u64, u32>,
    forest: Vec<Tree>,
    leaf_size: usize,
    state: ShardState,
}

impl ShardIndex {
    /// Create an empty, open shard for `k`-mers
    ///
    /// # Errors
    /// Returns `Config` for `k == 0` and `DimensionMismatch` if the metric's
    /// weight vector is shorter than `k`.
    pub fn new(k: usize, metric: Arc<SubstitutionMetric>) -> Result<Self> {
        if k == 0 {
            return Err(EpimeterError::Config("k-mer length must be at least 1".to_string()));
        }
        metric.check_len(k)?;
        Ok(Self {
            k,
            metric,
            item_ids: Vec::new(),
            vectors: Vec::new(),
            slots: AHashMap::new(),
            forest: Vec::new(),
            leaf_size: 0,
            state: ShardState::Open,
        })
    }

    /// Reassemble a shard read from storage
    pub(crate) fn from_parts(
        k: usize,
        metric: Arc<SubstitutionMetric>,
        item_ids: Vec<u64>,
        vectors: Vec<u8>,
        forest: Vec<Tree>,
        leaf_size: usize,
    ) -> Result<Self> {
        let mut shard = Self::new(k, metric)?;
        shard.slots.reserve(item_ids.len());
        for (slot, &item_id) in item_ids.iter().enumerate() {
            if shard.slots.insert(item_id, slot as u32).is_some() {
                return Err(EpimeterError::Corruption(format!(
                    "item id {} stored twice in shard k={}",
                    item_id, k
                )));
            }
        }
        shard.item_ids = item_ids;
        shard.vectors = vectors;
        shard.forest = forest;
        shard.leaf_size = leaf_size;
        shard.state = ShardState::Loaded;
        Ok(shard)
    }

    /// Add an encoded peptide
    ///
    /// # Errors
    /// - `Frozen` once the shard has been built or loaded
    /// - `DimensionMismatch` if `vector.len() != k`
    /// - `DuplicateItem` if `item_id` is already present
    pub fn add(&mut self, item_id: u64, vector: &[u8]) -> Result<()> {
        if self.state != ShardState::Open {
            return Err(EpimeterError::Frozen(format!(
                "shard k={} no longer accepts items",
                self.k
            )));
        }
        if vector.len() != self.k {
            return Err(EpimeterError::DimensionMismatch {
                expected: self.k,
                actual: vector.len(),
            });
        }
        if self.slots.contains_key(&item_id) {
            return Err(EpimeterError::DuplicateItem { k: self.k, item_id });
        }
        let slot = u32::try_from(self.item_ids.len()).map_err(|_| {
            EpimeterError::State(format!("shard k={} is full", self.k))
        })?;

        self.slots.insert(item_id, slot);
        self.item_ids.push(item_id);
        self.vectors.extend_from_slice(vector);
        Ok(())
    }

    /// Build `n_trees` trees and freeze the shard
    ///
    /// Trees are built in parallel on the current rayon pool. Tree `t` draws
    /// its references from an RNG seeded by `(seed, k, t)`.
    pub fn build(&mut self, n_trees: usize, leaf_size: usize, seed: u64) -> Result<()> {
        if self.state != ShardState::Open {
            return Err(EpimeterError::Frozen(format!(
                "shard k={} is already built",
                self.k
            )));
        }
        if self.item_ids.is_empty() {
            return Err(EpimeterError::EmptyShard(self.k));
        }
        if n_trees == 0 || leaf_size == 0 {
            return Err(EpimeterError::Config(format!(
                "n_trees ({}) and leaf_size ({}) must be at least 1",
                n_trees, leaf_size
            )));
        }

        info!(
            "Building shard k={}: {} items, {} trees",
            self.k,
            self.item_ids.len(),
            n_trees
        );
        let hasher = SeedHasher::new(seed);
        let items = self.items();
        let k = self.k;
        let forest: Vec<Tree> = (0..n_trees)
            .into_par_iter()
            .map(|t| Tree::build(items, leaf_size, hasher.tree_seed(k, t)))
            .collect();

        let num_nodes: usize = forest.iter().map(Tree::num_nodes).sum();
        debug!("  shard k={}: {} nodes", self.k, num_nodes);

        self.forest = forest;
        self.leaf_size = leaf_size;
        self.state = ShardState::Built;
        Ok(())
    }

    /// Approximate top-`num_neighbors` search
    ///
    /// Returns hits ascending by distance, ties broken by ascending item id.
    /// With [`SearchK::Exhaustive`] the result equals a brute-force scan.
    ///
    /// # Errors
    /// - `NotBuilt` before [`build`](Self::build)
    /// - `DimensionMismatch` if `vector.len() != k`
    pub fn query(&self, vector: &[u8], num_neighbors: usize, search_k: SearchK) -> Result<Vec<Hit<'_>>> {
        if !self.state.is_queryable() {
            return Err(EpimeterError::NotBuilt(self.k));
        }
        if vector.len() != self.k {
            return Err(EpimeterError::DimensionMismatch {
                expected: self.k,
                actual: vector.len(),
            });
        }
        if num_neighbors == 0 {
            return Ok(Vec::new());
        }

        let items = self.items();
        let budget = search_k.budget(num_neighbors, self.forest.len());
        let candidates: AHashSet<u32> = collect_candidates(&self.forest, items, vector, budget)
            .into_iter()
            .collect();

        let mut hits: Vec<Hit<'_>> = candidates
            .into_iter()
            .map(|slot| {
                let stored = self.vector_at(slot);
                Hit {
                    item_id: self.item_ids[slot as usize],
                    distance: self.metric.distance_unchecked(vector, stored),
                    vector: stored,
                }
            })
            .collect();
        hits.sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        hits.truncate(num_neighbors);
        Ok(hits)
    }

    /// Stored vector of `item_id`
    pub fn item_vector(&self, item_id: u64) -> Option<&[u8]> {
        self.slots.get(&item_id).map(|&slot| self.vector_at(slot))
    }

    /// Record that the shard has been written to storage
    pub(crate) fn mark_persisted(&mut self) {
        if self.state == ShardState::Built {
            self.state = ShardState::Persisted;
        }
    }

    #[inline]
    fn vector_at(&self, slot: u32) -> &[u8] {
        let start = slot as usize * self.k;
        &self.vectors[start..start + self.k]
    }

    fn items(&self) -> Items<'_> {
        Items {
            vectors: &self.vectors,
            k: self.k,
            metric: &self.metric,
        }
    }

    /// K-mer length of every item
    pub fn k(&self) -> usize {
        self.k
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Check if the shard holds no items
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Number of trees (0 until built)
    pub fn n_trees(&self) -> usize {
        self.forest.len()
    }

    /// Leaf bucket size the forest was built with (0 until built)
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShardState {
        self.state
    }

    /// Metric used for building and querying
    pub fn metric(&self) -> &SubstitutionMetric {
        &self.metric
    }

    pub(crate) fn item_ids(&self) -> &[u64] {
        &self.item_ids
    }

    pub(crate) fn vectors(&self) -> &[u8] {
        &self.vectors
    }

    pub(crate) fn forest(&self) -> &[Tree] {
        &self.forest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::VectorEncoder;

    fn shard_from(peptides: &[&str]) -> ShardIndex {
        let metric = Arc::new(SubstitutionMetric::blosum62());
        let encoder = VectorEncoder::new(metric.alphabet().clone());
        let k = peptides[0].len();
        let mut shard = ShardIndex::new(k, metric).unwrap();
        for (i, p) in peptides.iter().enumerate() {
            shard.add(i as u64 + 1, &encoder.encode(p).unwrap()).unwrap();
        }
        shard
    }

    #[test]
    fn test_state_transitions() {
        let mut shard = shard_from(&["ACD", "CDE"]);
        assert_eq!(shard.state(), ShardState::Open);
        assert!(matches!(shard.query(&[0, 0, 0], 1, SearchK::Auto), Err(EpimeterError::NotBuilt(3))));

        shard.build(2, 4, 1).unwrap();
        assert_eq!(shard.state(), ShardState::Built);
        assert_eq!(shard.n_trees(), 2);
        assert!(matches!(shard.add(9, &[0, 0, 0]), Err(EpimeterError::Frozen(_))));
        assert!(matches!(shard.build(2, 4, 1), Err(EpimeterError::Frozen(_))));
        assert_eq!(shard.len(), 2);

        shard.mark_persisted();
        assert_eq!(shard.state(), ShardState::Persisted);
        assert!(shard.query(&[0, 0, 0], 1, SearchK::Auto).is_ok());
    }

    #[test]
    fn test_add_validation() {
        let mut shard = shard_from(&["ACD"]);
        assert!(matches!(
            shard.add(1, &[0, 0, 0]),
            Err(EpimeterError::DuplicateItem { k: 3, item_id: 1 })
        ));
        assert!(matches!(
            shard.add(2, &[0, 0]),
            Err(EpimeterError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_empty_shard_build() {
        let mut shard = ShardIndex::new(5, Arc::new(SubstitutionMetric::blosum62())).unwrap();
        assert!(matches!(shard.build(10, 4, 0), Err(EpimeterError::EmptyShard(5))));
        assert_eq!(shard.state(), ShardState::Open);
    }

    #[test]
    fn test_zero_k_rejected() {
        let metric = Arc::new(SubstitutionMetric::blosum62());
        assert!(matches!(ShardIndex::new(0, metric), Err(EpimeterError::Config(_))));
    }

    #[test]
    fn test_short_weights_rejected() {
        let metric = Arc::new(SubstitutionMetric::blosum62().with_weights(vec![1.0; 4]).unwrap());
        assert!(ShardIndex::new(4, metric.clone()).is_ok());
        assert!(matches!(
            ShardIndex::new(5, metric),
            Err(EpimeterError::DimensionMismatch { expected: 4, actual: 5 })
        ));
    }

    #[test]
    fn test_exhaustive_query_order() {
        let mut shard = shard_from(&["ACD", "CDE", "DEF", "EFG"]);
        shard.build(5, 1, 42).unwrap();

        let encoder = VectorEncoder::default();
        let query = encoder.encode("ACD").unwrap();
        let hits = shard.query(&query, 10, SearchK::Exhaustive).unwrap();
        let order: Vec<(u64, f32)> = hits.iter().map(|h| (h.item_id, h.distance)).collect();
        assert_eq!(order, vec![(1, 14.0), (2, 34.0), (4, 37.0), (3, 42.0)]);
        assert_eq!(encoder.decode(hits[0].vector).unwrap(), "ACD");
    }

    #[test]
    fn test_ties_broken_by_item_id() {
        let metric = Arc::new(SubstitutionMetric::blosum62());
        let mut shard = ShardIndex::new(2, metric).unwrap();
        for id in [7u64, 3, 5] {
            shard.add(id, &[0, 0]).unwrap();
        }
        shard.build(3, 1, 9).unwrap();
        let hits = shard.query(&[0, 0], 3, SearchK::Exhaustive).unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.item_id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_query_truncates_and_checks_length() {
        let mut shard = shard_from(&["ACD", "CDE", "DEF", "EFG"]);
        shard.build(3, 2, 0).unwrap();
        assert_eq!(shard.query(&[0, 4, 3], 2, SearchK::Exhaustive).unwrap().len(), 2);
        assert!(shard.query(&[0, 4, 3], 0, SearchK::Exhaustive).unwrap().is_empty());
        assert!(matches!(
            shard.query(&[0, 4], 2, SearchK::Exhaustive),
            Err(EpimeterError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_item_vector() {
        let shard = shard_from(&["ACD", "CDE"]);
        assert_eq!(shard.item_vector(2), Some(&[4u8, 3, 6][..]));
        assert_eq!(shard.item_vector(3), None);
    }

    #[test]
    fn test_search_k_parse() {
        assert_eq!("auto".parse::<SearchK>().unwrap(), SearchK::Auto);
        assert_eq!("-1".parse::<SearchK>().unwrap(), SearchK::Auto);
        assert_eq!("all".parse::<SearchK>().unwrap(), SearchK::Exhaustive);
        assert_eq!("500".parse::<SearchK>().unwrap(), SearchK::Budget(500));
        assert!("-5".parse::<SearchK>().is_err());
        assert_eq!(SearchK::Budget(12).to_string(), "12");
        assert_eq!(SearchK::Auto.budget(50, 100), 5000);
    }
}
