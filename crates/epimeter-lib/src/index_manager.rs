//! Multi-shard index manager
//!
//! Routes peptides to the shard for their length, builds every shard's
//! forest, persists the index to a directory and serves queries. Shards of
//! a loaded index are read lazily, the first time a query needs them.

use crate::builder::config::IndexConfig;
use crate::encoding::VectorEncoder;
use crate::error::{EpimeterError, Result};
use crate::query::{Neighbor, QueryResult};
use crate::serialization::{load_shard, load_substitution, save_shard, save_substitution};
use crate::shard::{SearchK, ShardIndex, ShardState};
use crate::substitution::{SubstitutionMatrix, SubstitutionMetric};
use ahash::AHashMap;
use rand::Rng;
use rayon::prelude::*;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Owner of all shards of one peptide index
#[derive(Debug)]
pub struct IndexManager {
    config: IndexConfig,
    metric: Arc<SubstitutionMetric>,
    encoder: VectorEncoder,
    /// Shards built by this instance
    shards: BTreeMap<usize, ShardIndex>,
    /// Shards read from `directory` on demand
    loaded: RwLock<AHashMap<usize, Arc<ShardIndex>>>,
    directory: Option<PathBuf>,
    frozen: bool,
    /// Set by `load`; such an index holds no shards in memory to write
    opened: bool,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager {
    /// Create a manager with the default configuration and BLOSUM62
    pub fn new() -> Self {
        Self::from_validated(IndexConfig::default(), SubstitutionMetric::default())
    }

    /// Create a manager with custom build parameters
    pub fn with_config(config: IndexConfig) -> Result<Self> {
        Self::with_metric(config, SubstitutionMetric::default())
    }

    /// Create a manager with custom build parameters and metric
    pub fn with_metric(config: IndexConfig, metric: SubstitutionMetric) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, metric))
    }

    fn from_validated(config: IndexConfig, metric: SubstitutionMetric) -> Self {
        let encoder = VectorEncoder::new(metric.alphabet().clone());
        Self {
            config,
            metric: Arc::new(metric),
            encoder,
            shards: BTreeMap::new(),
            loaded: RwLock::new(AHashMap::new()),
            directory: None,
            frozen: false,
            opened: false,
        }
    }

    /// Add a peptide to the shard for its length
    ///
    /// # Errors
    /// - `Frozen` after [`save`](Self::save) or [`load`](Self::load)
    /// - `UnknownSymbol` if the peptide holds a symbol outside the alphabet
    /// - `DuplicateItem` if the shard already holds `item_id`
    ///
    /// Nothing is added when an error is returned.
    pub fn add_peptide(&mut self, peptide: &str, item_id: u64) -> Result<()> {
        self.add_peptide_bytes(peptide.as_bytes(), item_id)
    }

    /// Same as [`add_peptide`](Self::add_peptide) for raw sequence bytes
    pub fn add_peptide_bytes(&mut self, peptide: &[u8], item_id: u64) -> Result<()> {
        if self.frozen {
            return Err(EpimeterError::Frozen(
                "cannot add peptides after save or load".to_string(),
            ));
        }
        if peptide.is_empty() {
            return Err(EpimeterError::Config("cannot index an empty peptide".to_string()));
        }
        let vector = self.encoder.encode_bytes(peptide)?;

        match self.shards.entry(vector.len()) {
            Entry::Occupied(mut entry) => entry.get_mut().add(item_id, &vector),
            Entry::Vacant(entry) => {
                let mut shard = ShardIndex::new(vector.len(), Arc::clone(&self.metric))?;
                shard.add(item_id, &vector)?;
                entry.insert(shard);
                Ok(())
            }
        }
    }

    /// Build the forest of every open shard
    ///
    /// Shards and the trees within each shard are built in parallel on a
    /// pool of `config.num_threads` workers (0 = all cores).
    pub fn build_all(&mut self) -> Result<()> {
        let pending = self
            .shards
            .values()
            .filter(|shard| shard.state() == ShardState::Open)
            .count();
        if pending == 0 {
            debug!("No open shards to build");
            return Ok(());
        }

        self.config.print();
        let seed = self.config.seed.unwrap_or_else(|| rand::rng().random());
        info!("Building {} shards (seed {})", pending, seed);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.num_threads)
            .build()
            .map_err(|e| EpimeterError::Config(format!("failed to create thread pool: {e}")))?;

        let n_trees = self.config.n_trees;
        let leaf_size = self.config.leaf_size;
        pool.install(|| {
            self.shards
                .par_iter_mut()
                .filter(|(_, shard)| shard.state() == ShardState::Open)
                .try_for_each(|(_, shard)| shard.build(n_trees, leaf_size, seed))
        })?;

        info!("Build complete");
        Ok(())
    }

    /// Build all shards and write the index to `dir`
    ///
    /// Creates `dir` if needed. The manager is frozen afterwards.
    ///
    /// # Errors
    /// - `Frozen` if the index was opened with [`load`](Self::load); copy
    ///   the directory instead
    pub fn save<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        if self.opened {
            return Err(EpimeterError::Frozen(format!(
                "index opened from {} is read-only",
                self.directory.as_deref().unwrap_or(dir).display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        self.build_all()?;

        if self.shards.is_empty() {
            warn!("Saving an index without any shards to {}", dir.display());
        }
        for shard in self.shards.values_mut() {
            let path = save_shard(dir, shard)?;
            shard.mark_persisted();
            debug!("  wrote {} ({} items)", path.display(), shard.len());
        }
        save_substitution(dir, &self.metric)?;

        info!("Saved {} shards to {}", self.shards.len(), dir.display());
        self.directory = Some(dir.to_path_buf());
        self.frozen = true;
        Ok(())
    }

    /// Open the index stored in `dir`
    ///
    /// Shards are not read until a query needs them. The substitution
    /// configuration stored in `dir` replaces the current one; without one
    /// the current configuration is kept. The manager is frozen afterwards.
    ///
    /// # Errors
    /// - `State` if this manager holds items that were never saved
    /// - `Io` if `dir` is not a directory
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        if let Some(shard) = self
            .shards
            .values()
            .find(|shard| matches!(shard.state(), ShardState::Open | ShardState::Built))
        {
            return Err(EpimeterError::State(format!(
                "shard k={} holds {} unsaved items",
                shard.k(),
                shard.len()
            )));
        }
        if !dir.is_dir() {
            return Err(EpimeterError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("index directory {} does not exist", dir.display()),
            )));
        }

        let metric = load_substitution(dir, &self.metric)?;
        self.encoder = VectorEncoder::new(metric.alphabet().clone());
        self.metric = Arc::new(metric);

        self.shards.clear();
        self.loaded
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.directory = Some(dir.to_path_buf());
        self.frozen = true;
        self.opened = true;
        info!("Opened index {}", dir.display());
        Ok(())
    }

    /// Approximate nearest neighbors of `epitope` among the k-mers of the
    /// same length
    ///
    /// # Errors
    /// - `UnknownSymbol` if the epitope holds a symbol outside the alphabet
    /// - `ShardNotFound` if no shard exists for the epitope's length
    /// - `NotBuilt` if the shard has not been built yet
    /// - `Corruption` if the shard file is malformed
    pub fn query(&self, epitope: &str, num_neighbors: usize, search_k: SearchK) -> Result<QueryResult> {
        if epitope.is_empty() {
            return Err(EpimeterError::Config("cannot query an empty epitope".to_string()));
        }
        let vector = self.encoder.encode(epitope)?;

        let neighbors = self.with_shard(vector.len(), |shard| {
            shard
                .query(&vector, num_neighbors, search_k)?
                .into_iter()
                .map(|hit| {
                    Ok(Neighbor {
                        item_id: hit.item_id,
                        distance: hit.distance,
                        peptide: self.encoder.decode(hit.vector)?,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(QueryResult {
            epitope: epitope.to_string(),
            neighbors,
        })
    }

    /// Peptide stored under `item_id` in the shard for `k`
    pub fn peptide(&self, k: usize, item_id: u64) -> Result<Option<String>> {
        self.with_shard(k, |shard| {
            shard
                .item_vector(item_id)
                .map(|vector| self.encoder.decode(vector))
                .transpose()
        })
    }

    /// Number of items in the shard for `k`
    pub fn num_items(&self, k: usize) -> Result<usize> {
        self.with_shard(k, |shard| Ok(shard.len()))
    }

    /// K-mer lengths with a shard, in memory or in the index directory
    pub fn kmer_lengths(&self) -> Result<Vec<usize>> {
        let mut lengths: BTreeSet<usize> = self.shards.keys().copied().collect();
        if let Some(dir) = &self.directory {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                let is_shard = path
                    .extension()
                    .is_some_and(|ext| ext == crate::constants::SHARD_FILE_EXTENSION);
                if let Some(k) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<usize>().ok())
                    .filter(|_| is_shard)
                {
                    lengths.insert(k);
                }
            }
        }
        Ok(lengths.into_iter().collect())
    }

    /// Change the number of trees built per shard
    pub fn set_n_trees(&mut self, n_trees: usize) -> Result<()> {
        if self.frozen {
            return Err(EpimeterError::Frozen("cannot change n_trees".to_string()));
        }
        let config = IndexConfig {
            n_trees,
            ..self.config.clone()
        };
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Replace the substitution metric (and with it the alphabet)
    ///
    /// # Errors
    /// - `Frozen` after save or load
    /// - `State` once peptides have been added, since they were encoded
    ///   against the current alphabet
    pub fn set_substitution_metric(&mut self, metric: SubstitutionMetric) -> Result<()> {
        if self.frozen {
            return Err(EpimeterError::Frozen(
                "cannot change the substitution metric".to_string(),
            ));
        }
        if !self.shards.is_empty() {
            return Err(EpimeterError::State(
                "cannot change the substitution metric after adding peptides".to_string(),
            ));
        }
        self.encoder = VectorEncoder::new(metric.alphabet().clone());
        self.metric = Arc::new(metric);
        Ok(())
    }

    /// Use the substitution matrix stored in `path` with uniform weights
    pub fn load_scores_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let matrix = SubstitutionMatrix::read_file(path)?;
        self.set_substitution_metric(SubstitutionMetric::new(matrix))
    }

    /// Run `f` on the shard for `k`, reading it from disk if needed
    fn with_shard<R>(&self, k: usize, f: impl FnOnce(&ShardIndex) -> Result<R>) -> Result<R> {
        if let Some(shard) = self.shards.get(&k) {
            return f(shard);
        }
        let shard = self.loaded_shard(k)?;
        f(&shard)
    }

    fn loaded_shard(&self, k: usize) -> Result<Arc<ShardIndex>> {
        let cached = self
            .loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&k)
            .cloned();
        if let Some(shard) = cached {
            return Ok(shard);
        }

        let Some(dir) = &self.directory else {
            return Err(EpimeterError::State(format!(
                "no shard for k={} and no index directory to load from",
                k
            )));
        };

        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        // another query may have loaded it while we waited for the lock
        if let Some(shard) = loaded.get(&k) {
            return Ok(Arc::clone(shard));
        }
        debug!("Loading shard k={} from {}", k, dir.display());
        let shard = Arc::new(load_shard(dir, k, Arc::clone(&self.metric))?);
        loaded.insert(k, Arc::clone(&shard));
        Ok(shard)
    }

    /// Whether the manager rejects further additions
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Directory the index was saved to or loaded from
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Active substitution metric
    pub fn metric(&self) -> &SubstitutionMetric {
        &self.metric
    }

    /// Build parameters
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alphabet::Alphabet;
    use tempfile::TempDir;

    fn seeded() -> IndexManager {
        IndexManager::with_config(IndexConfig {
            n_trees: 4,
            leaf_size: 2,
            seed: Some(7),
            num_threads: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_routes_by_length() {
        let mut manager = seeded();
        manager.add_peptide("ACD", 1).unwrap();
        manager.add_peptide("CDE", 2).unwrap();
        manager.add_peptide("ACDE", 1).unwrap();

        assert_eq!(manager.kmer_lengths().unwrap(), vec![3, 4]);
        assert_eq!(manager.num_items(3).unwrap(), 2);
        assert_eq!(manager.num_items(4).unwrap(), 1);
        assert_eq!(manager.peptide(3, 2).unwrap().as_deref(), Some("CDE"));
        assert_eq!(manager.peptide(3, 9).unwrap(), None);
    }

    #[test]
    fn test_unknown_symbol_adds_nothing() {
        let mut manager = seeded();
        assert!(matches!(
            manager.add_peptide("ACJ", 1),
            Err(EpimeterError::UnknownSymbol { symbol: 'J', position: 2 })
        ));
        assert!(manager.kmer_lengths().unwrap().is_empty());
        assert!(matches!(manager.add_peptide("", 1), Err(EpimeterError::Config(_))));
    }

    #[test]
    fn test_duplicate_id_in_new_shard_leaves_no_shard() {
        let mut manager = seeded();
        manager.add_peptide("ACD", 1).unwrap();
        assert!(matches!(
            manager.add_peptide("CDE", 1),
            Err(EpimeterError::DuplicateItem { k: 3, item_id: 1 })
        ));
        assert_eq!(manager.num_items(3).unwrap(), 1);
    }

    #[test]
    fn test_query_before_build() {
        let mut manager = seeded();
        manager.add_peptide("ACD", 1).unwrap();
        assert!(matches!(
            manager.query("ACD", 1, SearchK::Auto),
            Err(EpimeterError::NotBuilt(3))
        ));
        assert!(matches!(
            manager.query("ACDE", 1, SearchK::Auto),
            Err(EpimeterError::State(_))
        ));

        manager.build_all().unwrap();
        let result = manager.query("ACD", 1, SearchK::Auto).unwrap();
        assert_eq!(result.neighbors[0].item_id, 1);
        assert_eq!(result.neighbors[0].peptide, "ACD");
        assert!(!manager.is_frozen());
    }

    #[test]
    fn test_save_freezes() {
        let dir = TempDir::new().unwrap();
        let mut manager = seeded();
        manager.add_peptide("ACD", 1).unwrap();
        manager.save(dir.path().join("idx")).unwrap();

        assert!(manager.is_frozen());
        assert_eq!(manager.directory(), Some(dir.path().join("idx").as_path()));
        assert!(matches!(manager.add_peptide("CDE", 2), Err(EpimeterError::Frozen(_))));
        assert!(matches!(manager.set_n_trees(3), Err(EpimeterError::Frozen(_))));
        assert_eq!(manager.num_items(3).unwrap(), 1);

        // other lengths are looked up in the saved directory
        assert!(matches!(
            manager.query("ACDE", 1, SearchK::Auto),
            Err(EpimeterError::ShardNotFound { k: 4, .. })
        ));
    }

    #[test]
    fn test_save_after_load_is_frozen() {
        let dir = TempDir::new().unwrap();
        let mut manager = seeded();
        manager.add_peptide("ACD", 1).unwrap();
        manager.save(dir.path().join("idx")).unwrap();

        let mut reopened = IndexManager::new();
        reopened.load(dir.path().join("idx")).unwrap();
        assert!(matches!(
            reopened.save(dir.path().join("copy")),
            Err(EpimeterError::Frozen(_))
        ));
        assert!(!dir.path().join("copy").exists());
        assert_eq!(reopened.num_items(3).unwrap(), 1);

        // a saved manager still holds its shards and can write them again
        manager.save(dir.path().join("again")).unwrap();
        assert!(dir.path().join("again").join("3.pid").is_file());
    }

    #[test]
    fn test_load_rejects_unsaved_items() {
        let dir = TempDir::new().unwrap();
        let mut manager = seeded();
        manager.add_peptide("ACD", 1).unwrap();
        assert!(matches!(manager.load(dir.path()), Err(EpimeterError::State(_))));
        assert!(!manager.is_frozen());
    }

    #[test]
    fn test_load_missing_directory() {
        let dir = TempDir::new().unwrap();
        let mut manager = IndexManager::new();
        assert!(matches!(
            manager.load(dir.path().join("missing")),
            Err(EpimeterError::Io(_))
        ));
    }

    #[test]
    fn test_lazy_load_shares_shard() {
        let dir = TempDir::new().unwrap();
        let mut manager = seeded();
        for (i, p) in ["ACD", "CDE", "DEF"].iter().enumerate() {
            manager.add_peptide(p, i as u64 + 1).unwrap();
        }
        manager.save(dir.path()).unwrap();

        let mut reopened = IndexManager::new();
        reopened.load(dir.path()).unwrap();
        assert!(reopened.is_frozen());
        assert_eq!(reopened.kmer_lengths().unwrap(), vec![3]);

        let first = reopened.loaded_shard(3).unwrap();
        let second = reopened.loaded_shard(3).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reopened.peptide(3, 3).unwrap().as_deref(), Some("DEF"));
    }

    #[test]
    fn test_metric_changes_are_guarded() {
        let mut manager = seeded();
        let alphabet = Alphabet::new(b"AB").unwrap();
        let matrix = SubstitutionMatrix::new(alphabet, &[vec![1, 0], vec![0, 1]]).unwrap();
        manager.set_substitution_metric(SubstitutionMetric::new(matrix)).unwrap();
        assert_eq!(manager.metric().alphabet().len(), 2);

        // 'C' is no longer part of the alphabet
        assert!(matches!(
            manager.add_peptide("ABC", 1),
            Err(EpimeterError::UnknownSymbol { .. })
        ));
        manager.add_peptide("ABBA", 1).unwrap();
        assert!(matches!(
            manager.set_substitution_metric(SubstitutionMetric::blosum62()),
            Err(EpimeterError::State(_))
        ));
    }

    #[test]
    fn test_set_n_trees() {
        let mut manager = IndexManager::new();
        manager.set_n_trees(12).unwrap();
        assert_eq!(manager.config().n_trees, 12);
        assert!(matches!(manager.set_n_trees(0), Err(EpimeterError::Config(_))));
        assert_eq!(manager.config().n_trees, 12);
    }

    #[test]
    fn test_instances_do_not_share_settings() {
        let mut first = IndexManager::new();
        first.set_n_trees(3).unwrap();
        let second = IndexManager::new();
        assert_eq!(second.config().n_trees, crate::constants::DEFAULT_N_TREES);
    }
}
