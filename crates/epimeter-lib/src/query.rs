//! Epitope queries and result output
//!
//! [`QueryEngine`] runs epitope batches against an [`IndexManager`] in
//! parallel; [`write_results`] writes the two aligned CSV outputs, one row
//! per epitope:
//!
//! ```text
//! nearest_neighbors.csv   id,distance,id,distance,...
//! peptide_nns.csv         id,peptide,id,peptide,...
//! ```

use crate::constants::DEFAULT_NUM_NEIGHBORS;
use crate::error::Result;
use crate::index_manager::IndexManager;
use crate::shard::SearchK;
use rayon::prelude::*;
use std::io::{self, Write};

/// One neighbor of an epitope
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Item id of the indexed k-mer
    pub item_id: u64,
    /// Substitution distance to the epitope
    pub distance: f32,
    /// The indexed k-mer
    pub peptide: String,
}

/// Neighbors of one epitope, ascending by distance, ties by item id
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// The queried epitope
    pub epitope: String,
    /// At most the requested number of neighbors
    pub neighbors: Vec<Neighbor>,
}

impl QueryResult {
    /// Number of neighbors found
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// Check if no neighbor was found
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// `id,distance` pairs joined by commas
    pub fn distance_row(&self) -> String {
        self.neighbors
            .iter()
            .map(|n| format!("{},{}", n.item_id, n.distance))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// `id,peptide` pairs joined by commas
    pub fn peptide_row(&self) -> String {
        self.neighbors
            .iter()
            .map(|n| format!("{},{}", n.item_id, n.peptide))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Batch query front-end over a loaded or freshly built index
pub struct QueryEngine<'a> {
    manager: &'a IndexManager,
    num_neighbors: usize,
    search_k: SearchK,
}

impl<'a> QueryEngine<'a> {
    /// Create an engine returning [`DEFAULT_NUM_NEIGHBORS`] neighbors with
    /// the automatic search budget
    pub fn new(manager: &'a IndexManager) -> Self {
        Self {
            manager,
            num_neighbors: DEFAULT_NUM_NEIGHBORS,
            search_k: SearchK::Auto,
        }
    }

    /// Set the number of neighbors per epitope
    pub fn num_neighbors(mut self, num_neighbors: usize) -> Self {
        self.num_neighbors = num_neighbors;
        self
    }

    /// Set the candidate budget
    pub fn search_k(mut self, search_k: SearchK) -> Self {
        self.search_k = search_k;
        self
    }

    /// Query a single epitope
    pub fn query(&self, epitope: &str) -> Result<QueryResult> {
        self.manager.query(epitope, self.num_neighbors, self.search_k)
    }

    /// Query every epitope in parallel on the current rayon pool
    ///
    /// Results are returned in input order.
    pub fn query_all<S: AsRef<str> + Sync>(&self, epitopes: &[S]) -> Vec<Result<QueryResult>> {
        epitopes
            .par_iter()
            .map(|epitope| self.query(epitope.as_ref()))
            .collect()
    }
}

/// Write one distance row and one peptide row per result
pub fn write_results<W1: Write, W2: Write>(
    distances: &mut W1,
    peptides: &mut W2,
    results: &[QueryResult],
) -> io::Result<()> {
    for result in results {
        writeln!(distances, "{}", result.distance_row())?;
        writeln!(peptides, "{}", result.peptide_row())?;
    }
    Ok(())
}
