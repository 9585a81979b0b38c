// Epimeter: substitution-aware nearest-neighbor search over peptide k-mers
//
// Indexes the k-mers of a reference proteome, one approximate
// nearest-neighbor forest per k-mer length, and scores query epitopes
// against them under a substitution-matrix distance.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod alphabet;
pub mod builder;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod hasher;
pub mod index_manager;
pub mod query;
pub mod serialization;
pub mod shard;
pub mod substitution;

// Re-export common types at crate root
pub use alphabet::Alphabet;
pub use builder::{IndexConfig, IngestStats, KmerBounds, KmerIndexer};
pub use encoding::{PeptideVector, VectorEncoder};
pub use error::{EpimeterError, Result};
pub use index_manager::IndexManager;
pub use query::{write_results, Neighbor, QueryEngine, QueryResult};
pub use shard::{Hit, SearchK, ShardIndex, ShardState};
pub use substitution::{SubstitutionMatrix, SubstitutionMetric};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let (major, minor, patch) = version();
        assert_eq!(major, 0);
        assert_eq!(minor, 1);
        assert_eq!(patch, 0);
    }
}
