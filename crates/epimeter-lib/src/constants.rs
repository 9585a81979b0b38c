//! Constants and defaults for epimeter
//!
//! This module defines the default alphabet, build parameters and the
//! file names that make up a persisted index directory.

/// Default amino-acid alphabet, in substitution-matrix order.
///
/// `U` (selenocysteine) is rare in human proteins and chemically close to
/// cysteine, so the default matrix scores it like `C`.
pub const DEFAULT_AMINO_ACIDS: &[u8; 25] = b"ARNDCQEGHILKMFPSTWYVBZX*U";

/// Number of trees built per shard when not configured
pub const DEFAULT_N_TREES: usize = 100;

/// Maximum number of items stored in a leaf bucket
pub const DEFAULT_LEAF_SIZE: usize = 32;

/// Neighbors returned per epitope by the query front end
pub const DEFAULT_NUM_NEIGHBORS: usize = 50;

/// Default k-mer bounds used when indexing a proteome
pub const DEFAULT_MIN_K: usize = 8;
/// Upper default k-mer bound (inclusive)
pub const DEFAULT_MAX_K: usize = 11;

/// Extension of per-k shard files (`<k>.pid`)
pub const SHARD_FILE_EXTENSION: &str = "pid";

/// Human-readable substitution matrix stored next to the shards
pub const SCORES_FILE_NAME: &str = "scores.txt";

/// Optional per-position weights stored next to the shards
pub const WEIGHTS_FILE_NAME: &str = "weights.txt";

/// Report ingestion progress every this many k-mers
pub const PROGRESS_INTERVAL: u64 = 100_000;

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);
