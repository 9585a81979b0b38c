//! Error types for indexing, querying and persistence

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the peptide index
#[derive(Error, Debug)]
pub enum EpimeterError {
    /// Malformed configuration (k-mer bounds, matrix dimensions, weights, build parameters)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A character outside the configured alphabet was encountered while encoding
    #[error("unknown symbol {symbol:?} at position {position}")]
    UnknownSymbol {
        /// The offending character
        symbol: char,
        /// Position of the character in the peptide
        position: usize,
    },

    /// Vectors of different lengths, or longer than the configured weight vector
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Mutation attempted after build, save or load
    #[error("index is frozen: {0}")]
    Frozen(String),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    State(String),

    /// Query issued against a shard whose forest has not been built
    #[error("shard for k={0} has not been built")]
    NotBuilt(usize),

    /// Build requested for a shard that never received an item
    #[error("shard for k={0} has no items")]
    EmptyShard(usize),

    /// The same item id was added twice to one shard
    #[error("item id {item_id} already present in shard k={k}")]
    DuplicateItem {
        /// Shard key
        k: usize,
        /// The repeated id
        item_id: u64,
    },

    /// No persisted shard exists for the requested k-mer length
    #[error("no shard for k={k} in {}", dir.display())]
    ShardNotFound {
        /// Requested k-mer length
        k: usize,
        /// Directory that was searched
        dir: PathBuf,
    },

    /// A persisted shard file is malformed
    #[error("corrupt shard data: {0}")]
    Corruption(String),

    /// Filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EpimeterError>;
