//! Builder module for populating peptide indexes
//!
//! The indexing pipeline:
//! 1. Parse protein sequences (FASTA/FASTQ, optionally gzipped)
//! 2. Fan every k-mer in `[min_k, max_k]` out to its shard with per-k ids
//! 3. Build every shard's forest in parallel
//! 4. Persist the index directory

pub mod config;
pub mod kmers;
pub mod parse;

pub use config::{IndexConfig, KmerBounds};
pub use kmers::{IngestStats, KmerIndexer};
