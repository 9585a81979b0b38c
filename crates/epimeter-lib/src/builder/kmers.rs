//! K-mer fan-out from protein sequences into the index
//!
//! Every contiguous substring of length `k` in `[min_k, max_k]` is added to
//! the index. Item ids count up from 1, independently for each k, in the
//! order k-mers are seen (sequence by sequence, left to right).

use crate::builder::config::KmerBounds;
use crate::builder::parse::parse_sequences;
use crate::constants::PROGRESS_INTERVAL;
use crate::error::{EpimeterError, Result};
use crate::index_manager::IndexManager;
use anyhow::Context;
use std::path::Path;
use tracing::{debug, info, warn};

/// Counters collected while indexing sequences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Sequences read
    pub sequences: u64,
    /// K-mers added to the index
    pub kmers: u64,
    /// K-mers skipped because they hold symbols outside the alphabet
    pub skipped: u64,
}

/// Assigns per-k item ids and feeds k-mers to an [`IndexManager`]
#[derive(Debug, Clone)]
pub struct KmerIndexer {
    bounds: KmerBounds,
    /// Next id for each k, indexed by `k - min_k`
    next_ids: Vec<u64>,
    stats: IngestStats,
}

impl KmerIndexer {
    /// Create an indexer for the given k-mer lengths
    pub fn new(bounds: KmerBounds) -> Self {
        let num_lengths = bounds.max_k() - bounds.min_k() + 1;
        Self {
            bounds,
            next_ids: vec![1; num_lengths],
            stats: IngestStats::default(),
        }
    }

    /// Add every k-mer of `sequence` to `manager`
    ///
    /// A k-mer holding an unknown symbol is skipped but still consumes its
    /// id, so ids stay aligned with k-mer positions. Any other error aborts.
    pub fn index_sequence(&mut self, manager: &mut IndexManager, sequence: &[u8]) -> Result<()> {
        self.stats.sequences += 1;
        let mut skipped = 0u64;

        for (slot, k) in self.bounds.iter().enumerate() {
            for kmer in sequence.windows(k) {
                let item_id = self.next_ids[slot];
                self.next_ids[slot] += 1;

                match manager.add_peptide_bytes(kmer, item_id) {
                    Ok(()) => {
                        self.stats.kmers += 1;
                        if self.stats.kmers % PROGRESS_INTERVAL == 0 {
                            info!("  Indexed {} k-mers", self.stats.kmers);
                        }
                    }
                    Err(EpimeterError::UnknownSymbol { symbol, position }) => {
                        debug!(
                            "Skipping k={} item {}: unknown symbol {:?} at position {}",
                            k, item_id, symbol, position
                        );
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if skipped > 0 {
            warn!(
                "Skipped {} k-mers with unknown symbols in sequence #{}",
                skipped, self.stats.sequences
            );
            self.stats.skipped += skipped;
        }
        Ok(())
    }

    /// Index every record of a FASTA/FASTQ file
    pub fn index_fasta<P: AsRef<Path>>(
        &mut self,
        manager: &mut IndexManager,
        path: P,
    ) -> anyhow::Result<IngestStats> {
        let path = path.as_ref();
        info!("Reading proteins from {}", path.display());

        parse_sequences(path, |name, seq| {
            self.index_sequence(manager, seq).with_context(|| {
                format!("Failed to index record {}", String::from_utf8_lossy(name))
            })
        })?;

        info!(
            "Read {} sequences: {} k-mers indexed, {} skipped",
            self.stats.sequences, self.stats.kmers, self.stats.skipped
        );
        Ok(self.stats)
    }

    /// Id the next k-mer of length `k` will receive
    pub fn next_id(&self, k: usize) -> Option<u64> {
        k.checked_sub(self.bounds.min_k())
            .and_then(|slot| self.next_ids.get(slot))
            .copied()
    }

    /// Counters so far
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Indexed k-mer lengths
    pub fn bounds(&self) -> KmerBounds {
        self.bounds
    }
}
