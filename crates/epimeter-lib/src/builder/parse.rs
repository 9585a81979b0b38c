//! FASTA/FASTQ and epitope list parsing
//!
//! Reads protein sequences from FASTA or FASTQ files, with transparent
//! gzip decompression, and epitope lists with one peptide per line.

use anyhow::{Context, Result};
use needletail::parse_fastx_file;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Parse a FASTA/FASTQ file and call a function for each sequence
///
/// # Arguments
/// * `path` - Path to input file (may be gzipped)
/// * `callback` - Function called for each sequence, receives (name, sequence)
///
/// # Errors
/// Returns error if:
/// - File cannot be opened
/// - File format is invalid
/// - The callback fails
pub fn parse_sequences<P, F>(path: P, mut callback: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(&[u8], &[u8]) -> Result<()>,
{
    let path = path.as_ref();

    // needletail automatically handles gzip decompression
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("Failed to open sequence file: {}", path.display()))?;

    while let Some(record) = reader.next() {
        let record = record
            .with_context(|| format!("Failed to parse sequence record in {}", path.display()))?;
        let seq = record.seq();
        callback(record.id(), &seq)?;
    }

    Ok(())
}

/// Read an epitope list: one peptide per line, surrounding whitespace
/// trimmed, blank lines skipped
pub fn read_epitopes<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open epitope file: {}", path.display()))?;

    let mut epitopes = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("Failed to read line {} of {}", line_no + 1, path.display())
        })?;
        let epitope = line.trim();
        if !epitope.is_empty() {
            epitopes.push(epitope.to_string());
        }
    }
    Ok(epitopes)
}
