//! Peptide encoding
//!
//! Converts peptides into vectors of alphabet indices and back. A peptide
//! is encoded as a whole: the first unknown symbol aborts the call and no
//! partial vector is produced.

use crate::alphabet::Alphabet;
use crate::error::{EpimeterError, Result};
use std::ops::Deref;

/// Fixed-length sequence of alphabet indices
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeptideVector(Vec<u8>);

impl PeptideVector {
    /// Consume into the raw indices
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for PeptideVector {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PeptideVector {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Lossless peptide <-> vector conversion
#[derive(Debug, Clone, Default)]
pub struct VectorEncoder {
    alphabet: Alphabet,
}

impl VectorEncoder {
    /// Create an encoder over `alphabet`
    pub fn new(alphabet: Alphabet) -> Self {
        Self { alphabet }
    }

    /// Encode a peptide string
    ///
    /// # Errors
    /// Returns `UnknownSymbol` for the first character outside the alphabet
    pub fn encode(&self, peptide: &str) -> Result<PeptideVector> {
        self.encode_bytes(peptide.as_bytes())
    }

    /// Encode a peptide given as raw bytes
    pub fn encode_bytes(&self, peptide: &[u8]) -> Result<PeptideVector> {
        let indices = peptide
            .iter()
            .enumerate()
            .map(|(i, &symbol)| self.alphabet.encode(symbol, i))
            .collect::<Result<Vec<u8>>>()?;
        Ok(PeptideVector(indices))
    }

    /// Decode a vector back into its peptide
    ///
    /// # Errors
    /// Returns `Corruption` if an index falls outside the alphabet, which
    /// cannot happen for vectors produced by this encoder.
    pub fn decode(&self, vector: &[u8]) -> Result<String> {
        vector
            .iter()
            .map(|&index| {
                self.alphabet.decode(index).map(char::from).ok_or_else(|| {
                    EpimeterError::Corruption(format!(
                        "symbol index {} outside alphabet of {}",
                        index,
                        self.alphabet.len()
                    ))
                })
            })
            .collect()
    }

    /// Alphabet used by the encoder
    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }
}
