//! Symbol alphabet
//!
//! Bijective mapping between single-byte symbols and dense indices. The
//! index order is the row/column order of the substitution matrix.

use crate::constants::DEFAULT_AMINO_ACIDS;
use crate::error::{EpimeterError, Result};

const NO_INDEX: u8 = u8::MAX;

/// Ordered set of symbols with O(1) lookup in both directions
#[derive(Clone, PartialEq, Eq)]
pub struct Alphabet {
    symbols: Vec<u8>,
    lookup: [u8; 256],
}

impl Alphabet {
    /// Build an alphabet from symbols in index order
    ///
    /// # Errors
    /// Returns `Config` if the alphabet is empty, holds more than 254
    /// symbols, repeats a symbol, or holds a byte that is not printable
    /// ASCII.
    pub fn new(symbols: &[u8]) -> Result<Self> {
        if symbols.is_empty() {
            return Err(EpimeterError::Config("alphabet is empty".to_string()));
        }
        if symbols.len() >= NO_INDEX as usize {
            return Err(EpimeterError::Config(format!(
                "alphabet holds {} symbols, at most {} are supported",
                symbols.len(),
                NO_INDEX as usize - 1
            )));
        }

        let mut lookup = [NO_INDEX; 256];
        for (i, &symbol) in symbols.iter().enumerate() {
            // scores.txt separates symbols by whitespace and is read back as UTF-8
            if !symbol.is_ascii_graphic() {
                return Err(EpimeterError::Config(format!(
                    "alphabet symbol 0x{:02x} is not printable ASCII",
                    symbol
                )));
            }
            if lookup[symbol as usize] != NO_INDEX {
                return Err(EpimeterError::Config(format!(
                    "symbol {:?} appears twice in alphabet",
                    symbol as char
                )));
            }
            lookup[symbol as usize] = i as u8;
        }

        Ok(Self {
            symbols: symbols.to_vec(),
            lookup,
        })
    }

    /// The 25-symbol amino-acid alphabet
    pub fn amino_acids() -> Self {
        let mut lookup = [NO_INDEX; 256];
        for (i, &symbol) in DEFAULT_AMINO_ACIDS.iter().enumerate() {
            lookup[symbol as usize] = i as u8;
        }
        Self {
            symbols: DEFAULT_AMINO_ACIDS.to_vec(),
            lookup,
        }
    }

    /// Index of `symbol`, or `None` if it is not part of the alphabet
    #[inline]
    pub fn index_of(&self, symbol: u8) -> Option<u8> {
        match self.lookup[symbol as usize] {
            NO_INDEX => None,
            index => Some(index),
        }
    }

    /// Encode a single symbol
    ///
    /// `position` is only used to build the error.
    #[inline]
    pub fn encode(&self, symbol: u8, position: usize) -> Result<u8> {
        self.index_of(symbol).ok_or(EpimeterError::UnknownSymbol {
            symbol: symbol as char,
            position,
        })
    }

    /// Symbol stored at `index`, if in range
    #[inline]
    pub fn decode(&self, index: u8) -> Option<u8> {
        self.symbols.get(index as usize).copied()
    }

    /// Number of symbols
    #[inline]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Always false for a constructed alphabet
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbols in index order
    pub fn symbols(&self) -> &[u8] {
        &self.symbols
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Self::amino_acids()
    }
}

impl std::fmt::Debug for Alphabet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Alphabet")
            .field(&String::from_utf8_lossy(&self.symbols))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amino_acid_order() {
        let alphabet = Alphabet::amino_acids();
        assert_eq!(alphabet.len(), 25);
        assert_eq!(alphabet.index_of(b'A'), Some(0));
        assert_eq!(alphabet.index_of(b'R'), Some(1));
        assert_eq!(alphabet.index_of(b'*'), Some(23));
        assert_eq!(alphabet.index_of(b'U'), Some(24));
        assert_eq!(alphabet, Alphabet::new(DEFAULT_AMINO_ACIDS).unwrap());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let alphabet = Alphabet::amino_acids();
        for &symbol in alphabet.symbols() {
            let index = alphabet.encode(symbol, 0).unwrap();
            assert_eq!(alphabet.decode(index), Some(symbol));
        }
    }

    #[test]
    fn test_unknown_symbol() {
        let alphabet = Alphabet::amino_acids();
        // case-sensitive, and J/O are not amino-acid codes here
        assert!(alphabet.index_of(b'a').is_none());
        let err = alphabet.encode(b'J', 7).unwrap_err();
        assert!(matches!(
            err,
            EpimeterError::UnknownSymbol { symbol: 'J', position: 7 }
        ));
        assert_eq!(alphabet.decode(25), None);
    }

    #[test]
    fn test_custom_alphabet() {
        let alphabet = Alphabet::new(b"ACGT").unwrap();
        assert_eq!(alphabet.len(), 4);
        assert_eq!(alphabet.index_of(b'T'), Some(3));
        assert!(alphabet.index_of(b'R').is_none());
    }

    #[test]
    fn test_invalid_alphabets() {
        assert!(Alphabet::new(b"").is_err());
        assert!(Alphabet::new(b"ACA").is_err());
        let too_many: Vec<u8> = (0u8..=254).collect();
        assert!(Alphabet::new(&too_many).is_err());
    }

    #[test]
    fn test_non_printable_symbols_rejected() {
        let cases: [&[u8]; 5] = [&[0xE9, b'A'], b"A C", b"AC\n", b"A\tC", &[0x00, b'A']];
        for symbols in cases {
            assert!(
                matches!(Alphabet::new(symbols), Err(EpimeterError::Config(_))),
                "{:?}",
                symbols
            );
        }
        assert!(Alphabet::new(b"ACDE*").is_ok());
    }
}
