//! Substitution matrices and the substitution-aware distance
//!
//! Substitution matrices score similarity (higher = more similar). The metric
//! turns a score into a non-negative cost by subtracting it from the matrix's
//! global maximum:
//!
//! ```text
//! distance(u, v) = Σ_i weight[i] * (S_max − S(u_i, v_i))
//! ```
//!
//! The ordering of scores is preserved, so small distances still mean
//! biologically similar peptides.
//!
//! # Scores file
//!
//! The text format is the usual NCBI layout:
//!
//! ```text
//!   A R N
//! A 4 -1 -2
//! R -1 5 0
//! N -2 0 6
//! ```
//!
//! The header line lists the alphabet; each following line starts with the
//! row's symbol and holds the integer scores in header order. Blank lines and
//! lines starting with `#` are ignored when parsing.

use crate::alphabet::Alphabet;
use crate::constants::DEFAULT_AMINO_ACIDS;
use crate::error::{EpimeterError, Result};
use std::io::{self, Write};
use std::path::Path;

/// BLOSUM62 over [`DEFAULT_AMINO_ACIDS`], with `U` scored like `C`
#[rustfmt::skip]
const BLOSUM62: [[i8; 25]; 25] = [
    [ 4, -1, -2, -2,  0, -1, -1,  0, -2, -1, -1, -1, -1, -2, -1,  1,  0, -3, -2,  0, -2, -1,  0, -4,  0],
    [-1,  5,  0, -2, -3,  1,  0, -2,  0, -3, -2,  2, -1, -3, -2, -1, -1, -3, -2, -3, -1,  0, -1, -4, -3],
    [-2,  0,  6,  1, -3,  0,  0,  0,  1, -3, -3,  0, -2, -3, -2,  1,  0, -4, -2, -3,  3,  0, -1, -4, -3],
    [-2, -2,  1,  6, -3,  0,  2, -1, -1, -3, -4, -1, -3, -3, -1,  0, -1, -4, -3, -3,  4,  1, -1, -4, -3],
    [ 0, -3, -3, -3,  9, -3, -4, -3, -3, -1, -1, -3, -1, -2, -3, -1, -1, -2, -2, -1, -3, -3, -2, -4,  9],
    [-1,  1,  0,  0, -3,  5,  2, -2,  0, -3, -2,  1,  0, -3, -1,  0, -1, -2, -1, -2,  0,  3, -1, -4, -3],
    [-1,  0,  0,  2, -4,  2,  5, -2,  0, -3, -3,  1, -2, -3, -1,  0, -1, -3, -2, -2,  1,  4, -1, -4, -4],
    [ 0, -2,  0, -1, -3, -2, -2,  6, -2, -4, -4, -2, -3, -3, -2,  0, -2, -2, -3, -3, -1, -2, -1, -4, -3],
    [-2,  0,  1, -1, -3,  0,  0, -2,  8, -3, -3, -1, -2, -1, -2, -1, -2, -2,  2, -3,  0,  0, -1, -4, -3],
    [-1, -3, -3, -3, -1, -3, -3, -4, -3,  4,  2, -3,  1,  0, -3, -2, -1, -3, -1,  3, -3, -3, -1, -4, -1],
    [-1, -2, -3, -4, -1, -2, -3, -4, -3,  2,  4, -2,  2,  0, -3, -2, -1, -2, -1,  1, -4, -3, -1, -4, -1],
    [-1,  2,  0, -1, -3,  1,  1, -2, -1, -3, -2,  5, -1, -3, -1,  0, -1, -3, -2, -2,  0,  1, -1, -4, -3],
    [-1, -1, -2, -3, -1,  0, -2, -3, -2,  1,  2, -1,  5,  0, -2, -1, -1, -1, -1,  1, -3, -1, -1, -4, -1],
    [-2, -3, -3, -3, -2, -3, -3, -3, -1,  0,  0, -3,  0,  6, -4, -2, -2,  1,  3, -1, -3, -3, -1, -4, -2],
    [-1, -2, -2, -1, -3, -1, -1, -2, -2, -3, -3, -1, -2, -4,  7, -1, -1, -4, -3, -2, -2, -1, -2, -4, -3],
    [ 1, -1,  1,  0, -1,  0,  0,  0, -1, -2, -2,  0, -1, -2, -1,  4,  1, -3, -2, -2,  0,  0,  0, -4, -1],
    [ 0, -1,  0, -1, -1, -1, -1, -2, -2, -1, -1, -1, -1, -2, -1,  1,  5, -2, -2,  0, -1, -1,  0, -4, -1],
    [-3, -3, -4, -4, -2, -2, -3, -2, -2, -3, -2, -3, -1,  1, -4, -3, -2, 11,  2, -3, -4, -3, -2, -4, -2],
    [-2, -2, -2, -3, -2, -1, -2, -3,  2, -1, -1, -2, -1,  3, -3, -2, -2,  2,  7, -1, -3, -2, -1, -4, -2],
    [ 0, -3, -3, -3, -1, -2, -2, -3, -3,  3,  1, -2,  1, -1, -2, -2,  0, -3, -1,  4, -3, -2, -1, -4, -1],
    [-2, -1,  3,  4, -3,  0,  1, -1,  0, -3, -4,  0, -3, -3, -2,  0, -1, -4, -3, -3,  4,  1, -1, -4, -3],
    [-1,  0,  0,  1, -3,  3,  4, -2,  0, -3, -3,  1, -1, -3, -1,  0, -1, -3, -2, -2,  1,  4, -1, -4, -3],
    [ 0, -1, -1, -1, -2, -1, -1, -1, -1, -1, -1, -1, -1, -1, -2,  0,  0, -2, -1, -1, -1, -1, -1, -4, -2],
    [ 0, -1, -1, -1, -2, -1, -1, -1, -1, -1, -1, -1, -1, -1, -2,  0,  0, -2, -1, -1, -1, -1, -1, -4, -4],
    [ 0, -3, -3, -3,  9, -3, -4, -3, -3, -1, -1, -3, -1, -2, -3, -1, -1, -2, -2, -1, -3, -3, -2, -4,  9],
];

/// Square score matrix indexed by alphabet order
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionMatrix {
    alphabet: Alphabet,
    scores: Vec<i32>,
}

impl SubstitutionMatrix {
    /// Build a matrix from rows in alphabet order
    ///
    /// # Errors
    /// Returns `Config` unless there are exactly `|alphabet|` rows of
    /// `|alphabet|` scores each.
    pub fn new(alphabet: Alphabet, rows: &[Vec<i32>]) -> Result<Self> {
        let n = alphabet.len();
        if rows.len() != n {
            return Err(EpimeterError::Config(format!(
                "substitution matrix has {} rows, alphabet has {} symbols",
                rows.len(),
                n
            )));
        }
        let mut scores = Vec::with_capacity(n * n);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n {
                return Err(EpimeterError::Config(format!(
                    "row {} ({:?}) has {} scores, expected {}",
                    i,
                    alphabet.symbols()[i] as char,
                    row.len(),
                    n
                )));
            }
            scores.extend_from_slice(row);
        }
        Ok(Self { alphabet, scores })
    }

    /// BLOSUM62 over the default amino-acid alphabet
    pub fn blosum62() -> Self {
        let scores = BLOSUM62
            .iter()
            .flat_map(|row| row.iter().map(|&s| s as i32))
            .collect();
        debug_assert_eq!(DEFAULT_AMINO_ACIDS.len(), BLOSUM62.len());
        Self {
            alphabet: Alphabet::amino_acids(),
            scores,
        }
    }

    /// Parse the text scores format
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (_, header) = lines
            .next()
            .ok_or_else(|| EpimeterError::Config("scores file has no header line".to_string()))?;

        let mut symbols = Vec::new();
        for token in header.split_whitespace() {
            symbols.push(single_symbol(token)?);
        }
        let alphabet = Alphabet::new(&symbols)?;

        let mut rows = Vec::with_capacity(symbols.len());
        for (line_no, line) in lines {
            let mut tokens = line.split_whitespace();
            // filter above guarantees at least one token
            let label = single_symbol(tokens.next().unwrap_or_default())?;
            let expected = symbols.get(rows.len()).copied();
            if expected != Some(label) {
                return Err(EpimeterError::Config(format!(
                    "line {}: row symbol {:?} does not follow header order",
                    line_no, label as char
                )));
            }
            let row = tokens
                .map(|t| {
                    t.parse::<i32>().map_err(|_| {
                        EpimeterError::Config(format!("line {}: invalid score {:?}", line_no, t))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }

        Self::new(alphabet, &rows)
    }

    /// Read and parse a scores file
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Write the matrix in the text scores format
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let symbols = self.alphabet.symbols();
        writer.write_all(b"  ")?;
        for (i, &symbol) in symbols.iter().enumerate() {
            if i > 0 {
                writer.write_all(b" ")?;
            }
            writer.write_all(&[symbol])?;
        }
        writer.write_all(b"\n")?;

        let n = symbols.len();
        for (row, &symbol) in symbols.iter().enumerate() {
            writer.write_all(&[symbol])?;
            for score in &self.scores[row * n..(row + 1) * n] {
                write!(writer, " {}", score)?;
            }
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Score for substituting symbol index `a` by `b`
    #[inline]
    pub fn score(&self, a: u8, b: u8) -> i32 {
        self.scores[a as usize * self.alphabet.len() + b as usize]
    }

    /// Global maximum score
    pub fn max_score(&self) -> i32 {
        self.scores.iter().copied().max().unwrap_or(0)
    }

    /// Alphabet the rows and columns follow
    pub fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }
}

fn single_symbol(token: &str) -> Result<u8> {
    match token.as_bytes() {
        [symbol] => Ok(*symbol),
        _ => Err(EpimeterError::Config(format!(
            "matrix symbol {:?} must be a single character",
            token
        ))),
    }
}

/// Substitution-aware distance over encoded peptides
#[derive(Debug, Clone, PartialEq)]
pub struct SubstitutionMetric {
    matrix: SubstitutionMatrix,
    weights: Option<Vec<f32>>,
    costs: Vec<f32>,
}

impl SubstitutionMetric {
    /// Build a metric with uniform weights
    pub fn new(matrix: SubstitutionMatrix) -> Self {
        let s_max = matrix.max_score();
        let costs = matrix.scores.iter().map(|&s| (s_max - s) as f32).collect();
        Self {
            matrix,
            weights: None,
            costs,
        }
    }

    /// The default metric: BLOSUM62 with uniform weights
    ///
    /// Every call returns a fresh value, so customizing one instance never
    /// leaks into another.
    pub fn blosum62() -> Self {
        Self::new(SubstitutionMatrix::blosum62())
    }

    /// Replace uniform weights by explicit per-position weights
    ///
    /// # Errors
    /// Returns `Config` if a weight is negative or not finite.
    pub fn with_weights(mut self, weights: Vec<f32>) -> Result<Self> {
        if let Some((i, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(EpimeterError::Config(format!(
                "weight {} at position {} must be finite and non-negative",
                w, i
            )));
        }
        self.weights = Some(weights);
        Ok(self)
    }

    /// Check that vectors of length `len` can be compared
    pub fn check_len(&self, len: usize) -> Result<()> {
        match &self.weights {
            Some(weights) if len > weights.len() => Err(EpimeterError::DimensionMismatch {
                expected: weights.len(),
                actual: len,
            }),
            _ => Ok(()),
        }
    }

    /// Distance between two encoded peptides
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the vectors differ in length or are
    /// longer than the weight vector.
    pub fn distance(&self, u: &[u8], v: &[u8]) -> Result<f32> {
        if u.len() != v.len() {
            return Err(EpimeterError::DimensionMismatch {
                expected: u.len(),
                actual: v.len(),
            });
        }
        self.check_len(u.len())?;
        Ok(self.distance_unchecked(u, v))
    }

    /// Distance without length checks; callers validate lengths up front.
    #[inline]
    pub(crate) fn distance_unchecked(&self, u: &[u8], v: &[u8]) -> f32 {
        let n = self.matrix.alphabet.len();
        match &self.weights {
            None => u
                .iter()
                .zip(v)
                .map(|(&a, &b)| self.costs[a as usize * n + b as usize])
                .sum(),
            Some(weights) => u
                .iter()
                .zip(v)
                .zip(weights)
                .map(|((&a, &b), &w)| w * self.costs[a as usize * n + b as usize])
                .sum(),
        }
    }

    /// Underlying score matrix
    pub fn matrix(&self) -> &SubstitutionMatrix {
        &self.matrix
    }

    /// Alphabet shared by the matrix and the encoder
    pub fn alphabet(&self) -> &Alphabet {
        &self.matrix.alphabet
    }

    /// Explicit weights, or `None` for uniform weights of 1
    pub fn weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }
}

impl Default for SubstitutionMetric {
    fn default() -> Self {
        Self::blosum62()
    }
}

/// Parse a weights file: whitespace-separated decimal weights
pub fn parse_weights(text: &str) -> Result<Vec<f32>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(|t| {
            t.parse::<f32>()
                .map_err(|_| EpimeterError::Config(format!("invalid weight {:?}", t)))
        })
        .collect()
}

/// Write weights on a single line
pub fn write_weights<W: Write>(writer: &mut W, weights: &[f32]) -> io::Result<()> {
    for (i, w) in weights.iter().enumerate() {
        if i > 0 {
            writer.write_all(b" ")?;
        }
        write!(writer, "{}", w)?;
    }
    writer.write_all(b"\n")
}
