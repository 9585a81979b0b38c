//! Serialization and deserialization of index directories
//!
//! An index is a directory holding one binary shard file per k-mer length
//! plus the substitution configuration:
//!
//! ```text
//! <index>/
//!   8.pid          shard for k = 8
//!   9.pid          shard for k = 9
//!   scores.txt     substitution matrix (text, see `substitution`)
//!   weights.txt    per-position weights, only when configured
//! ```
//!
//! # Shard File Format
//!
//! All integers are little-endian.
//!
//! ```text
//! ShardSerializationHeader
//!   ├─ magic: "EPIPID01"
//!   ├─ version_major: u32
//!   ├─ version_minor: u32
//!   ├─ k: u64
//!   ├─ alphabet_size: u32
//!   ├─ num_items: u64
//!   ├─ num_trees: u32
//!   └─ leaf_size: u32
//! Item ids:      [u64; num_items]
//! Item vectors:  [u8; num_items * k]
//! Trees ([num_trees] entries):
//!   ├─ num_nodes: u32
//!   ├─ root: u32
//!   └─ nodes ([num_nodes] entries):
//!      ├─ tag 0 (leaf):  len: u32, items: [u32; len]
//!      └─ tag 1 (split): ref_a: u32, ref_b: u32, left: u32, right: u32
//! ```
//!
//! Shard files are read through a read-only memory map and fully validated:
//! every node, item and symbol reference must be in range.

use crate::constants::{SCORES_FILE_NAME, SHARD_FILE_EXTENSION, WEIGHTS_FILE_NAME};
use crate::error::{EpimeterError, Result};
use crate::shard::tree::{Node, Tree};
use crate::shard::ShardIndex;
use crate::substitution::{parse_weights, write_weights, SubstitutionMatrix, SubstitutionMetric};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for the shard format
const MAGIC: &[u8; 8] = b"EPIPID01";

/// File format version: (major, minor)
/// Increment major on breaking changes, minor on compatible changes
const FORMAT_VERSION: (u32, u32) = (1, 0);

const TAG_LEAF: u8 = 0;
const TAG_SPLIT: u8 = 1;

/// Header of a serialized shard
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardSerializationHeader {
    /// Magic number for format identification ("EPIPID01")
    pub magic: [u8; 8],
    /// Format version major number
    pub version_major: u32,
    /// Format version minor number
    pub version_minor: u32,
    /// K-mer length
    pub k: usize,
    /// Size of the alphabet the vectors were encoded with
    pub alphabet_size: u32,
    /// Number of items
    pub num_items: u64,
    /// Number of trees
    pub num_trees: u32,
    /// Leaf bucket size used at build time
    pub leaf_size: u32,
}

impl ShardSerializationHeader {
    /// Create a header describing `shard`
    pub fn new(shard: &ShardIndex) -> Self {
        Self {
            magic: *MAGIC,
            version_major: FORMAT_VERSION.0,
            version_minor: FORMAT_VERSION.1,
            k: shard.k(),
            alphabet_size: shard.metric().alphabet().len() as u32,
            num_items: shard.len() as u64,
            num_trees: shard.n_trees() as u32,
            leaf_size: shard.leaf_size() as u32,
        }
    }

    /// Write header to a writer
    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version_major.to_le_bytes())?;
        writer.write_all(&self.version_minor.to_le_bytes())?;
        writer.write_all(&(self.k as u64).to_le_bytes())?;
        writer.write_all(&self.alphabet_size.to_le_bytes())?;
        writer.write_all(&self.num_items.to_le_bytes())?;
        writer.write_all(&self.num_trees.to_le_bytes())?;
        writer.write_all(&self.leaf_size.to_le_bytes())?;
        Ok(())
    }

    /// Read header from a reader
    ///
    /// # Errors
    /// Returns `Corruption` on bad magic, a different major version, or
    /// truncated input.
    pub fn read(reader: &mut dyn Read) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(EpimeterError::Corruption(
                "invalid magic number for shard file".to_string(),
            ));
        }

        let version_major = read_u32(reader)?;
        let version_minor = read_u32(reader)?;
        if version_major != FORMAT_VERSION.0 {
            return Err(EpimeterError::Corruption(format!(
                "incompatible format version: {}.{}, expected {}.{}",
                version_major, version_minor, FORMAT_VERSION.0, FORMAT_VERSION.1
            )));
        }

        let k = read_u64(reader)?;
        let k = usize::try_from(k)
            .map_err(|_| EpimeterError::Corruption(format!("k={} out of range", k)))?;

        Ok(Self {
            magic,
            version_major,
            version_minor,
            k,
            alphabet_size: read_u32(reader)?,
            num_items: read_u64(reader)?,
            num_trees: read_u32(reader)?,
            leaf_size: read_u32(reader)?,
        })
    }
}

/// Path of the shard file for `k` inside `dir`
pub fn shard_file_path<P: AsRef<Path>>(dir: P, k: usize) -> PathBuf {
    dir.as_ref().join(format!("{}.{}", k, SHARD_FILE_EXTENSION))
}

/// Path of the substitution matrix file inside `dir`
pub fn scores_file_path<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(SCORES_FILE_NAME)
}

/// Path of the weights file inside `dir`
pub fn weights_file_path<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(WEIGHTS_FILE_NAME)
}

/// Serialize a built shard
pub fn write_shard<W: Write>(writer: &mut W, shard: &ShardIndex) -> io::Result<()> {
    ShardSerializationHeader::new(shard).write(writer)?;

    for id in shard.item_ids() {
        writer.write_all(&id.to_le_bytes())?;
    }
    writer.write_all(shard.vectors())?;

    for tree in shard.forest() {
        writer.write_all(&(tree.nodes.len() as u32).to_le_bytes())?;
        writer.write_all(&tree.root.to_le_bytes())?;
        for node in &tree.nodes {
            match node {
                Node::Leaf { items } => {
                    writer.write_all(&[TAG_LEAF])?;
                    writer.write_all(&(items.len() as u32).to_le_bytes())?;
                    for item in items {
                        writer.write_all(&item.to_le_bytes())?;
                    }
                }
                Node::Split { refs, children } => {
                    writer.write_all(&[TAG_SPLIT])?;
                    for value in refs.iter().chain(children) {
                        writer.write_all(&value.to_le_bytes())?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Deserialize a shard, checking it holds `expected_k`-mers encoded with
/// `metric`'s alphabet
pub fn read_shard(data: &[u8], expected_k: usize, metric: Arc<SubstitutionMetric>) -> Result<ShardIndex> {
    let mut reader = data;
    let header = ShardSerializationHeader::read(&mut reader)?;

    if header.k != expected_k {
        return Err(EpimeterError::Corruption(format!(
            "shard holds k={}, expected k={}",
            header.k, expected_k
        )));
    }
    let alphabet_size = metric.alphabet().len();
    if header.alphabet_size as usize != alphabet_size {
        return Err(EpimeterError::Corruption(format!(
            "shard encoded with {} symbols, alphabet has {}",
            header.alphabet_size, alphabet_size
        )));
    }

    // reject sizes the remaining bytes cannot possibly hold before allocating
    let num_items = usize::try_from(header.num_items)
        .ok()
        .filter(|&n| n <= u32::MAX as usize)
        .and_then(|n| {
            let row = header.k.checked_add(8)?;
            n.checked_mul(row).map(|bytes| (n, bytes))
        })
        .filter(|&(_, bytes)| bytes <= reader.len())
        .map(|(n, _)| n)
        .ok_or_else(|| {
            EpimeterError::Corruption(format!("item count {} exceeds file size", header.num_items))
        })?;

    let mut item_ids = Vec::with_capacity(num_items);
    for _ in 0..num_items {
        item_ids.push(read_u64(&mut reader)?);
    }
    let mut vectors = vec![0u8; num_items * header.k];
    reader.read_exact(&mut vectors).map_err(truncated)?;
    if let Some(&bad) = vectors.iter().find(|&&s| s as usize >= alphabet_size) {
        return Err(EpimeterError::Corruption(format!(
            "symbol index {} outside alphabet of {}",
            bad, alphabet_size
        )));
    }

    let mut forest = Vec::with_capacity(header.num_trees.min(1024) as usize);
    for _ in 0..header.num_trees {
        forest.push(read_tree(&mut reader, num_items as u32)?);
    }

    if !reader.is_empty() {
        return Err(EpimeterError::Corruption(format!(
            "{} trailing bytes after last tree",
            reader.len()
        )));
    }
    if num_items == 0 || forest.is_empty() {
        return Err(EpimeterError::Corruption(format!(
            "shard k={} holds no items or no trees",
            header.k
        )));
    }

    ShardIndex::from_parts(
        header.k,
        metric,
        item_ids,
        vectors,
        forest,
        header.leaf_size as usize,
    )
}

fn read_tree(reader: &mut &[u8], num_items: u32) -> Result<Tree> {
    let num_nodes = read_u32(reader)?;
    let root = read_u32(reader)?;
    // every node takes at least 5 bytes
    if num_nodes == 0 || num_nodes as usize > reader.len() / 5 || root >= num_nodes {
        return Err(EpimeterError::Corruption(format!(
            "tree with {} nodes and root {} is malformed",
            num_nodes, root
        )));
    }

    let check_item = |item: u32| {
        if item < num_items {
            Ok(item)
        } else {
            Err(EpimeterError::Corruption(format!("item slot {} out of range", item)))
        }
    };
    let check_node = |node: u32| {
        if node < num_nodes {
            Ok(node)
        } else {
            Err(EpimeterError::Corruption(format!("node {} out of range", node)))
        }
    };

    let mut nodes = Vec::with_capacity(num_nodes as usize);
    for _ in 0..num_nodes {
        let node = match read_u8(reader)? {
            TAG_LEAF => {
                let len = read_u32(reader)? as usize;
                if len > reader.len() / 4 {
                    return Err(truncated(io::ErrorKind::UnexpectedEof.into()));
                }
                let items = (0..len)
                    .map(|_| read_u32(reader).and_then(check_item))
                    .collect::<Result<Vec<u32>>>()?;
                Node::Leaf { items }
            }
            TAG_SPLIT => {
                let refs = [check_item(read_u32(reader)?)?, check_item(read_u32(reader)?)?];
                let children = [check_node(read_u32(reader)?)?, check_node(read_u32(reader)?)?];
                Node::Split { refs, children }
            }
            tag => {
                return Err(EpimeterError::Corruption(format!("unknown node tag {}", tag)));
            }
        };
        nodes.push(node);
    }

    let tree = Tree { nodes, root };
    tree.validate(num_items as usize)?;
    Ok(tree)
}

/// Write a built shard to its file in `dir`
pub fn save_shard<P: AsRef<Path>>(dir: P, shard: &ShardIndex) -> Result<PathBuf> {
    let path = shard_file_path(dir, shard.k());
    let mut writer = BufWriter::new(File::create(&path)?);
    write_shard(&mut writer, shard)?;
    writer.flush()?;
    Ok(path)
}

/// Load the shard for `k` from `dir`
///
/// # Errors
/// - `ShardNotFound` if `dir` has no shard file for `k`
/// - `Corruption` if the file is malformed or holds another k
pub fn load_shard<P: AsRef<Path>>(dir: P, k: usize, metric: Arc<SubstitutionMetric>) -> Result<ShardIndex> {
    let dir = dir.as_ref();
    let path = shard_file_path(dir, k);
    if !path.is_file() {
        return Err(EpimeterError::ShardNotFound {
            k,
            dir: dir.to_path_buf(),
        });
    }

    let file = File::open(&path)?;
    // SAFETY: index directories are immutable once saved; the map is
    // read-only and dropped before this function returns.
    let mmap = unsafe { Mmap::map(&file)? };
    read_shard(&mmap, k, metric)
}

/// Write the substitution configuration into `dir`
pub fn save_substitution<P: AsRef<Path>>(dir: P, metric: &SubstitutionMetric) -> Result<()> {
    let dir = dir.as_ref();
    let mut writer = BufWriter::new(File::create(scores_file_path(dir))?);
    metric.matrix().write_to(&mut writer)?;
    writer.flush()?;

    let weights_path = weights_file_path(dir);
    match metric.weights() {
        Some(weights) => {
            let mut writer = BufWriter::new(File::create(&weights_path)?);
            write_weights(&mut writer, weights)?;
            writer.flush()?;
        }
        // a stale weights file would silently change distances on load
        None if weights_path.is_file() => std::fs::remove_file(&weights_path)?,
        None => {}
    }
    Ok(())
}

/// Read the substitution configuration stored in `dir`
///
/// Files that are absent leave the matching part of `current` in place.
pub fn load_substitution<P: AsRef<Path>>(dir: P, current: &SubstitutionMetric) -> Result<SubstitutionMetric> {
    let dir = dir.as_ref();
    let scores_path = scores_file_path(dir);
    let mut metric = if scores_path.is_file() {
        SubstitutionMetric::new(SubstitutionMatrix::read_file(&scores_path)?)
    } else {
        current.clone()
    };

    let weights_path = weights_file_path(dir);
    if weights_path.is_file() {
        let weights = parse_weights(&std::fs::read_to_string(&weights_path)?)?;
        metric = metric.with_weights(weights)?;
    }
    Ok(metric)
}

fn truncated(err: io::Error) -> EpimeterError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        EpimeterError::Corruption("unexpected end of shard data".to_string())
    } else {
        EpimeterError::Io(err)
    }
}

fn read_u8(reader: &mut dyn Read) -> Result<u8> {
    let mut bytes = [0u8; 1];
    reader.read_exact(&mut bytes).map_err(truncated)?;
    Ok(bytes[0])
}

fn read_u32(reader: &mut dyn Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes).map_err(truncated)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut dyn Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes).map_err(truncated)?;
    Ok(u64::from_le_bytes(bytes))
}
