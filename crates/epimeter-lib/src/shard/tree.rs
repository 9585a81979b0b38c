//! Reference-point partition trees
//!
//! Each internal node picks two distinct items of its bucket at random as
//! references and sends every other item to the reference it is closer to
//! under the substitution metric. Nodes become leaves once they hold at most
//! `leaf_size` items. Trees are stored as flat node arenas so they can be
//! written to disk without pointer chasing.

use crate::error::{EpimeterError, Result};
use crate::substitution::SubstitutionMetric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Tree node; item and node references are arena indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    /// Internal node: `children[i]` holds the items closer to `refs[i]`
    Split { refs: [u32; 2], children: [u32; 2] },
    /// Leaf bucket of item slots
    Leaf { items: Vec<u32> },
}

/// One partition tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: u32,
}

/// Read-only view over a shard's item vectors
#[derive(Clone, Copy)]
pub(crate) struct Items<'a> {
    pub(crate) vectors: &'a [u8],
    pub(crate) k: usize,
    pub(crate) metric: &'a SubstitutionMetric,
}

impl<'a> Items<'a> {
    #[inline]
    fn vector(&self, slot: u32) -> &'a [u8] {
        let start = slot as usize * self.k;
        &self.vectors[start..start + self.k]
    }

    #[inline]
    fn distance_to(&self, query: &[u8], slot: u32) -> f32 {
        self.metric.distance_unchecked(query, self.vector(slot))
    }

    fn len(&self) -> usize {
        self.vectors.len() / self.k
    }
}

impl Tree {
    /// Build one tree over every item of the shard
    pub(crate) fn build(items: Items<'_>, leaf_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut nodes = vec![Node::Leaf { items: Vec::new() }];
        let all: Vec<u32> = (0..items.len() as u32).collect();

        // explicit work stack; degenerate splits would otherwise recurse once per item
        let mut pending = vec![(0usize, all)];
        while let Some((slot, bucket)) = pending.pop() {
            if bucket.len() <= leaf_size {
                nodes[slot] = Node::Leaf { items: bucket };
                continue;
            }

            let (refs, [left, right]) = split(items, &bucket, &mut rng);
            let first = nodes.len();
            nodes.push(Node::Leaf { items: Vec::new() });
            nodes.push(Node::Leaf { items: Vec::new() });
            nodes[slot] = Node::Split {
                refs,
                children: [first as u32, first as u32 + 1],
            };
            pending.push((first, left));
            pending.push((first + 1, right));
        }

        Self { nodes, root: 0 }
    }

    /// Number of nodes in the arena
    pub(crate) fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Check that the arena is a tree rooted at `root` whose leaves hold
    /// every slot in `0..num_items` exactly once.
    ///
    /// Every node must be reachable exactly once from the root, which rules
    /// out cycles, shared subtrees and orphaned nodes.
    pub(crate) fn validate(&self, num_items: usize) -> Result<()> {
        let mut visited = vec![false; self.nodes.len()];
        let mut covered = vec![false; num_items];
        let mut stack = vec![self.root];

        while let Some(node) = stack.pop() {
            let seen = visited
                .get_mut(node as usize)
                .ok_or_else(|| corruption(format!("node {} out of range", node)))?;
            if std::mem::replace(seen, true) {
                return Err(corruption(format!("node {} reached twice", node)));
            }
            match &self.nodes[node as usize] {
                Node::Leaf { items } => {
                    for &item in items {
                        let slot = covered
                            .get_mut(item as usize)
                            .ok_or_else(|| corruption(format!("item slot {} out of range", item)))?;
                        if std::mem::replace(slot, true) {
                            return Err(corruption(format!("item slot {} in two leaves", item)));
                        }
                    }
                }
                Node::Split { children, .. } => stack.extend_from_slice(children),
            }
        }

        if let Some(node) = visited.iter().position(|&seen| !seen) {
            return Err(corruption(format!("node {} is unreachable", node)));
        }
        if let Some(item) = covered.iter().position(|&held| !held) {
            return Err(corruption(format!("item slot {} is in no leaf", item)));
        }
        Ok(())
    }
}

fn corruption(message: String) -> EpimeterError {
    EpimeterError::Corruption(format!("tree: {}", message))
}

/// Partition `bucket` (at least two items) around two random references.
///
/// Each reference stays on its own side, so both halves are non-empty and
/// strictly smaller than `bucket`.
fn split(items: Items<'_>, bucket: &[u32], rng: &mut StdRng) -> ([u32; 2], [Vec<u32>; 2]) {
    let i = rng.random_range(0..bucket.len());
    let mut j = rng.random_range(0..bucket.len() - 1);
    if j >= i {
        j += 1;
    }
    let refs = [bucket[i], bucket[j]];
    let ref_a = items.vector(refs[0]);
    let ref_b = items.vector(refs[1]);

    let mut left = Vec::with_capacity(bucket.len() / 2 + 1);
    let mut right = Vec::with_capacity(bucket.len() / 2 + 1);
    left.push(refs[0]);
    right.push(refs[1]);

    for (pos, &item) in bucket.iter().enumerate() {
        if pos == i || pos == j {
            continue;
        }
        let vector = items.vector(item);
        let da = items.metric.distance_unchecked(vector, ref_a);
        let db = items.metric.distance_unchecked(vector, ref_b);
        let go_left = match da.total_cmp(&db) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => rng.random_bool(0.5),
        };
        if go_left {
            left.push(item);
        } else {
            right.push(item);
        }
    }

    (refs, [left, right])
}

/// Node waiting in the best-first queue
struct Pending {
    priority: f32,
    tree: u32,
    node: u32,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Collect candidate item slots for `query` across the forest.
///
/// All trees share one priority queue. The side closer to the query keeps
/// its parent's priority; the farther side is capped at the negated distance
/// gap, so it is only explored once nearer branches run out. Stops once
/// `budget` slots were collected or every leaf has been visited. The result
/// may contain duplicates.
pub(crate) fn collect_candidates(
    forest: &[Tree],
    items: Items<'_>,
    query: &[u8],
    budget: usize,
) -> Vec<u32> {
    let mut heap = BinaryHeap::with_capacity(forest.len() * 2);
    for (t, tree) in forest.iter().enumerate() {
        heap.push(Pending {
            priority: f32::INFINITY,
            tree: t as u32,
            node: tree.root,
        });
    }

    let mut candidates = Vec::new();
    while candidates.len() < budget {
        let Some(top) = heap.pop() else {
            break;
        };
        match &forest[top.tree as usize].nodes[top.node as usize] {
            Node::Leaf { items: bucket } => candidates.extend_from_slice(bucket),
            Node::Split { refs, children } => {
                let da = items.distance_to(query, refs[0]);
                let db = items.distance_to(query, refs[1]);
                let gap = (db - da).abs();
                let (near, far) = if da <= db {
                    (children[0], children[1])
                } else {
                    (children[1], children[0])
                };
                heap.push(Pending {
                    priority: top.priority,
                    tree: top.tree,
                    node: near,
                });
                heap.push(Pending {
                    priority: top.priority.min(-gap),
                    tree: top.tree,
                    node: far,
                });
            }
        }
    }
    candidates
}
