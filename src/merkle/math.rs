//! Merkle coordinate arithmetic
//!
//! The tree shape is a pure function of the leaf count. Level 0 holds the
//! leaves; each level above pairs neighbours left to right, and an odd
//! trailing node is promoted to the next level unchanged. For a tree of
//! `size` leaves, level `l` therefore has `((size - 1) >> l) + 1` nodes.
//!
//! ```text
//!  size = 5
//!
//!  level 3                 r
//!                     /         \
//!  level 2        (2,0)        (2,1)
//!                 /   \          |
//!  level 1    (1,0)  (1,1)     (1,2)
//!             /  \   /  \        |
//!  level 0   0    1 2    3       4
//! ```
//!
//! Nodes whose leaf range is fully populated and a power of two wide are the
//! perfect sub-trees ("sub-roots", Merkle-Mountain-Range peaks). Folding the
//! sub-roots right to left with `H(left || right)` yields the root.

use crate::error::{Result, StoreError};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MerkleCoordinate {
    pub level: u32,
    pub index: u64,
}

impl MerkleCoordinate {
    pub const fn new(level: u32, index: u64) -> Self {
        MerkleCoordinate { level, index }
    }

    pub const fn leaf(index: u64) -> Self {
        MerkleCoordinate { level: 0, index }
    }

    /// Root of a tree with `size` leaves (`size` must be non-zero)
    pub fn root(size: u64) -> Self {
        MerkleCoordinate {
            level: height(size).saturating_sub(1),
            index: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// True when `self` is `other` or one of its ancestors
    pub fn covers(&self, other: &MerkleCoordinate) -> bool {
        other.level <= self.level
            && other
                .index
                .checked_shr(self.level - other.level)
                .unwrap_or(0)
                == self.index
    }
}

/// Children of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerkleChildren {
    /// Leaf node
    None,
    /// Odd trailing node promoted from the level below
    Single(MerkleCoordinate),
    Pair(MerkleCoordinate, MerkleCoordinate),
}

/// Number of levels, leaves included (0 for an empty tree)
pub fn height(size: u64) -> u32 {
    if size == 0 {
        return 0;
    }
    64 - (size - 1).leading_zeros() + 1
}

/// Nodes on `level` of a tree with `size` leaves
pub fn level_len(size: u64, level: u32) -> u64 {
    if size == 0 || level >= height(size) {
        return 0;
    }
    ((size - 1) >> level) + 1
}

pub fn is_valid(size: u64, node: MerkleCoordinate) -> bool {
    node.index < level_len(size, node.level)
}

fn check(size: u64, node: MerkleCoordinate) -> Result<()> {
    if !is_valid(size, node) {
        return Err(StoreError::InvalidCoordinate {
            level: node.level,
            index: node.index,
            size,
        });
    }
    Ok(())
}

pub fn children(size: u64, node: MerkleCoordinate) -> Result<MerkleChildren> {
    check(size, node)?;
    if node.level == 0 {
        return Ok(MerkleChildren::None);
    }

    let left = MerkleCoordinate::new(node.level - 1, node.index * 2);
    let right = MerkleCoordinate::new(node.level - 1, node.index * 2 + 1);
    if is_valid(size, right) {
        Ok(MerkleChildren::Pair(left, right))
    } else {
        Ok(MerkleChildren::Single(left))
    }
}

/// Parent of a node, `None` for the root
pub fn parent(size: u64, node: MerkleCoordinate) -> Result<Option<MerkleCoordinate>> {
    check(size, node)?;
    if node.level + 1 >= height(size) {
        return Ok(None);
    }
    Ok(Some(MerkleCoordinate::new(node.level + 1, node.index / 2)))
}

/// Sibling of a node, `None` for the root and for promoted trailing nodes
pub fn sibling(size: u64, node: MerkleCoordinate) -> Result<Option<MerkleCoordinate>> {
    check(size, node)?;
    if node.level + 1 >= height(size) {
        return Ok(None);
    }
    let candidate = MerkleCoordinate::new(node.level, node.index ^ 1);
    Ok(is_valid(size, candidate).then_some(candidate))
}

/// Nodes from `leaf` up to the root, both included
pub fn path_to_root(size: u64, leaf: u64) -> Result<Vec<MerkleCoordinate>> {
    check(size, MerkleCoordinate::leaf(leaf))?;
    Ok((0..height(size))
        .map(|level| MerkleCoordinate::new(level, leaf >> level))
        .collect())
}

/// Perfect sub-trees of a tree with `size` leaves, left to right
pub fn sub_roots(size: u64) -> Vec<MerkleCoordinate> {
    let mut roots = Vec::with_capacity(size.count_ones() as usize);
    let mut offset = 0u64;
    for level in (0..64u32).rev() {
        let width = 1u64 << level;
        if size & width != 0 {
            roots.push(MerkleCoordinate::new(level, offset >> level));
            offset += width;
        }
    }
    roots
}

/// Leaves covered by a node
pub fn leaf_range(size: u64, node: MerkleCoordinate) -> Result<Range<u64>> {
    check(size, node)?;
    let start = node.index << node.level;
    let end = (node.index + 1)
        .checked_shl(node.level)
        .unwrap_or(u64::MAX)
        .min(size);
    Ok(start..end)
}
