//! In-memory flat Merkle tree
//!
//! Every level is kept as one contiguous buffer of digests. Appending a leaf
//! or replacing one only recomputes the path from that leaf to the root.

use super::math::{self, MerkleChildren, MerkleCoordinate};
use crate::error::{Result, StoreError};
use crate::hashing::HashAlgorithm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatMerkleTree {
    algorithm: HashAlgorithm,
    size: u64,
    levels: Vec<Vec<u8>>,
}

impl FlatMerkleTree {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        FlatMerkleTree {
            algorithm,
            size: 0,
            levels: Vec::new(),
        }
    }

    /// Build a tree from leaf digests in one pass
    pub fn from_leaves<I, L>(algorithm: HashAlgorithm, leaves: I) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        let digest_size = algorithm.digest_size();
        let mut base = Vec::new();
        for leaf in leaves {
            let leaf = leaf.as_ref();
            check_digest(digest_size, leaf)?;
            base.extend_from_slice(leaf);
        }

        let size = (base.len() / digest_size) as u64;
        let mut levels = Vec::with_capacity(math::height(size) as usize);
        if size > 0 {
            levels.push(base);
        }
        while let Some(below) = levels.last() {
            let count = below.len() / digest_size;
            if count <= 1 {
                break;
            }
            let mut level = Vec::with_capacity(count.div_ceil(2) * digest_size);
            for pair in below.chunks(digest_size * 2) {
                if pair.len() == digest_size * 2 {
                    level.extend_from_slice(
                        &algorithm.hash_pair(&pair[..digest_size], &pair[digest_size..]),
                    );
                } else {
                    level.extend_from_slice(pair);
                }
            }
            levels.push(level);
        }

        Ok(FlatMerkleTree {
            algorithm,
            size,
            levels,
        })
    }

    /// Hash raw items with the tree's algorithm and build the tree
    pub fn from_items<I, L>(algorithm: HashAlgorithm, items: I) -> Result<Self>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        Self::from_leaves(
            algorithm,
            items.into_iter().map(|item| algorithm.hash(item.as_ref())),
        )
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn height(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn node(&self, node: MerkleCoordinate) -> Result<&[u8]> {
        if !math::is_valid(self.size, node) {
            return Err(StoreError::InvalidCoordinate {
                level: node.level,
                index: node.index,
                size: self.size,
            });
        }
        let digest_size = self.algorithm.digest_size();
        let start = node.index as usize * digest_size;
        Ok(&self.levels[node.level as usize][start..start + digest_size])
    }

    pub fn leaf(&self, index: u64) -> Result<&[u8]> {
        self.node(MerkleCoordinate::leaf(index))
    }

    /// Root digest, `None` for an empty tree
    pub fn root(&self) -> Option<&[u8]> {
        if self.size == 0 {
            return None;
        }
        self.node(MerkleCoordinate::root(self.size)).ok()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &[u8]> {
        self.levels
            .first()
            .map(|level| level.as_slice())
            .unwrap_or(&[])
            .chunks_exact(self.algorithm.digest_size())
    }

    pub fn push_leaf(&mut self, digest: &[u8]) -> Result<()> {
        check_digest(self.algorithm.digest_size(), digest)?;
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].extend_from_slice(digest);
        self.size += 1;
        self.refresh_path(self.size - 1)
    }

    pub fn update_leaf(&mut self, index: u64, digest: &[u8]) -> Result<()> {
        check_digest(self.algorithm.digest_size(), digest)?;
        let digest_size = self.algorithm.digest_size();
        let start = self.node_offset(MerkleCoordinate::leaf(index))?;
        self.levels[0][start..start + digest_size].copy_from_slice(digest);
        self.refresh_path(index)
    }

    /// Tree over the first `size` leaves
    pub fn prefix(&self, size: u64) -> Result<Self> {
        if size > self.size {
            return Err(StoreError::InvalidArgument(format!(
                "prefix of {} leaves from a tree of {}",
                size, self.size
            )));
        }
        Self::from_leaves(self.algorithm, self.leaves().take(size as usize))
    }

    fn node_offset(&self, node: MerkleCoordinate) -> Result<usize> {
        self.node(node)?;
        Ok(node.index as usize * self.algorithm.digest_size())
    }

    /// Recompute every ancestor of `leaf`, growing levels as needed
    fn refresh_path(&mut self, leaf: u64) -> Result<()> {
        let digest_size = self.algorithm.digest_size();
        let height = math::height(self.size);

        for level in 1..height {
            if self.levels.len() <= level as usize {
                self.levels.push(Vec::new());
            }
            let node = MerkleCoordinate::new(level, leaf >> level);
            let digest = match math::children(self.size, node)? {
                MerkleChildren::Pair(left, right) => self
                    .algorithm
                    .hash_pair(self.node(left)?, self.node(right)?),
                MerkleChildren::Single(child) => self.node(child)?.to_vec(),
                MerkleChildren::None => continue,
            };

            let start = node.index as usize * digest_size;
            let level = &mut self.levels[level as usize];
            if level.len() < start + digest_size {
                level.resize(start + digest_size, 0);
            }
            level[start..start + digest_size].copy_from_slice(&digest);
        }
        Ok(())
    }
}

fn check_digest(digest_size: usize, digest: &[u8]) -> Result<()> {
    if digest.len() != digest_size {
        return Err(StoreError::InvalidArgument(format!(
            "leaf digest of {} bytes, algorithm produces {}",
            digest.len(),
            digest_size
        )));
    }
    Ok(())
}

/// Fold sub-root digests right to left into a root
pub fn bag_sub_roots<D: AsRef<[u8]>>(algorithm: HashAlgorithm, sub_roots: &[D]) -> Option<Vec<u8>> {
    let (last, rest) = sub_roots.split_last()?;
    Some(
        rest.iter()
            .rev()
            .fold(last.as_ref().to_vec(), |acc, peak| {
                algorithm.hash_pair(peak.as_ref(), &acc)
            }),
    )
}
