//! Merkle tree store
//!
//! Keeps one leaf digest per collection item in a reserved stream and a flat
//! tree over them in memory. The tree is brought up to date lazily: appends
//! and in-place updates are patched along their paths, inserts and removes
//! rebuild it from the leaves.
//!
//! The root is cached in the `MERKLE_ROOT` header property when computed.
//! Leaves stay authoritative: attaching recomputes the root and fails on a
//! mismatch, and the first mutation after a persist clears the cached value.

use super::proofs::{self, Proof};
use super::tree::FlatMerkleTree;
use crate::container::{properties::MERKLE_ROOT, ClusterContainer};
use crate::error::{Result, StoreError};
use crate::events::{Mutation, MutationListener};
use crate::hashing::HashAlgorithm;
use crate::records::{RecordLayout, RecordStore};
use crate::storage::Storage;
use std::collections::BTreeSet;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Staleness {
    Fresh,
    /// Leaves below `appended_from` changed in place, later ones are new
    Patch {
        updated: BTreeSet<u64>,
        appended_from: u64,
    },
    Rebuild,
}

pub struct MerkleTreeStore {
    algorithm: HashAlgorithm,
    leaves: RecordStore,
    digests: Vec<Vec<u8>>,
    tree: FlatMerkleTree,
    staleness: Staleness,
    root_persisted: bool,
    attached: bool,
}

impl MerkleTreeStore {
    /// Store whose leaves live in reserved stream `anchor`
    pub fn new(algorithm: HashAlgorithm, anchor: u64) -> Self {
        MerkleTreeStore {
            algorithm,
            leaves: RecordStore::new(
                anchor,
                RecordLayout::Packed {
                    payload_size: algorithm.digest_size(),
                },
            ),
            digests: Vec::new(),
            tree: FlatMerkleTree::new(algorithm),
            staleness: Staleness::Fresh,
            root_persisted: false,
            attached: false,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn anchor(&self) -> u64 {
        self.leaves.anchor()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Number of leaves
    pub fn len(&self) -> u64 {
        self.digests.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn leaf(&self, index: u64) -> Result<&[u8]> {
        self.check_attached()?;
        self.digests
            .get(index as usize)
            .map(|d| d.as_slice())
            .ok_or(StoreError::IndexOutOfRange {
                index,
                count: self.len(),
            })
    }

    /// Digest recorded for an item's serialized bytes
    pub fn leaf_digest(&self, bytes: &[u8]) -> Vec<u8> {
        self.algorithm.hash(bytes)
    }

    /// Current tree, brought up to date
    pub fn tree(&mut self) -> Result<&FlatMerkleTree> {
        self.check_attached()?;
        self.refresh()?;
        Ok(&self.tree)
    }

    /// Root over the current leaves; persisted as the cached root
    pub fn root<S: Storage>(&mut self, c: &mut ClusterContainer<S>) -> Result<Option<Vec<u8>>> {
        self.check_attached()?;
        c.with_access_scope(|c| {
            self.refresh()?;
            let root = self.tree.root().map(|r| r.to_vec());
            if !self.root_persisted {
                c.write_property(&MERKLE_ROOT, &root)?;
                self.root_persisted = true;
            }
            Ok(root)
        })
    }

    pub fn existence_proof(&mut self, index: u64) -> Result<Proof> {
        proofs::generate_existence_proof(self.tree()?, index)
    }

    pub fn contains_proof(&mut self, indices: &[u64]) -> Result<Proof> {
        proofs::generate_contains_proof(self.tree()?, indices)
    }

    pub fn update_proof(&mut self, indices: &[u64]) -> Result<Proof> {
        proofs::generate_update_proof(self.tree()?, indices)
    }

    pub fn consistency_proof(&mut self, old_size: u64) -> Result<Proof> {
        proofs::generate_consistency_proof(self.tree()?, old_size)
    }

    pub fn append_proof(&mut self, old_size: u64) -> Result<Proof> {
        proofs::generate_append_proof(self.tree()?, old_size)
    }

    pub fn delete_proof(&mut self, count: u64) -> Result<Proof> {
        proofs::generate_delete_proof(self.tree()?, count)
    }

    fn check_attached(&self) -> Result<()> {
        if !self.attached {
            return Err(StoreError::Detached);
        }
        Ok(())
    }

    /// Bring the tree up to date; a failed patch leaves it marked for a
    /// full rebuild
    fn refresh(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.staleness, Staleness::Rebuild) {
            Staleness::Fresh => {}
            Staleness::Patch {
                updated,
                appended_from,
            } => {
                for index in updated {
                    self.tree.update_leaf(index, &self.digests[index as usize])?;
                }
                for digest in &self.digests[appended_from as usize..] {
                    self.tree.push_leaf(digest)?;
                }
            }
            Staleness::Rebuild => {
                debug!("Rebuilding Merkle tree over {} leaves", self.digests.len());
                self.tree = FlatMerkleTree::from_leaves(self.algorithm, &self.digests)?;
            }
        }
        self.staleness = Staleness::Fresh;
        Ok(())
    }

    fn mark_appended(&mut self) {
        if self.staleness == Staleness::Fresh {
            self.staleness = Staleness::Patch {
                updated: BTreeSet::new(),
                appended_from: self.tree.size(),
            };
        }
    }

    fn mark_updated(&mut self, index: u64) {
        let size = self.tree.size();
        match &mut self.staleness {
            Staleness::Fresh => {
                self.staleness = Staleness::Patch {
                    updated: BTreeSet::from([index]),
                    appended_from: size,
                };
            }
            Staleness::Patch {
                updated,
                appended_from,
            } => {
                if index < *appended_from {
                    updated.insert(index);
                }
            }
            Staleness::Rebuild => {}
        }
    }

    fn forget_root<S: Storage>(&mut self, c: &mut ClusterContainer<S>) -> Result<()> {
        if self.root_persisted {
            c.write_property(&MERKLE_ROOT, &None)?;
            self.root_persisted = false;
        }
        Ok(())
    }

    fn push<S: Storage>(&mut self, c: &mut ClusterContainer<S>, index: u64, digest: Vec<u8>) -> Result<()> {
        if index != self.len() {
            return Err(StoreError::InvalidArgument(format!(
                "append at {} to {} leaves",
                index,
                self.len()
            )));
        }
        self.leaves.push(c, Some(&digest))?;
        self.digests.push(digest);
        self.mark_appended();
        Ok(())
    }

    fn replace<S: Storage>(&mut self, c: &mut ClusterContainer<S>, index: u64, digest: Vec<u8>) -> Result<()> {
        self.leaves.update(c, index, Some(&digest))?;
        self.digests[index as usize] = digest;
        self.mark_updated(index);
        Ok(())
    }
}

impl<T, S: Storage> MutationListener<T, S> for MerkleTreeStore {
    fn attach(&mut self, c: &mut ClusterContainer<S>, item_count: u64) -> Result<bool> {
        let mut digests = Vec::new();
        for (index, leaf) in self.leaves.read_all(c)?.into_iter().enumerate() {
            match leaf {
                Some(digest) => digests.push(digest),
                None => {
                    return Err(StoreError::Corruption(format!(
                        "Merkle leaf {} is missing",
                        index
                    )))
                }
            }
        }

        self.tree = FlatMerkleTree::from_leaves(self.algorithm, &digests)?;
        self.digests = digests;
        self.staleness = Staleness::Fresh;
        self.attached = true;

        let persisted: Option<Vec<u8>> = c.read_property(&MERKLE_ROOT)?;
        self.root_persisted = persisted.is_some();
        if let Some(persisted) = persisted {
            if Some(persisted.as_slice()) != self.tree.root() {
                error!("Persisted Merkle root does not match the leaves");
                return Err(StoreError::Corruption(
                    "persisted Merkle root does not match the leaves".into(),
                ));
            }
        }

        debug!(
            "Attached Merkle store: {} leaves for {} items",
            self.len(),
            item_count
        );
        Ok(self.len() == item_count)
    }

    fn detach(&mut self) {
        self.digests.clear();
        self.tree = FlatMerkleTree::new(self.algorithm);
        self.staleness = Staleness::Fresh;
        self.attached = false;
    }

    fn anchor_stream(&self) -> Option<u64> {
        Some(self.leaves.anchor())
    }

    fn validate(&self, _mutation: &Mutation<'_, T>) -> Result<()> {
        self.check_attached()
    }

    fn notify(&mut self, c: &mut ClusterContainer<S>, mutation: &Mutation<'_, T>) -> Result<()> {
        self.check_attached()?;
        if matches!(mutation, Mutation::Clearing) {
            return Ok(());
        }
        self.forget_root(c)?;

        match mutation {
            Mutation::Add { index, bytes, .. } => self.push(c, *index, self.algorithm.hash(bytes)),
            Mutation::AddReaped { index } => self.push(c, *index, self.algorithm.zero_digest()),
            Mutation::Update { index, bytes, .. } => {
                self.replace(c, *index, self.algorithm.hash(bytes))
            }
            Mutation::Reap { index } => self.replace(c, *index, self.algorithm.zero_digest()),
            Mutation::Insert { index, bytes, .. } => {
                let digest = self.algorithm.hash(bytes);
                self.leaves.insert(c, *index, Some(&digest))?;
                self.digests.insert(*index as usize, digest);
                self.staleness = Staleness::Rebuild;
                Ok(())
            }
            Mutation::Remove { index } => {
                self.leaves.remove(c, *index)?;
                self.digests.remove(*index as usize);
                self.staleness = Staleness::Rebuild;
                Ok(())
            }
            Mutation::Cleared => {
                self.leaves.clear(c)?;
                self.digests.clear();
                self.tree = FlatMerkleTree::new(self.algorithm);
                self.staleness = Staleness::Fresh;
                Ok(())
            }
            Mutation::Clearing => Ok(()),
        }
    }
}
