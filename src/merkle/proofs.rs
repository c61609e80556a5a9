//! Proof generation and verification
//!
//! All proofs are flat lists of digests. Verifiers never trust the shape of
//! the proof: they rebuild the claimed root from the tree size, the values
//! they already know and the proof digests, and require the whole proof to
//! be consumed.
//!
//! Multi-node proofs (contains, update, append, consistency) share one
//! encoding: walking the tree depth-first from the root, left before right,
//! every maximal sub-tree holding none of the known nodes contributes its
//! digest.

use super::math::{self, MerkleChildren, MerkleCoordinate};
use super::tree::{bag_sub_roots, FlatMerkleTree};
use crate::error::{Result, StoreError};
use crate::hashing::HashAlgorithm;
use std::collections::{BTreeMap, BTreeSet};

pub type Proof = Vec<Vec<u8>>;

// -------------------------------------------------------------------------
// Existence
// -------------------------------------------------------------------------

/// Sibling digests from `leaf` up to the root
///
/// Levels where the path node is a promoted trailing node have no sibling
/// and contribute nothing.
pub fn generate_existence_proof(tree: &FlatMerkleTree, leaf: u64) -> Result<Proof> {
    let size = tree.size();
    let mut proof = Vec::new();
    for node in math::path_to_root(size, leaf)? {
        if let Some(sibling) = math::sibling(size, node)? {
            proof.push(tree.node(sibling)?.to_vec());
        }
    }
    Ok(proof)
}

pub fn verify_existence_proof(
    algorithm: HashAlgorithm,
    root: &[u8],
    size: u64,
    leaf: u64,
    leaf_digest: &[u8],
    proof: &[Vec<u8>],
) -> bool {
    let digest_size = algorithm.digest_size();
    if leaf >= size || leaf_digest.len() != digest_size {
        return false;
    }

    let mut acc = leaf_digest.to_vec();
    let mut siblings = proof.iter();
    let mut index = leaf;
    for level in 0..math::height(size).saturating_sub(1) {
        let sibling = index ^ 1;
        if sibling < math::level_len(size, level) {
            let Some(digest) = siblings.next() else {
                return false;
            };
            if digest.len() != digest_size {
                return false;
            }
            acc = if index % 2 == 0 {
                algorithm.hash_pair(&acc, digest)
            } else {
                algorithm.hash_pair(digest, &acc)
            };
        }
        index >>= 1;
    }

    siblings.next().is_none() && acc == root
}

// -------------------------------------------------------------------------
// Multi-node proofs
// -------------------------------------------------------------------------

fn holds_known(node: MerkleCoordinate, known: &BTreeSet<MerkleCoordinate>) -> bool {
    known.iter().any(|k| node.covers(k))
}

fn collect_multi_proof(
    tree: &FlatMerkleTree,
    node: MerkleCoordinate,
    known: &BTreeSet<MerkleCoordinate>,
    proof: &mut Proof,
) -> Result<()> {
    if known.contains(&node) {
        return Ok(());
    }
    if !holds_known(node, known) {
        proof.push(tree.node(node)?.to_vec());
        return Ok(());
    }
    match math::children(tree.size(), node)? {
        MerkleChildren::Pair(left, right) => {
            collect_multi_proof(tree, left, known, proof)?;
            collect_multi_proof(tree, right, known, proof)
        }
        MerkleChildren::Single(child) => collect_multi_proof(tree, child, known, proof),
        MerkleChildren::None => Ok(()),
    }
}

fn generate_multi_proof(tree: &FlatMerkleTree, known: &BTreeSet<MerkleCoordinate>) -> Result<Proof> {
    if tree.is_empty() {
        return Err(StoreError::InvalidArgument("proof over an empty tree".into()));
    }
    for node in known {
        tree.node(*node)?;
    }
    let mut proof = Vec::new();
    collect_multi_proof(tree, MerkleCoordinate::root(tree.size()), known, &mut proof)?;
    Ok(proof)
}

fn compute_multi_root<'p>(
    algorithm: HashAlgorithm,
    size: u64,
    node: MerkleCoordinate,
    known: &BTreeMap<MerkleCoordinate, Vec<u8>>,
    proof: &mut impl Iterator<Item = &'p Vec<u8>>,
) -> Option<Vec<u8>> {
    if let Some(digest) = known.get(&node) {
        return Some(digest.clone());
    }
    if !known.keys().any(|k| node.covers(k)) {
        return proof
            .next()
            .filter(|d| d.len() == algorithm.digest_size())
            .cloned();
    }
    match math::children(size, node).ok()? {
        MerkleChildren::Pair(left, right) => {
            let left = compute_multi_root(algorithm, size, left, known, proof)?;
            let right = compute_multi_root(algorithm, size, right, known, proof)?;
            Some(algorithm.hash_pair(&left, &right))
        }
        MerkleChildren::Single(child) => compute_multi_root(algorithm, size, child, known, proof),
        MerkleChildren::None => None,
    }
}

/// Root implied by `known` node digests plus a multi-node proof
fn verify_multi_proof(
    algorithm: HashAlgorithm,
    root: &[u8],
    size: u64,
    known: &BTreeMap<MerkleCoordinate, Vec<u8>>,
    proof: &[Vec<u8>],
) -> bool {
    if size == 0 || known.is_empty() {
        return false;
    }
    for (node, digest) in known {
        if !math::is_valid(size, *node) || digest.len() != algorithm.digest_size() {
            return false;
        }
        // a known node inside another known node is ambiguous
        let mut ancestor = *node;
        while let Ok(Some(parent)) = math::parent(size, ancestor) {
            if known.contains_key(&parent) {
                return false;
            }
            ancestor = parent;
        }
    }

    let mut digests = proof.iter();
    let computed = compute_multi_root(
        algorithm,
        size,
        MerkleCoordinate::root(size),
        known,
        &mut digests,
    );
    digests.next().is_none() && computed.as_deref() == Some(root)
}

fn leaf_set(tree: &FlatMerkleTree, indices: &[u64]) -> Result<BTreeSet<MerkleCoordinate>> {
    if indices.is_empty() {
        return Err(StoreError::InvalidArgument("no leaf indices given".into()));
    }
    let mut known = BTreeSet::new();
    for index in indices {
        let node = MerkleCoordinate::leaf(*index);
        tree.node(node)?;
        known.insert(node);
    }
    Ok(known)
}

fn leaf_map<'a>(leaves: impl IntoIterator<Item = (u64, &'a [u8])>) -> Option<BTreeMap<MerkleCoordinate, Vec<u8>>> {
    let mut known = BTreeMap::new();
    for (index, digest) in leaves {
        if known
            .insert(MerkleCoordinate::leaf(index), digest.to_vec())
            .is_some()
        {
            return None;
        }
    }
    Some(known)
}

// -------------------------------------------------------------------------
// Contains
// -------------------------------------------------------------------------

/// Proof that the leaves at `indices` belong to the tree
pub fn generate_contains_proof(tree: &FlatMerkleTree, indices: &[u64]) -> Result<Proof> {
    generate_multi_proof(tree, &leaf_set(tree, indices)?)
}

/// `leaves` are `(index, leaf digest)` pairs
pub fn verify_contains_proof(
    algorithm: HashAlgorithm,
    root: &[u8],
    size: u64,
    leaves: &[(u64, Vec<u8>)],
    proof: &[Vec<u8>],
) -> bool {
    match leaf_map(leaves.iter().map(|(i, d)| (*i, d.as_slice()))) {
        Some(known) => verify_multi_proof(algorithm, root, size, &known, proof),
        None => false,
    }
}

// -------------------------------------------------------------------------
// Update
// -------------------------------------------------------------------------

/// Proof that replacing the leaves at `indices` turns one root into another
///
/// The proof only holds digests of sub-trees untouched by the update, so it
/// can be generated from the tree before or after the change.
pub fn generate_update_proof(tree: &FlatMerkleTree, indices: &[u64]) -> Result<Proof> {
    generate_contains_proof(tree, indices)
}

/// A single leaf replacement: `(index, old leaf digest, new leaf digest)`
pub type LeafUpdate = (u64, Vec<u8>, Vec<u8>);

pub fn verify_update_proof(
    algorithm: HashAlgorithm,
    old_root: &[u8],
    new_root: &[u8],
    size: u64,
    updates: &[LeafUpdate],
    proof: &[Vec<u8>],
) -> bool {
    let old = leaf_map(updates.iter().map(|(i, old, _)| (*i, old.as_slice())));
    let new = leaf_map(updates.iter().map(|(i, _, new)| (*i, new.as_slice())));
    match (old, new) {
        (Some(old), Some(new)) => {
            verify_multi_proof(algorithm, old_root, size, &old, proof)
                && verify_multi_proof(algorithm, new_root, size, &new, proof)
        }
        _ => false,
    }
}

// -------------------------------------------------------------------------
// Consistency
// -------------------------------------------------------------------------

/// Proof that the tree's first `old_size` leaves produced an earlier root
///
/// Layout: the sub-root digests of the old tree (left to right), followed by
/// the multi-node proof that rebuilds the current root from them.
pub fn generate_consistency_proof(tree: &FlatMerkleTree, old_size: u64) -> Result<Proof> {
    if old_size == 0 || old_size > tree.size() {
        return Err(StoreError::InvalidArgument(format!(
            "consistency proof from size {} in a tree of {}",
            old_size,
            tree.size()
        )));
    }

    let peaks: BTreeSet<MerkleCoordinate> = math::sub_roots(old_size).into_iter().collect();
    let mut proof = Vec::with_capacity(peaks.len());
    for peak in math::sub_roots(old_size) {
        proof.push(tree.node(peak)?.to_vec());
    }
    proof.extend(generate_multi_proof(tree, &peaks)?);
    Ok(proof)
}

pub fn verify_consistency_proof(
    algorithm: HashAlgorithm,
    old_root: &[u8],
    old_size: u64,
    new_root: &[u8],
    new_size: u64,
    proof: &[Vec<u8>],
) -> bool {
    if old_size == 0 || old_size > new_size {
        return false;
    }

    let peaks = math::sub_roots(old_size);
    if proof.len() < peaks.len() {
        return false;
    }
    let (peak_digests, rest) = proof.split_at(peaks.len());
    if peak_digests.iter().any(|d| d.len() != algorithm.digest_size()) {
        return false;
    }
    if bag_sub_roots(algorithm, peak_digests).as_deref() != Some(old_root) {
        return false;
    }

    let known: BTreeMap<MerkleCoordinate, Vec<u8>> =
        peaks.into_iter().zip(peak_digests.iter().cloned()).collect();
    verify_multi_proof(algorithm, new_root, new_size, &known, rest)
}

// -------------------------------------------------------------------------
// Append
// -------------------------------------------------------------------------

/// Proof that appending leaves to a tree of `old_size` leaves gives the
/// current root: the old sub-root digests
pub fn generate_append_proof(tree: &FlatMerkleTree, old_size: u64) -> Result<Proof> {
    if old_size > tree.size() {
        return Err(StoreError::InvalidArgument(format!(
            "append proof from size {} in a tree of {}",
            old_size,
            tree.size()
        )));
    }
    math::sub_roots(old_size)
        .into_iter()
        .map(|peak| tree.node(peak).map(|d| d.to_vec()))
        .collect()
}

/// `old_root` is `None` when appending to an empty tree
pub fn verify_append_proof(
    algorithm: HashAlgorithm,
    old_root: Option<&[u8]>,
    old_size: u64,
    appended: &[Vec<u8>],
    new_root: &[u8],
    proof: &[Vec<u8>],
) -> bool {
    let peaks = math::sub_roots(old_size);
    if proof.len() != peaks.len() {
        return false;
    }
    if proof.iter().any(|d| d.len() != algorithm.digest_size()) {
        return false;
    }
    if bag_sub_roots(algorithm, proof).as_deref() != old_root {
        return false;
    }

    let new_size = old_size + appended.len() as u64;
    let mut known: BTreeMap<MerkleCoordinate, Vec<u8>> =
        peaks.into_iter().zip(proof.iter().cloned()).collect();
    for (offset, leaf) in appended.iter().enumerate() {
        known.insert(MerkleCoordinate::leaf(old_size + offset as u64), leaf.clone());
    }
    verify_multi_proof(algorithm, new_root, new_size, &known, &[])
}

// -------------------------------------------------------------------------
// Delete
// -------------------------------------------------------------------------

/// Proof that dropping the last `count` leaves yields the truncated root
pub fn generate_delete_proof(tree: &FlatMerkleTree, count: u64) -> Result<Proof> {
    if count >= tree.size() {
        return Err(StoreError::InvalidArgument(format!(
            "cannot prove deletion of {} leaves from a tree of {}",
            count,
            tree.size()
        )));
    }
    generate_consistency_proof(tree, tree.size() - count)
}

pub fn verify_delete_proof(
    algorithm: HashAlgorithm,
    old_root: &[u8],
    old_size: u64,
    count: u64,
    new_root: &[u8],
    proof: &[Vec<u8>],
) -> bool {
    if count >= old_size {
        return false;
    }
    verify_consistency_proof(algorithm, new_root, old_size - count, old_root, old_size, proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALG: HashAlgorithm = HashAlgorithm::Sha256;

    fn tree(n: usize) -> FlatMerkleTree {
        FlatMerkleTree::from_items(ALG, (0..n).map(|i| format!("leaf-{}", i))).unwrap()
    }

    #[test]
    fn test_existence_small_trees() {
        for size in 1..20u64 {
            let tree = tree(size as usize);
            let root = tree.root().unwrap();
            for leaf in 0..size {
                let proof = generate_existence_proof(&tree, leaf).unwrap();
                let digest = tree.leaf(leaf).unwrap();
                assert!(verify_existence_proof(ALG, root, size, leaf, digest, &proof));
                assert!(!verify_existence_proof(ALG, root, size, leaf, &ALG.hash(b"x"), &proof));
            }
        }
    }

    #[test]
    fn test_consistency_between_sizes() {
        let new = tree(21);
        for old_size in 1..=21u64 {
            let old = tree(old_size as usize);
            let proof = generate_consistency_proof(&new, old_size).unwrap();
            assert!(
                verify_consistency_proof(ALG, old.root().unwrap(), old_size, new.root().unwrap(), 21, &proof),
                "old size {}",
                old_size
            );
        }

        let forged = tree(20);
        let proof = generate_consistency_proof(&new, 4).unwrap();
        assert!(!verify_consistency_proof(
            ALG,
            tree(4).root().unwrap(),
            4,
            forged.root().unwrap(),
            21,
            &proof
        ));
    }

    #[test]
    fn test_existence_proof_skips_bubbled_levels() {
        // leaf 4 of 5 only meets a sibling at the top level
        let tree = tree(5);
        let proof = generate_existence_proof(&tree, 4).unwrap();
        assert_eq!(proof.len(), 1);
        assert_eq!(proof[0], tree.node(MerkleCoordinate::new(2, 0)).unwrap());
    }

    #[test]
    fn test_existence_rejects_extra_digest() {
        let tree = tree(6);
        let mut proof = generate_existence_proof(&tree, 2).unwrap();
        proof.push(vec![0u8; 32]);
        assert!(!verify_existence_proof(
            ALG,
            tree.root().unwrap(),
            6,
            2,
            tree.leaf(2).unwrap(),
            &proof
        ));
    }

    #[test]
    fn test_contains_proof() {
        let tree = tree(13);
        let indices = [1u64, 2, 9, 12];
        let proof = generate_contains_proof(&tree, &indices).unwrap();
        let leaves: Vec<(u64, Vec<u8>)> = indices
            .iter()
            .map(|i| (*i, tree.leaf(*i).unwrap().to_vec()))
            .collect();
        assert!(verify_contains_proof(ALG, tree.root().unwrap(), 13, &leaves, &proof));

        let mut wrong = leaves.clone();
        wrong[2].1 = ALG.hash(b"not here");
        assert!(!verify_contains_proof(ALG, tree.root().unwrap(), 13, &wrong, &proof));

        assert!(generate_contains_proof(&tree, &[13]).is_err());
        assert!(generate_contains_proof(&tree, &[]).is_err());
    }

    #[test]
    fn test_update_proof() {
        let old = tree(10);
        let mut new = old.clone();
        new.update_leaf(3, &ALG.hash(b"three")).unwrap();
        new.update_leaf(8, &ALG.hash(b"eight")).unwrap();

        let proof = generate_update_proof(&new, &[3, 8]).unwrap();
        let updates = vec![
            (3, old.leaf(3).unwrap().to_vec(), ALG.hash(b"three")),
            (8, old.leaf(8).unwrap().to_vec(), ALG.hash(b"eight")),
        ];
        assert!(verify_update_proof(
            ALG,
            old.root().unwrap(),
            new.root().unwrap(),
            10,
            &updates,
            &proof
        ));
        assert!(!verify_update_proof(
            ALG,
            new.root().unwrap(),
            old.root().unwrap(),
            10,
            &updates,
            &proof
        ));
    }

    #[test]
    fn test_consistency_same_size() {
        let tree = tree(7);
        let proof = generate_consistency_proof(&tree, 7).unwrap();
        let root = tree.root().unwrap();
        assert!(verify_consistency_proof(ALG, root, 7, root, 7, &proof));
    }

    #[test]
    fn test_append_proof() {
        let old = tree(6);
        let new = tree(11);
        let appended: Vec<Vec<u8>> = (6..11).map(|i| new.leaf(i).unwrap().to_vec()).collect();
        let proof = generate_append_proof(&new, 6).unwrap();
        assert!(verify_append_proof(
            ALG,
            old.root(),
            6,
            &appended,
            new.root().unwrap(),
            &proof
        ));

        let mut tampered = appended.clone();
        tampered[0] = ALG.hash(b"forged");
        assert!(!verify_append_proof(
            ALG,
            old.root(),
            6,
            &tampered,
            new.root().unwrap(),
            &proof
        ));
    }

    #[test]
    fn test_append_to_empty() {
        let new = tree(3);
        let appended: Vec<Vec<u8>> = (0..3).map(|i| new.leaf(i).unwrap().to_vec()).collect();
        let proof = generate_append_proof(&new, 0).unwrap();
        assert!(proof.is_empty());
        assert!(verify_append_proof(ALG, None, 0, &appended, new.root().unwrap(), &proof));
    }

    #[test]
    fn test_delete_proof() {
        let full = tree(12);
        let truncated = full.prefix(9).unwrap();
        let proof = generate_delete_proof(&full, 3).unwrap();
        assert!(verify_delete_proof(
            ALG,
            full.root().unwrap(),
            12,
            3,
            truncated.root().unwrap(),
            &proof
        ));
        assert!(!verify_delete_proof(
            ALG,
            full.root().unwrap(),
            12,
            2,
            truncated.root().unwrap(),
            &proof
        ));
        assert!(generate_delete_proof(&full, 12).is_err());
    }
}
