//! Merkle proof soundness tests
//!
//! Trees are built over the letters A..Z; every proof must verify untouched
//! and fail once any single byte of it is flipped.

use clustered_streams::merkle::proofs::{
    generate_append_proof, generate_consistency_proof, generate_contains_proof,
    generate_delete_proof, generate_existence_proof, generate_update_proof, verify_append_proof,
    verify_consistency_proof, verify_contains_proof, verify_delete_proof, verify_existence_proof,
    verify_update_proof,
};
use clustered_streams::{FlatMerkleTree, HashAlgorithm};

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn alphabet_tree(algorithm: HashAlgorithm, size: usize) -> FlatMerkleTree {
    FlatMerkleTree::from_items(algorithm, ALPHABET[..size].chunks(1)).unwrap()
}

/// Every copy of `proof` with one byte flipped
fn tampered(proof: &[Vec<u8>]) -> impl Iterator<Item = Vec<Vec<u8>>> + '_ {
    proof.iter().enumerate().flat_map(move |(i, digest)| {
        (0..digest.len()).map(move |byte| {
            let mut copy = proof.to_vec();
            copy[i][byte] ^= 0x01;
            copy
        })
    })
}

#[test]
fn test_existence_proofs_over_alphabet() {
    for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
        let tree = alphabet_tree(algorithm, 26);
        let root = tree.root().unwrap();

        for (index, letter) in ALPHABET.iter().enumerate() {
            let index = index as u64;
            let leaf = algorithm.hash(&[*letter]);
            let proof = generate_existence_proof(&tree, index).unwrap();
            assert!(verify_existence_proof(algorithm, root, 26, index, &leaf, &proof));

            for forged in tampered(&proof) {
                assert!(!verify_existence_proof(algorithm, root, 26, index, &leaf, &forged));
            }

            let mut forged_leaf = leaf.clone();
            forged_leaf[0] ^= 0x80;
            assert!(!verify_existence_proof(algorithm, root, 26, index, &forged_leaf, &proof));

            let mut short = proof.clone();
            if short.pop().is_some() {
                assert!(!verify_existence_proof(algorithm, root, 26, index, &leaf, &short));
            }
        }
    }
}

#[test]
fn test_existence_proof_wrong_size_fails() {
    let algorithm = HashAlgorithm::Sha256;
    let tree = alphabet_tree(algorithm, 26);
    let proof = generate_existence_proof(&tree, 25).unwrap();
    let leaf = algorithm.hash(b"Z");
    assert!(!verify_existence_proof(algorithm, tree.root().unwrap(), 27, 25, &leaf, &proof));
    assert!(!verify_existence_proof(algorithm, tree.root().unwrap(), 26, 26, &leaf, &proof));
}

#[test]
fn test_consistency_proofs_all_pairs() {
    let algorithm = HashAlgorithm::Sha256;
    let trees: Vec<FlatMerkleTree> = (0..=26).map(|n| alphabet_tree(algorithm, n)).collect();

    for new_size in 1..=26usize {
        let new = &trees[new_size];
        for old_size in 1..=new_size {
            let old = &trees[old_size];
            let proof = generate_consistency_proof(new, old_size as u64).unwrap();
            assert!(
                verify_consistency_proof(
                    algorithm,
                    old.root().unwrap(),
                    old_size as u64,
                    new.root().unwrap(),
                    new_size as u64,
                    &proof
                ),
                "{} -> {}",
                old_size,
                new_size
            );

            if old_size < new_size {
                let wrong_old = &trees[old_size + 1];
                assert!(!verify_consistency_proof(
                    algorithm,
                    wrong_old.root().unwrap(),
                    old_size as u64,
                    new.root().unwrap(),
                    new_size as u64,
                    &proof
                ));
            }
        }
    }
}

#[test]
fn test_consistency_proof_tampering() {
    let algorithm = HashAlgorithm::Sha256;
    let old = alphabet_tree(algorithm, 11);
    let new = alphabet_tree(algorithm, 26);
    let proof = generate_consistency_proof(&new, 11).unwrap();

    for forged in tampered(&proof) {
        assert!(!verify_consistency_proof(
            algorithm,
            old.root().unwrap(),
            11,
            new.root().unwrap(),
            26,
            &forged
        ));
    }
}

#[test]
fn test_append_and_delete_proofs() {
    let algorithm = HashAlgorithm::Sha384;
    let full = alphabet_tree(algorithm, 26);

    for old_size in 0..26u64 {
        let old = alphabet_tree(algorithm, old_size as usize);
        let appended: Vec<Vec<u8>> = ALPHABET[old_size as usize..]
            .iter()
            .map(|letter| algorithm.hash(&[*letter]))
            .collect();
        let proof = generate_append_proof(&full, old_size).unwrap();
        assert!(verify_append_proof(
            algorithm,
            old.root(),
            old_size,
            &appended,
            full.root().unwrap(),
            &proof
        ));

        if old_size > 0 {
            let count = 26 - old_size;
            let proof = generate_delete_proof(&full, count).unwrap();
            assert!(verify_delete_proof(
                algorithm,
                full.root().unwrap(),
                26,
                count,
                old.root().unwrap(),
                &proof
            ));
        }
    }
}

#[test]
fn test_contains_and_update_proofs() {
    let algorithm = HashAlgorithm::Sha256;
    let old = alphabet_tree(algorithm, 26);
    let indices = [0u64, 7, 8, 25];

    let leaves: Vec<(u64, Vec<u8>)> = indices
        .iter()
        .map(|i| (*i, old.leaf(*i).unwrap().to_vec()))
        .collect();
    let proof = generate_contains_proof(&old, &indices).unwrap();
    assert!(verify_contains_proof(algorithm, old.root().unwrap(), 26, &leaves, &proof));
    for forged in tampered(&proof) {
        assert!(!verify_contains_proof(algorithm, old.root().unwrap(), 26, &leaves, &forged));
    }

    let mut new = old.clone();
    let mut updates = Vec::new();
    for index in indices {
        let digest = algorithm.hash(format!("updated-{}", index).as_bytes());
        new.update_leaf(index, &digest).unwrap();
        updates.push((index, old.leaf(index).unwrap().to_vec(), digest));
    }
    let proof = generate_update_proof(&new, &indices).unwrap();
    assert!(verify_update_proof(
        algorithm,
        old.root().unwrap(),
        new.root().unwrap(),
        26,
        &updates,
        &proof
    ));

    updates[1].2 = algorithm.hash(b"something else");
    assert!(!verify_update_proof(
        algorithm,
        old.root().unwrap(),
        new.root().unwrap(),
        26,
        &updates,
        &proof
    ));
}
