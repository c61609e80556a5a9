//! Benchmarks for Merkle tree construction and proofs

use clustered_streams::merkle::proofs::{
    generate_consistency_proof, generate_existence_proof, verify_consistency_proof,
    verify_existence_proof,
};
use clustered_streams::{FlatMerkleTree, HashAlgorithm};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn leaves(algorithm: HashAlgorithm, count: u64) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| algorithm.hash(&i.to_le_bytes()))
        .collect()
}

fn benchmark_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_build");

    for size in [1_000u64, 10_000, 100_000].iter() {
        let leaves = leaves(HashAlgorithm::Sha256, *size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &leaves, |b, leaves| {
            b.iter(|| FlatMerkleTree::from_leaves(HashAlgorithm::Sha256, black_box(leaves)).unwrap());
        });
    }

    group.finish();
}

fn benchmark_incremental(c: &mut Criterion) {
    let algorithm = HashAlgorithm::Sha256;
    let mut tree = FlatMerkleTree::from_leaves(algorithm, &leaves(algorithm, 10_000)).unwrap();
    let digest = algorithm.hash(b"updated");

    c.bench_function("merkle_update_leaf_10k", |b| {
        let mut index = 0u64;
        b.iter(|| {
            tree.update_leaf(index % 10_000, &digest).unwrap();
            index += 7919;
            black_box(tree.root());
        });
    });

    c.bench_function("merkle_push_leaf", |b| {
        let mut tree = FlatMerkleTree::new(algorithm);
        b.iter(|| {
            tree.push_leaf(&digest).unwrap();
            black_box(tree.root());
        });
    });
}

fn benchmark_proofs(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_proofs");

    for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Sha512].iter() {
        let all = leaves(*algorithm, 10_000);
        let tree = FlatMerkleTree::from_leaves(*algorithm, &all).unwrap();
        let root = tree.root().unwrap().to_vec();
        let old = tree.prefix(6_000).unwrap();
        let old_root = old.root().unwrap().to_vec();
        let name = format!("{:?}", algorithm);

        group.bench_function(BenchmarkId::new("existence", &name), |b| {
            b.iter(|| {
                let proof = generate_existence_proof(&tree, 4_321).unwrap();
                assert!(verify_existence_proof(*algorithm, &root, 10_000, 4_321, &all[4_321], &proof));
            });
        });

        group.bench_function(BenchmarkId::new("consistency", &name), |b| {
            b.iter(|| {
                let proof = generate_consistency_proof(&tree, 6_000).unwrap();
                assert!(verify_consistency_proof(
                    *algorithm, &old_root, 6_000, &root, 10_000, &proof
                ));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_build, benchmark_incremental, benchmark_proofs);
criterion_main!(benches);
