//! Benchmarks for cluster container and collection throughput

use clustered_streams::{
    ClusterContainer, CollectionBuilder, ContainerConfig, HashAlgorithm, MemoryStorage,
    StreamMappedDictionary, StreamMappedList, StringSerializer, U64Serializer,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

fn container(cluster_size: u32, cache: usize) -> ClusterContainer<MemoryStorage> {
    ClusterContainer::create(
        MemoryStorage::new(),
        ContainerConfig {
            cluster_size,
            chain_cache_capacity: cache,
            ..ContainerConfig::default()
        },
    )
    .unwrap()
}

fn benchmark_write_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_write_stream");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        let data = vec![0x5Au8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let mut c = container(4096, 64);
                let id = c.create_stream().unwrap();
                c.write_stream(id, black_box(data)).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_random_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_random_read");

    // chain cache on and off
    for cache in [0usize, 64].iter() {
        let mut store = container(512, *cache);
        let id = store.create_stream().unwrap();
        store.write_stream(id, &vec![7u8; 512 * 1024]).unwrap();
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; 256];

        group.bench_with_input(BenchmarkId::new("cache", cache), cache, |b, _| {
            b.iter(|| {
                let offset = rng.gen_range(0..512 * 1024 - 256);
                store.read_at(id, offset, &mut buf).unwrap();
                black_box(&buf);
            });
        });
    }

    group.finish();
}

fn benchmark_stream_churn(c: &mut Criterion) {
    c.bench_function("container_create_remove_stream", |b| {
        let mut store = container(256, 64);
        b.iter(|| {
            let id = store.create_stream().unwrap();
            store.write_stream(id, &[1u8; 1000]).unwrap();
            store.remove_stream(black_box(id)).unwrap();
        });
    });
}

fn benchmark_list_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_add");

    for merkle in [None, Some(HashAlgorithm::Sha256)].iter() {
        let name = match merkle {
            Some(_) => "merkleized",
            None => "plain",
        };
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut builder = CollectionBuilder::new().cluster_size(1024);
                if let Some(algorithm) = merkle {
                    builder = builder.merkleized(*algorithm);
                }
                let mut list =
                    StreamMappedList::create(MemoryStorage::new(), StringSerializer, builder.build().unwrap())
                        .unwrap();
                list.batch(|list| {
                    for i in 0..1000 {
                        list.add(&format!("item-{}", i))?;
                    }
                    Ok(())
                })
                .unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_dictionary_lookup(c: &mut Criterion) {
    let config = CollectionBuilder::new()
        .cluster_size(1024)
        .merkleized(HashAlgorithm::Sha256)
        .build()
        .unwrap();
    let mut dict =
        StreamMappedDictionary::create(MemoryStorage::new(), StringSerializer, U64Serializer, config)
            .unwrap();
    for i in 0..10_000u64 {
        dict.add(format!("key-{}", i), i).unwrap();
    }
    let mut rng = rand::thread_rng();

    c.bench_function("dictionary_get", |b| {
        b.iter(|| {
            let key = format!("key-{}", rng.gen_range(0..10_000));
            black_box(dict.get(&key).unwrap());
        });
    });
}

criterion_group!(
    benches,
    benchmark_write_stream,
    benchmark_random_reads,
    benchmark_stream_churn,
    benchmark_list_add,
    benchmark_dictionary_lookup
);
criterion_main!(benches);
