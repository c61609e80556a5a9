#![no_main]
use clustered_streams::{
    ClusterContainer, CollectionBuilder, ContainerConfig, HashAlgorithm, MemoryStorage,
    StreamMappedList, StringSerializer,
};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must open cleanly or fail with an error, never panic
fuzz_target!(|data: &[u8]| {
    let config = ContainerConfig {
        verify_on_open: true,
        ..ContainerConfig::default()
    };
    if let Ok(mut c) = ClusterContainer::open(MemoryStorage::from_bytes(data.to_vec()), config) {
        for id in c.streams() {
            let _ = c.read_stream(id);
        }
        let _ = c.verify_integrity();
    }

    let Ok(config) = CollectionBuilder::new().merkleized(HashAlgorithm::Sha256).build() else {
        return;
    };
    if let Ok(mut list) = StreamMappedList::<String, _, _>::open(
        MemoryStorage::from_bytes(data.to_vec()),
        StringSerializer,
        config,
    ) {
        let _ = list.merkle_root();
        if let Ok(iter) = list.iter() {
            for item in iter.take(64) {
                let _ = item;
            }
        }
    }
});
