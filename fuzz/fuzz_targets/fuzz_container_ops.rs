#![no_main]
use clustered_streams::{ClusterContainer, ContainerConfig, MemoryStorage};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};

#[derive(Debug, Arbitrary)]
enum StreamOp {
    Create,
    Remove(u8),
    Write { stream: u8, offset: u16, data: Vec<u8> },
    Resize { stream: u8, length: u16 },
    Read { stream: u8, offset: u16, length: u8 },
}

// Random stream operations against an in-memory model
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let Ok(cluster_size) = u.int_in_range(16u32..=96) else { return };
    let ops: Vec<StreamOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let config = ContainerConfig {
        cluster_size,
        reserved_streams: 2,
        chain_cache_capacity: 4,
        ..ContainerConfig::default()
    };
    let Ok(mut c) = ClusterContainer::create(MemoryStorage::new(), config.clone()) else { return };
    let mut model: Vec<(u64, Vec<u8>)> = Vec::new();

    for op in ops.into_iter().take(64) {
        match op {
            StreamOp::Create => {
                let id = c.create_stream().unwrap();
                model.push((id, Vec::new()));
            }
            StreamOp::Remove(pick) if !model.is_empty() => {
                let (id, _) = model.remove(pick as usize % model.len());
                c.remove_stream(id).unwrap();
            }
            StreamOp::Write { stream, offset, data } if !model.is_empty() => {
                let slot = stream as usize % model.len();
                let (id, bytes) = &mut model[slot];
                c.write_at(*id, offset as u64, &data).unwrap();
                let end = offset as usize + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[offset as usize..end].copy_from_slice(&data);
            }
            StreamOp::Resize { stream, length } if !model.is_empty() => {
                let slot = stream as usize % model.len();
                let (id, bytes) = &mut model[slot];
                c.resize_stream(*id, length as u64).unwrap();
                bytes.resize(length as usize, 0);
            }
            StreamOp::Read { stream, offset, length } if !model.is_empty() => {
                let (id, bytes) = &model[stream as usize % model.len()];
                let mut buf = vec![0u8; length as usize];
                let end = offset as usize + length as usize;
                match c.read_at(*id, offset as u64, &mut buf) {
                    Ok(()) => assert_eq!(&buf[..], &bytes[offset as usize..end]),
                    Err(_) => assert!(end > bytes.len()),
                }
            }
            _ => {}
        }
    }

    c.verify_integrity().unwrap();
    let bytes = c.into_storage().unwrap().into_inner();
    let mut reopened = ClusterContainer::open(MemoryStorage::from_bytes(bytes), config).unwrap();
    for (id, data) in &model {
        assert_eq!(&reopened.read_stream(*id).unwrap(), data);
    }
});
