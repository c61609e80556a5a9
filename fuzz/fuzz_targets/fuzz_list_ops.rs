#![no_main]
use clustered_streams::{
    CollectionBuilder, FlatMerkleTree, HashAlgorithm, MemoryStorage, MetaDataProvider,
    StreamMappedList, StringSerializer, UniqueKeyIndex,
};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum ListOp {
    Add(String),
    Insert(u8, String),
    Update(u8, String),
    Remove(u8),
    Reap(u8),
    Clear,
}

// List mutations must keep contents, the unique index and the Merkle root
// in step with a plain model
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<ListOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let algorithm = HashAlgorithm::Sha256;
    let config = CollectionBuilder::new()
        .cluster_size(32)
        .merkleized(algorithm)
        .build()
        .unwrap();
    let mut list = StreamMappedList::create(MemoryStorage::new(), StringSerializer, config).unwrap();
    let index: Arc<Mutex<UniqueKeyIndex<String, String, StringSerializer>>> = Arc::new(Mutex::new(
        MetaDataProvider::new(4, StringSerializer, |item: &String| Ok(item.clone())),
    ));
    list.attach_listener(Arc::clone(&index)).unwrap();

    let mut model: Vec<Option<String>> = Vec::new();
    let taken = |model: &Vec<Option<String>>, item: &String, skip: Option<usize>| {
        model
            .iter()
            .enumerate()
            .any(|(i, m)| Some(i) != skip && m.as_ref() == Some(item))
    };

    for op in ops.into_iter().take(48) {
        match op {
            ListOp::Add(item) => {
                let result = list.add(&item);
                if taken(&model, &item, None) {
                    assert!(result.is_err());
                } else {
                    result.unwrap();
                    model.push(Some(item));
                }
            }
            ListOp::Insert(at, item) => {
                let at = at as usize % (model.len() + 1);
                let result = list.insert(at as u64, &item);
                if taken(&model, &item, None) {
                    assert!(result.is_err());
                } else {
                    result.unwrap();
                    model.insert(at, Some(item));
                }
            }
            ListOp::Update(at, item) if !model.is_empty() => {
                let at = at as usize % model.len();
                let result = list.update(at as u64, &item);
                if taken(&model, &item, Some(at)) {
                    assert!(result.is_err());
                } else {
                    result.unwrap();
                    model[at] = Some(item);
                }
            }
            ListOp::Remove(at) if !model.is_empty() => {
                let at = at as usize % model.len();
                list.remove_at(at as u64).unwrap();
                model.remove(at);
            }
            ListOp::Reap(at) if !model.is_empty() => {
                let at = at as usize % model.len();
                list.reap(at as u64).unwrap();
                model[at] = None;
            }
            ListOp::Clear => {
                list.clear().unwrap();
                model.clear();
            }
            _ => {}
        }
    }

    for (i, expected) in model.iter().enumerate() {
        assert_eq!(&list.get(i as u64).unwrap(), expected);
        if let Some(item) = expected {
            assert_eq!(index.lock().find(item).unwrap(), Some(i as u64));
        }
    }

    let leaves: Vec<Vec<u8>> = model
        .iter()
        .map(|m| match m {
            Some(item) => algorithm.hash(item.as_bytes()),
            None => algorithm.zero_digest(),
        })
        .collect();
    let expected = FlatMerkleTree::from_leaves(algorithm, &leaves)
        .unwrap()
        .root()
        .map(|r| r.to_vec());
    assert_eq!(list.merkle_root().unwrap(), expected);
});
