//! File persistence tests
//!
//! Collections written to a `FileStorage` must reopen with identical
//! contents, indexes and Merkle roots.

use clustered_streams::merkle::proofs::verify_existence_proof;
use clustered_streams::{
    BincodeSerializer, ClusterContainer, CollectionBuilder, CollectionConfig, ContainerConfig,
    FileStorage, HashAlgorithm, ItemSerializer, StoreError, StreamMappedDictionary,
    StreamMappedList, StringSerializer, U64Serializer,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    owner: String,
    balance: u64,
    frozen: bool,
}

fn config(algorithm: HashAlgorithm) -> CollectionConfig {
    CollectionBuilder::new()
        .cluster_size(128)
        .merkleized(algorithm)
        .build()
        .unwrap()
}

#[test]
fn test_container_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("streams.bin");

    let ids = {
        let mut c = ClusterContainer::create(FileStorage::create(&path).unwrap(), ContainerConfig::default())
            .unwrap();
        let a = c.create_stream().unwrap();
        let b = c.create_stream().unwrap();
        c.write_stream(a, &vec![1u8; 2000]).unwrap();
        c.write_stream(b, b"short").unwrap();
        c.into_storage().unwrap().sync().unwrap();
        (a, b)
    };

    let mut c = ClusterContainer::open(
        FileStorage::open(&path).unwrap(),
        ContainerConfig {
            verify_on_open: true,
            ..ContainerConfig::default()
        },
    )
    .unwrap();
    assert_eq!(c.read_stream(ids.0).unwrap(), vec![1u8; 2000]);
    assert_eq!(c.read_stream(ids.1).unwrap(), b"short");
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        c.stats().storage_bytes
    );
}

#[test]
fn test_list_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("accounts.list");
    let config = config(HashAlgorithm::Sha512);

    let accounts: Vec<Account> = (0..50)
        .map(|i| Account {
            owner: format!("owner-{}", i),
            balance: i * 17,
            frozen: i % 5 == 0,
        })
        .collect();

    let root = {
        let mut list = StreamMappedList::create(
            FileStorage::create(&path).unwrap(),
            BincodeSerializer::<Account>::new(),
            config.clone(),
        )
        .unwrap();
        list.batch(|list| {
            for account in &accounts {
                list.add(account)?;
            }
            list.reap(10)?;
            Ok(())
        })
        .unwrap();
        let root = list.merkle_root().unwrap();
        list.into_storage().unwrap().sync().unwrap();
        root
    };

    let mut list = StreamMappedList::open(
        FileStorage::open(&path).unwrap(),
        BincodeSerializer::<Account>::new(),
        config,
    )
    .unwrap();
    assert_eq!(list.len().unwrap(), 50);
    assert_eq!(list.merkle_root().unwrap(), root);
    assert!(matches!(list.read(10), Err(StoreError::ItemReaped(10))));
    assert_eq!(list.read(49).unwrap(), accounts[49]);

    let live: Vec<u64> = list.iter().unwrap().map(|r| r.unwrap().0).collect();
    assert_eq!(live.len(), 49);
    assert!(!live.contains(&10));
    list.verify_integrity().unwrap();
}

#[test]
fn test_list_rejects_mismatched_config_on_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("names.list");

    let mut list = StreamMappedList::create(
        FileStorage::create(&path).unwrap(),
        StringSerializer,
        config(HashAlgorithm::Sha256),
    )
    .unwrap();
    list.add(&"x".to_string()).unwrap();
    list.into_storage().unwrap().sync().unwrap();

    let err = StreamMappedList::<String, _, _>::open(
        FileStorage::open(&path).unwrap(),
        StringSerializer,
        config(HashAlgorithm::Sha384),
    )
    .err()
    .unwrap();
    assert!(matches!(err, StoreError::InvalidConfig(_)));

    let err = StreamMappedList::<u64, _, _>::open(
        FileStorage::open(&path).unwrap(),
        U64Serializer,
        config(HashAlgorithm::Sha256),
    )
    .err()
    .unwrap();
    assert!(matches!(err, StoreError::InvalidConfig(_)));
}

#[test]
fn test_dictionary_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("balances.dict");
    let config = config(HashAlgorithm::Sha256);

    let root = {
        let mut dict = StreamMappedDictionary::create(
            FileStorage::create(&path).unwrap(),
            StringSerializer,
            U64Serializer,
            config.clone(),
        )
        .unwrap();
        for i in 0..30u64 {
            dict.add(format!("key-{}", i), i * 100).unwrap();
        }
        dict.remove(&"key-7".to_string()).unwrap();
        dict.set("key-3".to_string(), 3).unwrap();
        let root = dict.merkle_root().unwrap();
        dict.into_storage().unwrap().sync().unwrap();
        root
    };

    let mut dict = StreamMappedDictionary::open(
        FileStorage::open(&path).unwrap(),
        StringSerializer,
        U64Serializer,
        config,
    )
    .unwrap();
    assert_eq!(dict.len().unwrap(), 29);
    assert_eq!(dict.merkle_root().unwrap(), root);
    assert_eq!(dict.get(&"key-3".to_string()).unwrap(), 3);
    assert_eq!(dict.get(&"key-29".to_string()).unwrap(), 2900);
    assert!(!dict.contains_key(&"key-7".to_string()).unwrap());

    // the freed slot is found again after reopening
    let slot = dict.add("key-30".to_string(), 1).unwrap();
    assert_eq!(slot, 7);

    let key = "key-12".to_string();
    let (slot, proof) = dict.key_proof(&key).unwrap().unwrap();
    let bytes = dict.list().serializer().to_bytes(&(key.clone(), 1200)).unwrap();
    let leaf = HashAlgorithm::Sha256.hash(&bytes);
    let size = dict.list().len().unwrap();
    let root = dict.merkle_root().unwrap().unwrap();
    assert!(verify_existence_proof(
        HashAlgorithm::Sha256,
        &root,
        size,
        slot,
        &leaf,
        &proof
    ));
    dict.verify_integrity().unwrap();
}
