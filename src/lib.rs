//! # Clustered Streams - Authenticated Single-File Object Storage
//!
//! `clustered-streams` stores variable-length logical streams inside one
//! byte store divided into fixed-size clusters, and layers persistent lists
//! and dictionaries on top, optionally authenticated by a Merkle tree.
//!
//! - **Cluster stream container**: linked cluster chains, a LIFO free list,
//!   a directory of stream records and a checksummed header
//! - **Merkle trees**: flat trees with incremental updates and existence,
//!   consistency, append, update, delete and multi-leaf proofs
//! - **Meta-data providers**: unique and lookup indexes kept in step with a
//!   collection through mutation notifications
//! - **Stream-mapped collections**: `StreamMappedList` and
//!   `StreamMappedDictionary`
//!
//! ## Architecture
//!
//! ```text
//!  StreamMappedDictionary ──► StreamMappedList ──► MutationListener(s)
//!                                   │                 ├─ MerkleTreeStore
//!                                   │                 └─ MetaDataProvider
//!                                   ▼
//!                            RecordStore (item table)
//!                                   │
//!                                   ▼
//!                            ClusterContainer ──► Storage (memory / file)
//! ```
//!
//! Writes flow down from the collection to the clusters; notifications flow
//! back up to the listeners, inside the same access scope.
//!
//! ## Quick Start
//!
//! ```rust
//! use clustered_streams::{
//!     CollectionBuilder, HashAlgorithm, MemoryStorage, Result, StreamMappedDictionary,
//!     StringSerializer, U64Serializer,
//! };
//!
//! # fn main() -> Result<()> {
//! let config = CollectionBuilder::new()
//!     .cluster_size(256)
//!     .merkleized(HashAlgorithm::Sha256)
//!     .build()?;
//!
//! let mut balances = StreamMappedDictionary::create(
//!     MemoryStorage::new(),
//!     StringSerializer,
//!     U64Serializer,
//!     config,
//! )?;
//!
//! balances.add("alice".to_string(), 100)?;
//! balances.set("bob".to_string(), 40)?;
//! assert_eq!(balances.get(&"alice".to_string())?, 100);
//!
//! let root = balances.merkle_root()?;
//! assert!(root.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Raw Streams
//!
//! ```rust
//! use clustered_streams::{ClusterContainer, ContainerConfig, MemoryStorage, Result};
//! use std::io::{Read, Write};
//!
//! # fn main() -> Result<()> {
//! let mut container = ClusterContainer::create(MemoryStorage::new(), ContainerConfig::default())?;
//! let id = container.create_stream()?;
//! container.open_stream(id, true)?.write_all(b"hello")?;
//!
//! let mut text = String::new();
//! container.open_stream(id, false)?.read_to_string(&mut text)?;
//! assert_eq!(text, "hello");
//! # Ok(())
//! # }
//! ```

pub mod collections;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod hashing;
pub mod header;
pub mod merkle;
pub mod metadata;
pub mod records;
pub mod serializer;
pub mod storage;

pub use collections::{StreamMappedDictionary, StreamMappedList};
pub use config::{CollectionBuilder, CollectionConfig, ContainerConfig};
pub use container::{AccessScope, ClusterContainer, ClusterStream, ContainerStats};
pub use error::{ErrorClass, Result, StoreError};
pub use events::{Mutation, MutationListener};
pub use hashing::{Checksummer, HashAlgorithm};
pub use merkle::{FlatMerkleTree, MerkleCoordinate, MerkleTreeStore, Proof};
pub use metadata::{checksum_index, LookupIndex, MetaDataProvider, UniqueKeyIndex};
pub use records::{RecordLayout, RecordStore};
pub use serializer::{
    BincodeSerializer, BytesSerializer, FixedBytesSerializer, ItemSerializer, JsonSerializer,
    KeyValueSerializer, StringSerializer, U32Serializer, U64Serializer,
};
pub use storage::{FileStorage, MemoryStorage, Storage};
