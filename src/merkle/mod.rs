//! Merkle trees over collection items
//!
//! - [`math`]: coordinate arithmetic, a pure function of the leaf count
//! - [`tree`]: in-memory flat tree with incremental updates
//! - [`proofs`]: existence, contains, update, consistency, append and delete
//!   proofs
//! - [`store`]: leaves persisted in a reserved stream, kept in step with a
//!   collection

pub mod math;
pub mod proofs;
pub mod store;
pub mod tree;

pub use math::{MerkleChildren, MerkleCoordinate};
pub use proofs::{LeafUpdate, Proof};
pub use store::MerkleTreeStore;
pub use tree::{bag_sub_roots, FlatMerkleTree};
