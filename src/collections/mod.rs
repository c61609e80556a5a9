//! Stream-mapped collections
//!
//! Reserved stream layout shared by every collection:
//!
//! | stream | content                                      |
//! |--------|----------------------------------------------|
//! | 0      | header properties (layout, Merkle algorithm, root) |
//! | 1      | item table                                   |
//! | 2      | Merkle leaves                                |
//! | 3      | dictionary key index                         |
//!
//! Further reserved streams are free for caller-attached meta-data
//! providers.

pub mod dictionary;
pub mod list;

pub use dictionary::StreamMappedDictionary;
pub use list::{Iter, StreamMappedList};

/// Item table
pub const ITEMS_STREAM: u64 = 1;

/// Merkle leaf digests
pub const MERKLE_LEAVES_STREAM: u64 = 2;

/// Dictionary key datums
pub const KEY_INDEX_STREAM: u64 = 3;

/// First reserved stream not used by the collections themselves
pub const FIRST_USER_STREAM: u64 = 4;
