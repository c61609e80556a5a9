//! Meta-data providers
//!
//! A provider keeps one datum per collection item (extracted from the item)
//! in a reserved stream and projects the datums into an in-memory index:
//! unique keys, or a multi-map lookup. Providers listen to the owning
//! collection's mutations, and reject a mutation that would break their
//! invariant before anything is written.

pub mod projection;
pub mod provider;

pub use projection::{LookupProjection, Projection, UniqueProjection};
pub use provider::{checksum_index, Extractor, LookupIndex, MetaDataProvider, UniqueKeyIndex};
