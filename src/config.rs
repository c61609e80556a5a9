//! Container and collection configuration
//!
//! Configs are plain serde structs so they can be embedded in an
//! application's own TOML file. Geometry fields (`cluster_size`,
//! `reserved_streams`) only apply when a container is created; an existing
//! container always uses the geometry recorded in its header.

use crate::error::{Result, StoreError};
use crate::hashing::HashAlgorithm;
use serde::{Deserialize, Serialize};

/// Default cluster payload size in bytes
pub const DEFAULT_CLUSTER_SIZE: u32 = 512;

/// Smallest cluster payload accepted
pub const MIN_CLUSTER_SIZE: u32 = 16;

/// Largest cluster payload accepted (16 MiB)
pub const MAX_CLUSTER_SIZE: u32 = 1 << 24;

/// Default number of reserved system streams
pub const DEFAULT_RESERVED_STREAMS: u32 = 8;

/// Streams used by the collection layer (properties, items, Merkle leaves, key index)
pub const MIN_COLLECTION_RESERVED_STREAMS: u32 = 4;

/// Default directory capacity
pub const DEFAULT_MAX_STREAMS: u64 = 1 << 32;

/// Default number of walked cluster chains kept in the chain cache
pub const DEFAULT_CHAIN_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Payload bytes per cluster
    pub cluster_size: u32,

    /// Number of reserved stream slots (ids `0..reserved_streams`)
    pub reserved_streams: u32,

    /// Maximum number of directory slots, reserved ones included
    pub max_streams: u64,

    /// Number of cluster chains cached for random access (0 disables)
    pub chain_cache_capacity: usize,

    /// Walk every chain and the free list when opening
    pub verify_on_open: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            reserved_streams: DEFAULT_RESERVED_STREAMS,
            max_streams: DEFAULT_MAX_STREAMS,
            chain_cache_capacity: DEFAULT_CHAIN_CACHE_CAPACITY,
            verify_on_open: false,
        }
    }
}

impl ContainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cluster_size < MIN_CLUSTER_SIZE || self.cluster_size > MAX_CLUSTER_SIZE {
            return Err(StoreError::InvalidConfig(format!(
                "cluster_size {} outside {}..={}",
                self.cluster_size, MIN_CLUSTER_SIZE, MAX_CLUSTER_SIZE
            )));
        }

        if self.reserved_streams == 0 {
            return Err(StoreError::InvalidConfig(
                "reserved_streams must be at least 1 (stream 0 holds header properties)".into(),
            ));
        }

        if self.max_streams <= self.reserved_streams as u64 {
            return Err(StoreError::InvalidConfig(format!(
                "max_streams ({}) must exceed reserved_streams ({})",
                self.max_streams, self.reserved_streams
            )));
        }

        Ok(())
    }
}

/// Configuration of a stream-mapped collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub container: ContainerConfig,

    /// Merkleize the collection with this algorithm
    pub merkle: Option<HashAlgorithm>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        CollectionConfig {
            container: ContainerConfig::default(),
            merkle: None,
        }
    }
}

impl CollectionConfig {
    /// Parse and validate a config from TOML
    ///
    /// ```toml
    /// merkle = "sha256"
    ///
    /// [container]
    /// cluster_size = 256
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: CollectionConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.container.validate()?;

        if self.container.reserved_streams < MIN_COLLECTION_RESERVED_STREAMS {
            return Err(StoreError::InvalidConfig(format!(
                "collections need at least {} reserved streams, got {}",
                MIN_COLLECTION_RESERVED_STREAMS, self.container.reserved_streams
            )));
        }

        Ok(())
    }
}

/// Builder for [`CollectionConfig`]
#[derive(Debug, Default)]
pub struct CollectionBuilder {
    config: CollectionConfig,
}

impl CollectionBuilder {
    pub fn new() -> Self {
        CollectionBuilder::default()
    }

    /// Set the cluster payload size
    pub fn cluster_size(mut self, size: u32) -> Self {
        self.config.container.cluster_size = size;
        self
    }

    /// Set the number of reserved streams
    pub fn reserved_streams(mut self, count: u32) -> Self {
        self.config.container.reserved_streams = count;
        self
    }

    /// Limit the number of directory slots
    pub fn max_streams(mut self, count: u64) -> Self {
        self.config.container.max_streams = count;
        self
    }

    /// Size of the chain cache (0 disables caching)
    pub fn chain_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.container.chain_cache_capacity = capacity;
        self
    }

    /// Verify every chain when the collection is opened
    pub fn verify_on_open(mut self) -> Self {
        self.config.container.verify_on_open = true;
        self
    }

    /// Maintain a Merkle tree over the collection's items
    pub fn merkleized(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.merkle = Some(algorithm);
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<CollectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
