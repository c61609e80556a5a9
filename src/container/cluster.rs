//! Cluster offset arithmetic
//!
//! Cluster `i` lives at `HEADER_SIZE + i * (8 + cluster_size)`: an 8-byte
//! little-endian next pointer followed by the payload.

use crate::header::HEADER_SIZE;

/// Size of the next-cluster pointer preceding each payload
pub const POINTER_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    cluster_size: u64,
}

impl Geometry {
    pub fn new(cluster_size: u32) -> Self {
        Geometry {
            cluster_size: cluster_size as u64,
        }
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// Bytes occupied by one cluster, pointer included
    pub fn stride(&self) -> u64 {
        POINTER_SIZE + self.cluster_size
    }

    pub fn cluster_offset(&self, cluster: u64) -> u64 {
        HEADER_SIZE as u64 + cluster * self.stride()
    }

    pub fn payload_offset(&self, cluster: u64) -> u64 {
        self.cluster_offset(cluster) + POINTER_SIZE
    }

    /// Clusters needed to hold `length` bytes
    pub fn clusters_for(&self, length: u64) -> u64 {
        length.div_ceil(self.cluster_size)
    }

    /// Storage size of a container holding `cluster_count` clusters
    pub fn storage_len(&self, cluster_count: u64) -> u64 {
        HEADER_SIZE as u64 + cluster_count * self.stride()
    }

    /// `storage_len` for a count read from disk, `None` on overflow
    pub fn checked_storage_len(&self, cluster_count: u64) -> Option<u64> {
        cluster_count
            .checked_mul(self.stride())?
            .checked_add(HEADER_SIZE as u64)
    }

    /// Split a stream position into (chain index, offset within the payload)
    pub fn locate(&self, position: u64) -> (u64, u64) {
        (position / self.cluster_size, position % self.cluster_size)
    }
}
