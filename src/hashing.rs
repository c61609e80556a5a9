//! Hash collaborators: Merkle digests and item checksums

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Largest digest produced by any supported algorithm
pub const MAX_DIGEST_SIZE: usize = 64;

/// Digest algorithm used for Merkle trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Persisted identifier (0 is reserved for "no algorithm")
    pub fn id(self) -> u32 {
        match self {
            HashAlgorithm::Sha256 => 1,
            HashAlgorithm::Sha384 => 2,
            HashAlgorithm::Sha512 => 3,
        }
    }

    pub fn from_id(id: u32) -> Result<Option<Self>> {
        match id {
            0 => Ok(None),
            1 => Ok(Some(HashAlgorithm::Sha256)),
            2 => Ok(Some(HashAlgorithm::Sha384)),
            3 => Ok(Some(HashAlgorithm::Sha512)),
            other => Err(StoreError::Corruption(format!(
                "unknown hash algorithm id {}",
                other
            ))),
        }
    }

    pub fn hash(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(bytes).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }

    /// `H(left || right)`
    pub fn hash_pair(self, left: &[u8], right: &[u8]) -> Vec<u8> {
        fn pair<D: Digest>(left: &[u8], right: &[u8]) -> Vec<u8> {
            let mut hasher = D::new();
            hasher.update(left);
            hasher.update(right);
            hasher.finalize().to_vec()
        }

        match self {
            HashAlgorithm::Sha256 => pair::<Sha256>(left, right),
            HashAlgorithm::Sha384 => pair::<Sha384>(left, right),
            HashAlgorithm::Sha512 => pair::<Sha512>(left, right),
        }
    }

    /// Canonical tombstone leaf
    pub fn zero_digest(self) -> Vec<u8> {
        vec![0u8; self.digest_size()]
    }
}

/// 64-bit checksum used by checksum lookup indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Checksummer {
    #[default]
    Xxh3,
    /// First eight bytes of a digest
    Digest(HashAlgorithm),
}

impl Checksummer {
    pub fn checksum(&self, bytes: &[u8]) -> u64 {
        match self {
            Checksummer::Xxh3 => xxhash_rust::xxh3::xxh3_64(bytes),
            Checksummer::Digest(algorithm) => {
                let digest = algorithm.hash(bytes);
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&digest[..8]);
                u64::from_le_bytes(buf)
            }
        }
    }
}
