use crate::container::{Geometry, RECORD_SIZE};
use crate::error::{Result, StoreError};

pub const MAGIC: [u8; 8] = *b"CLSTRM\x00\x01";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Size of the on-disk header in bytes
pub const HEADER_SIZE: usize = 96;

/// End-of-chain / empty sentinel for cluster and stream pointers
pub const NIL: u64 = u64::MAX;

const CHECKSUM_OFFSET: usize = 80;

/// Container header (bytes `0..96`)
///
/// Holds the geometry of the container, the free-list head and the
/// location of the stream directory, which is itself a cluster chain.
///
/// # Layout
///
/// ```text
/// 0   magic            [u8; 8]
/// 8   version_major    u16
/// 10  version_minor    u16
/// 12  cluster_size     u32
/// 16  reserved_streams u32
/// 20  flags            u32
/// 24  stream_count     u64
/// 32  cluster_count    u64
/// 40  free_head        u64
/// 48  free_count       u64
/// 56  directory_start  u64
/// 64  directory_end    u64
/// 72  directory_length u64
/// 80  checksum         u32   (CRC-32 of bytes 0..80)
/// 84  padding
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,
    pub cluster_size: u32,
    pub reserved_streams: u32,
    pub flags: u32,
    /// Number of directory slots, including empty and reserved ones
    pub stream_count: u64,
    /// Clusters present in the body
    pub cluster_count: u64,
    pub free_head: u64,
    pub free_count: u64,
    pub directory_start: u64,
    pub directory_end: u64,
    pub directory_length: u64,
}

impl Header {
    pub fn new(cluster_size: u32, reserved_streams: u32) -> Self {
        Header {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            cluster_size,
            reserved_streams,
            flags: 0,
            stream_count: 0,
            cluster_count: 0,
            free_head: NIL,
            free_count: 0,
            directory_start: NIL,
            directory_end: NIL,
            directory_length: 0,
        }
    }

    /// Validate magic, version and the cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StoreError::InvalidMagic);
        }

        if self.version_major != VERSION_MAJOR || self.version_minor > VERSION_MINOR {
            return Err(StoreError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        if self.cluster_size == 0 || self.reserved_streams == 0 {
            return Err(StoreError::Corruption(format!(
                "header geometry invalid: cluster_size {}, reserved_streams {}",
                self.cluster_size, self.reserved_streams
            )));
        }

        if self.free_count > self.cluster_count {
            return Err(StoreError::Corruption(format!(
                "free clusters ({}) exceed total clusters ({})",
                self.free_count, self.cluster_count
            )));
        }

        if (self.free_count == 0) != (self.free_head == NIL) {
            return Err(StoreError::Corruption(format!(
                "free list head {} disagrees with free count {}",
                self.free_head, self.free_count
            )));
        }

        if self.stream_count < self.reserved_streams as u64 {
            return Err(StoreError::Corruption(format!(
                "stream count {} below reserved count {}",
                self.stream_count, self.reserved_streams
            )));
        }

        if Geometry::new(self.cluster_size)
            .checked_storage_len(self.cluster_count)
            .is_none()
        {
            return Err(StoreError::Corruption(format!(
                "cluster count {} overflows the addressable storage",
                self.cluster_count
            )));
        }

        let directory_len = self.stream_count.checked_mul(RECORD_SIZE as u64);
        if directory_len != Some(self.directory_length) {
            return Err(StoreError::Corruption(format!(
                "directory length {} does not match {} streams",
                self.directory_length, self.stream_count
            )));
        }

        Ok(())
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];

        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..10].copy_from_slice(&self.version_major.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.version_minor.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.cluster_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.reserved_streams.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.flags.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.stream_count.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.cluster_count.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.free_head.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.free_count.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.directory_start.to_le_bytes());
        bytes[64..72].copy_from_slice(&self.directory_end.to_le_bytes());
        bytes[72..80].copy_from_slice(&self.directory_length.to_le_bytes());

        let checksum = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());

        bytes
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Insufficient bytes for header",
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != MAGIC {
            return Err(StoreError::InvalidMagic);
        }

        let stored = read_u32(bytes, CHECKSUM_OFFSET);
        let computed = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(StoreError::Corruption(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let header = Header {
            magic,
            version_major: read_u16(bytes, 8),
            version_minor: read_u16(bytes, 10),
            cluster_size: read_u32(bytes, 12),
            reserved_streams: read_u32(bytes, 16),
            flags: read_u32(bytes, 20),
            stream_count: read_u64(bytes, 24),
            cluster_count: read_u64(bytes, 32),
            free_head: read_u64(bytes, 40),
            free_count: read_u64(bytes, 48),
            directory_start: read_u64(bytes, 56),
            directory_end: read_u64(bytes, 64),
            directory_length: read_u64(bytes, 72),
        };

        header.validate()?;

        Ok(header)
    }
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}
