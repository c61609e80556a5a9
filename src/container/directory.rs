//! Stream directory records

use crate::error::{Result, StoreError};
use crate::header::{read_u64, NIL};

/// On-disk size of one directory record
pub const RECORD_SIZE: usize = 32;

/// Slot holds a live stream
pub const FLAG_IN_USE: u64 = 1;
/// Slot belongs to the reserved system range
pub const FLAG_RESERVED: u64 = 1 << 1;

/// Directory entry for one logical stream
///
/// ```text
/// 0   length  u64
/// 8   start   u64   (head cluster, NIL when empty)
/// 16  end     u64   (tail cluster, NIL when empty)
/// 24  flags   u64
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRecord {
    pub length: u64,
    pub start: u64,
    pub end: u64,
    pub flags: u64,
}

impl StreamRecord {
    /// An unused slot
    pub fn empty() -> Self {
        StreamRecord {
            length: 0,
            start: NIL,
            end: NIL,
            flags: 0,
        }
    }

    pub fn live() -> Self {
        StreamRecord {
            flags: FLAG_IN_USE,
            ..Self::empty()
        }
    }

    pub fn reserved() -> Self {
        StreamRecord {
            flags: FLAG_IN_USE | FLAG_RESERVED,
            ..Self::empty()
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE != 0
    }

    pub fn is_reserved(&self) -> bool {
        self.flags & FLAG_RESERVED != 0
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..8].copy_from_slice(&self.length.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.start.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.end.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.flags.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        StreamRecord {
            length: read_u64(bytes, 0),
            start: read_u64(bytes, 8),
            end: read_u64(bytes, 16),
            flags: read_u64(bytes, 24),
        }
    }

    /// Check the record is self-consistent for slot `id`
    pub fn validate(&self, id: u64, reserved_streams: u64) -> Result<()> {
        let known = FLAG_IN_USE | FLAG_RESERVED;
        if self.flags & !known != 0 {
            return Err(StoreError::Corruption(format!(
                "stream {} has unknown flags {:#x}",
                id, self.flags
            )));
        }

        if (id < reserved_streams) != self.is_reserved() {
            return Err(StoreError::Corruption(format!(
                "stream {} reserved flag disagrees with reserved range 0..{}",
                id, reserved_streams
            )));
        }

        if self.is_reserved() && !self.is_in_use() {
            return Err(StoreError::Corruption(format!(
                "reserved stream {} is not in use",
                id
            )));
        }

        let empty_chain = self.start == NIL;
        if empty_chain != (self.end == NIL) || empty_chain != (self.length == 0) {
            return Err(StoreError::Corruption(format!(
                "stream {} has length {} with chain {}..{}",
                id, self.length, self.start, self.end
            )));
        }

        if !self.is_in_use() && self.length != 0 {
            return Err(StoreError::Corruption(format!(
                "empty slot {} still owns {} bytes",
                id, self.length
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let record = StreamRecord {
            length: 700,
            start: 3,
            end: 9,
            flags: FLAG_IN_USE,
        };
        assert_eq!(StreamRecord::from_bytes(&record.to_bytes()), record);
    }

    #[test]
    fn test_record_flags() {
        assert!(!StreamRecord::empty().is_in_use());
        assert!(StreamRecord::live().is_in_use());
        assert!(!StreamRecord::live().is_reserved());
        assert!(StreamRecord::reserved().is_reserved());
    }

    #[test]
    fn test_validate() {
        assert!(StreamRecord::reserved().validate(0, 4).is_ok());
        assert!(StreamRecord::live().validate(4, 4).is_ok());
        assert!(StreamRecord::empty().validate(5, 4).is_ok());

        // reserved slot without the flag
        assert!(StreamRecord::live().validate(1, 4).is_err());
        // user slot with the flag
        assert!(StreamRecord::reserved().validate(6, 4).is_err());

        let mut record = StreamRecord::live();
        record.length = 10;
        assert!(record.validate(4, 4).is_err());

        record.start = 1;
        record.end = 1;
        assert!(record.validate(4, 4).is_ok());

        record.flags = 0x80 | FLAG_IN_USE;
        assert!(record.validate(4, 4).is_err());
    }
}
