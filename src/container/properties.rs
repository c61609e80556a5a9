//! Header extension properties
//!
//! Small typed values stored at fixed offsets inside reserved stream 0.
//! Bytes that were never written read back as zero, so every codec treats an
//! all-zero slot as its "unset" value.

use crate::error::{Result, StoreError};
use crate::hashing::MAX_DIGEST_SIZE;
use std::marker::PhantomData;

/// Untyped description of a property's byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySlot {
    pub name: &'static str,
    pub offset: u64,
    pub size: usize,
}

impl PropertySlot {
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Fixed-size codec for a property value
pub trait PropertyValue: Sized {
    /// Encode into `buf`, which is exactly the slot size
    fn encode(&self, buf: &mut [u8]) -> Result<()>;

    fn decode(buf: &[u8]) -> Result<Self>;
}

impl PropertyValue for u32 {
    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        buf[..4].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(crate::header::read_u32(buf, 0))
    }
}

impl PropertyValue for u64 {
    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        buf[..8].copy_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        Ok(crate::header::read_u64(buf, 0))
    }
}

/// `[len: u8][bytes]`, zero length meaning `None`
impl PropertyValue for Option<Vec<u8>> {
    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        if let Some(bytes) = self {
            if bytes.is_empty() || bytes.len() >= buf.len() || bytes.len() > u8::MAX as usize {
                return Err(StoreError::InvalidArgument(format!(
                    "property value of {} bytes does not fit a {}-byte slot",
                    bytes.len(),
                    buf.len()
                )));
            }
            buf[0] = bytes.len() as u8;
            buf[1..=bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let len = buf[0] as usize;
        if len == 0 {
            return Ok(None);
        }
        if len >= buf.len() {
            return Err(StoreError::Corruption(format!(
                "property length {} exceeds slot of {} bytes",
                len,
                buf.len()
            )));
        }
        Ok(Some(buf[1..=len].to_vec()))
    }
}

/// Typed `(name, offset, size, codec)` table entry
#[derive(Debug)]
pub struct HeaderProperty<T> {
    slot: PropertySlot,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HeaderProperty<T> {
    pub const fn new(name: &'static str, offset: u64, size: usize) -> Self {
        HeaderProperty {
            slot: PropertySlot { name, offset, size },
            _marker: PhantomData,
        }
    }

    pub fn slot(&self) -> PropertySlot {
        self.slot
    }
}

/// Last persisted Merkle root of the collection
pub const MERKLE_ROOT: HeaderProperty<Option<Vec<u8>>> =
    HeaderProperty::new("merkle_root", 0, MAX_DIGEST_SIZE + 1);

/// Record layout of the item table: 0 unset, `u64::MAX` chained, `n + 1` packed with `n`-byte payloads
pub const ITEM_LAYOUT: HeaderProperty<u64> = HeaderProperty::new("item_layout", 65, 8);

/// Merkle algorithm id (0 when the collection is not Merkleized)
pub const MERKLE_ALGORITHM: HeaderProperty<u32> = HeaderProperty::new("merkle_algorithm", 73, 4);

/// Every property stored in stream 0
pub fn property_table() -> [PropertySlot; 3] {
    [MERKLE_ROOT.slot(), ITEM_LAYOUT.slot(), MERKLE_ALGORITHM.slot()]
}
