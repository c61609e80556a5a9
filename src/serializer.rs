//! Item serializer contract and stock codecs
//!
//! Collections pick their record layout from the serializer: a constant-size
//! serializer gets fixed-size packed records addressed by `index * size`,
//! anything else gets one stream per item.

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub trait ItemSerializer<T> {
    /// Encoded size shared by every item, if the encoding is constant-size
    fn constant_size(&self) -> Option<usize> {
        None
    }

    fn is_constant_size(&self) -> bool {
        self.constant_size().is_some()
    }

    /// Exact number of bytes `serialize` will append for `item`
    fn calculate_size(&self, item: &T) -> Result<usize>;

    /// Append the encoding of `item` to `out`
    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> Result<()>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T>;

    fn to_bytes(&self, item: &T) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.calculate_size(item)?);
        self.serialize(item, &mut out)?;
        Ok(out)
    }
}

impl<T, S: ItemSerializer<T> + ?Sized> ItemSerializer<T> for Box<S> {
    fn constant_size(&self) -> Option<usize> {
        (**self).constant_size()
    }

    fn calculate_size(&self, item: &T) -> Result<usize> {
        (**self).calculate_size(item)
    }

    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> Result<()> {
        (**self).serialize(item, out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        (**self).deserialize(bytes)
    }
}

fn size_mismatch(expected: usize, actual: usize) -> StoreError {
    StoreError::Serialization(format!(
        "expected {} encoded bytes, got {}",
        expected, actual
    ))
}

/// serde + bincode codec for arbitrary types
pub struct BincodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        BincodeSerializer {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> ItemSerializer<T> for BincodeSerializer<T> {
    fn calculate_size(&self, item: &T) -> Result<usize> {
        Ok(bincode::serialized_size(item)? as usize)
    }

    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, item)?;
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// serde + JSON codec, handy when stored items should stay human-readable
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        JsonSerializer {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> ItemSerializer<T> for JsonSerializer<T> {
    fn calculate_size(&self, item: &T) -> Result<usize> {
        Ok(serde_json::to_vec(item)?.len())
    }

    fn serialize(&self, item: &T, out: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(out, item)?;
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// UTF-8 strings, unprefixed
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl ItemSerializer<String> for StringSerializer {
    fn calculate_size(&self, item: &String) -> Result<usize> {
        Ok(item.len())
    }

    fn serialize(&self, item: &String, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StoreError::Serialization(format!("invalid UTF-8: {}", e)))
    }
}

/// Raw byte vectors, unprefixed
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl ItemSerializer<Vec<u8>> for BytesSerializer {
    fn calculate_size(&self, item: &Vec<u8>) -> Result<usize> {
        Ok(item.len())
    }

    fn serialize(&self, item: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(item);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Byte vectors of exactly `size` bytes (digests, fixed keys)
#[derive(Debug, Clone, Copy)]
pub struct FixedBytesSerializer {
    size: usize,
}

impl FixedBytesSerializer {
    pub fn new(size: usize) -> Self {
        FixedBytesSerializer { size }
    }
}

impl ItemSerializer<Vec<u8>> for FixedBytesSerializer {
    fn constant_size(&self) -> Option<usize> {
        Some(self.size)
    }

    fn calculate_size(&self, item: &Vec<u8>) -> Result<usize> {
        if item.len() != self.size {
            return Err(size_mismatch(self.size, item.len()));
        }
        Ok(self.size)
    }

    fn serialize(&self, item: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        self.calculate_size(item)?;
        out.extend_from_slice(item);
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.len() != self.size {
            return Err(size_mismatch(self.size, bytes.len()));
        }
        Ok(bytes.to_vec())
    }
}

macro_rules! le_integer_serializer {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Little-endian `", stringify!($ty), "`")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl ItemSerializer<$ty> for $name {
            fn constant_size(&self) -> Option<usize> {
                Some(std::mem::size_of::<$ty>())
            }

            fn calculate_size(&self, _item: &$ty) -> Result<usize> {
                Ok(std::mem::size_of::<$ty>())
            }

            fn serialize(&self, item: &$ty, out: &mut Vec<u8>) -> Result<()> {
                out.extend_from_slice(&item.to_le_bytes());
                Ok(())
            }

            fn deserialize(&self, bytes: &[u8]) -> Result<$ty> {
                let buf: [u8; std::mem::size_of::<$ty>()] = bytes
                    .try_into()
                    .map_err(|_| size_mismatch(std::mem::size_of::<$ty>(), bytes.len()))?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

le_integer_serializer!(U32Serializer, u32);
le_integer_serializer!(U64Serializer, u64);

/// Composes a key serializer and a value serializer into a pair codec
///
/// Constant-size keys are written bare; variable-size keys get a `u32` length
/// prefix. The value always takes the remaining bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueSerializer<KS, VS> {
    key: KS,
    value: VS,
}

impl<KS, VS> KeyValueSerializer<KS, VS> {
    pub fn new(key: KS, value: VS) -> Self {
        KeyValueSerializer { key, value }
    }

    pub fn key_serializer(&self) -> &KS {
        &self.key
    }

    pub fn value_serializer(&self) -> &VS {
        &self.value
    }
}

impl<K, V, KS, VS> ItemSerializer<(K, V)> for KeyValueSerializer<KS, VS>
where
    KS: ItemSerializer<K>,
    VS: ItemSerializer<V>,
{
    fn constant_size(&self) -> Option<usize> {
        Some(self.key.constant_size()? + self.value.constant_size()?)
    }

    fn calculate_size(&self, item: &(K, V)) -> Result<usize> {
        let key = self.key.calculate_size(&item.0)?;
        let prefix = if self.key.is_constant_size() { 0 } else { 4 };
        Ok(prefix + key + self.value.calculate_size(&item.1)?)
    }

    fn serialize(&self, item: &(K, V), out: &mut Vec<u8>) -> Result<()> {
        if !self.key.is_constant_size() {
            let key_len = u32::try_from(self.key.calculate_size(&item.0)?)
                .map_err(|_| StoreError::Serialization("key longer than u32::MAX".into()))?;
            out.extend_from_slice(&key_len.to_le_bytes());
        }
        self.key.serialize(&item.0, out)?;
        self.value.serialize(&item.1, out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(K, V)> {
        let (key_bytes, value_bytes) = split_key(&self.key, bytes)?;
        Ok((
            self.key.deserialize(key_bytes)?,
            self.value.deserialize(value_bytes)?,
        ))
    }
}

/// Split an encoded pair into its key and value parts
pub(crate) fn split_key<'a, K, KS: ItemSerializer<K> + ?Sized>(
    key: &KS,
    bytes: &'a [u8],
) -> Result<(&'a [u8], &'a [u8])> {
    let (start, key_len) = match key.constant_size() {
        Some(size) => (0, size),
        None => {
            if bytes.len() < 4 {
                return Err(size_mismatch(4, bytes.len()));
            }
            (4, crate::header::read_u32(bytes, 0) as usize)
        }
    };

    let end = start + key_len;
    if bytes.len() < end {
        return Err(size_mismatch(end, bytes.len()));
    }
    Ok((&bytes[start..end], &bytes[end..]))
}
