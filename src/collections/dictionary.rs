use super::list::StreamMappedList;
use super::KEY_INDEX_STREAM;
use crate::config::CollectionConfig;
use crate::container::ContainerStats;
use crate::error::{Result, StoreError};
use crate::merkle::Proof;
use crate::metadata::{MetaDataProvider, Projection, UniqueKeyIndex};
use crate::serializer::{BytesSerializer, FixedBytesSerializer, ItemSerializer, KeyValueSerializer};
use crate::storage::Storage;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

type KeyCodec = Box<dyn ItemSerializer<Vec<u8>> + Send + Sync>;
type KeyIndex<K, V> = UniqueKeyIndex<(K, V), Vec<u8>, KeyCodec>;

/// Persistent map over a list of `(key, value)` records
///
/// Keys are indexed by their serialized bytes in a unique key index.
/// Removing a key reaps its slot: no other entry moves, and a Merkleized
/// dictionary records the zero digest for that slot. The lowest reaped slot
/// is reused by the next `add`.
pub struct StreamMappedDictionary<K, V, KS, VS, S: Storage> {
    list: StreamMappedList<(K, V), KeyValueSerializer<KS, VS>, S>,
    keys: Arc<Mutex<KeyIndex<K, V>>>,
    free_slots: BTreeSet<u64>,
}

impl<K, V, KS, VS, S> StreamMappedDictionary<K, V, KS, VS, S>
where
    K: 'static,
    V: 'static,
    KS: ItemSerializer<K> + Clone + Send + Sync + 'static,
    VS: ItemSerializer<V>,
    S: Storage + 'static,
{
    pub fn create(storage: S, key_serializer: KS, value_serializer: VS, config: CollectionConfig) -> Result<Self> {
        let keys = Arc::new(Mutex::new(key_index(key_serializer.clone())));
        let list = StreamMappedList::create(
            storage,
            KeyValueSerializer::new(key_serializer, value_serializer),
            config,
        )?;
        Self::assemble(list, keys)
    }

    pub fn open(storage: S, key_serializer: KS, value_serializer: VS, config: CollectionConfig) -> Result<Self> {
        let keys = Arc::new(Mutex::new(key_index(key_serializer.clone())));
        let list = StreamMappedList::open(
            storage,
            KeyValueSerializer::new(key_serializer, value_serializer),
            config,
        )?;
        Self::assemble(list, keys)
    }

    fn assemble(
        mut list: StreamMappedList<(K, V), KeyValueSerializer<KS, VS>, S>,
        keys: Arc<Mutex<KeyIndex<K, V>>>,
    ) -> Result<Self> {
        list.attach_key_index(Arc::clone(&keys))?;
        let free_slots = list.reaped_indices()?.into_iter().collect();
        Ok(StreamMappedDictionary {
            list,
            keys,
            free_slots,
        })
    }

    /// Underlying list of entries
    pub fn list(&self) -> &StreamMappedList<(K, V), KeyValueSerializer<KS, VS>, S> {
        &self.list
    }

    /// Number of live entries
    pub fn len(&self) -> Result<u64> {
        Ok(self.keys.lock().projection()?.len() as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn key_bytes(&self, key: &K) -> Result<Vec<u8>> {
        self.list.serializer().key_serializer().to_bytes(key)
    }

    /// Slot index of `key`
    pub fn try_find_key(&self, key: &K) -> Result<Option<u64>> {
        let bytes = self.key_bytes(key)?;
        let found = self.keys.lock().find(&bytes)?;
        Ok(found)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.try_find_key(key)?.is_some())
    }

    pub fn try_find_value(&mut self, key: &K) -> Result<Option<V>> {
        match self.try_find_key(key)? {
            Some(index) => Ok(Some(self.list.read(index)?.1)),
            None => Ok(None),
        }
    }

    /// Value of `key`; fails with `KeyNotFound` when absent
    pub fn get(&mut self, key: &K) -> Result<V> {
        self.try_find_value(key)?.ok_or(StoreError::KeyNotFound)
    }

    /// Insert a new entry and return its slot; fails with `DuplicateKey`
    /// when the key is present
    pub fn add(&mut self, key: K, value: V) -> Result<u64> {
        if self.contains_key(&key)? {
            return Err(StoreError::DuplicateKey);
        }
        let entry = (key, value);
        match self.free_slots.first().copied() {
            Some(slot) => {
                self.list.update(slot, &entry)?;
                self.free_slots.remove(&slot);
                debug!("Reused reaped slot {}", slot);
                Ok(slot)
            }
            None => self.list.add(&entry),
        }
    }

    /// Insert or replace; the slot of an existing key is kept
    pub fn set(&mut self, key: K, value: V) -> Result<u64> {
        match self.try_find_key(&key)? {
            Some(slot) => {
                self.list.update(slot, &(key, value))?;
                Ok(slot)
            }
            None => self.add(key, value),
        }
    }

    /// Remove `key` and return its value; fails with `KeyNotFound` when
    /// absent
    pub fn remove(&mut self, key: &K) -> Result<V> {
        self.try_remove(key)?.ok_or(StoreError::KeyNotFound)
    }

    pub fn try_remove(&mut self, key: &K) -> Result<Option<V>> {
        let Some(slot) = self.try_find_key(key)? else {
            return Ok(None);
        };
        let (_, value) = self.list.read(slot)?;
        self.remove_at(slot)?;
        Ok(Some(value))
    }

    /// Reap the entry in `slot`
    pub fn remove_at(&mut self, slot: u64) -> Result<()> {
        self.list.reap(slot)?;
        self.free_slots.insert(slot);
        Ok(())
    }

    /// Live entries in slot order
    pub fn entries(&mut self) -> Result<Vec<(K, V)>> {
        self.list.iter()?.map(|r| r.map(|(_, entry)| entry)).collect()
    }

    pub fn keys(&mut self) -> Result<Vec<K>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values(&mut self) -> Result<Vec<V>> {
        Ok(self.entries()?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.list.clear()?;
        self.free_slots.clear();
        Ok(())
    }

    pub fn merkle_root(&mut self) -> Result<Option<Vec<u8>>> {
        self.list.merkle_root()
    }

    /// Slot of `key` and the existence proof of its Merkle leaf
    pub fn key_proof(&mut self, key: &K) -> Result<Option<(u64, Proof)>> {
        match self.try_find_key(key)? {
            Some(slot) => Ok(Some((slot, self.list.existence_proof(slot)?))),
            None => Ok(None),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.list.flush()
    }

    pub fn verify_integrity(&mut self) -> Result<ContainerStats> {
        self.list.verify_integrity()
    }

    pub fn into_storage(self) -> Result<S> {
        self.list.into_storage()
    }
}

fn key_index<K, V, KS>(key_serializer: KS) -> KeyIndex<K, V>
where
    K: 'static,
    V: 'static,
    KS: ItemSerializer<K> + Send + Sync + 'static,
{
    let codec: KeyCodec = match key_serializer.constant_size() {
        Some(size) => Box::new(FixedBytesSerializer::new(size)),
        None => Box::new(BytesSerializer),
    };
    MetaDataProvider::new(KEY_INDEX_STREAM, codec, move |(key, _): &(K, V)| {
        key_serializer.to_bytes(key)
    })
}
