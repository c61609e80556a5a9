use super::{FIRST_USER_STREAM, ITEMS_STREAM, KEY_INDEX_STREAM, MERKLE_LEAVES_STREAM};
use crate::config::{CollectionConfig, MIN_COLLECTION_RESERVED_STREAMS};
use crate::container::properties::{ITEM_LAYOUT, MERKLE_ALGORITHM};
use crate::container::{ClusterContainer, ContainerStats};
use crate::error::{Result, StoreError};
use crate::events::{Mutation, MutationListener};
use crate::hashing::HashAlgorithm;
use crate::merkle::{MerkleTreeStore, Proof};
use crate::records::{RecordLayout, RecordStore};
use crate::serializer::ItemSerializer;
use crate::storage::Storage;
use tracing::{debug, info, warn};

type Listeners<T, S> = Vec<Box<dyn MutationListener<T, S>>>;

/// Persistent list of nullable items
///
/// Indices are positions: `insert` and `remove_at` shift later items.
/// `reap` keeps the slot and drops the item, so later indices stay put.
///
/// # Example
///
/// ```
/// use clustered_streams::{CollectionBuilder, HashAlgorithm, MemoryStorage, StreamMappedList, StringSerializer};
///
/// let config = CollectionBuilder::new()
///     .merkleized(HashAlgorithm::Sha256)
///     .build()
///     .unwrap();
/// let mut list = StreamMappedList::create(MemoryStorage::new(), StringSerializer, config).unwrap();
///
/// list.add(&"alpha".to_string()).unwrap();
/// list.add(&"beta".to_string()).unwrap();
/// list.reap(0).unwrap();
///
/// assert_eq!(list.get(0).unwrap(), None);
/// assert_eq!(list.read(1).unwrap(), "beta");
/// assert!(list.merkle_root().unwrap().is_some());
/// ```
pub struct StreamMappedList<T, Ser, S: Storage> {
    container: ClusterContainer<S>,
    serializer: Ser,
    items: RecordStore,
    merkle: Option<MerkleTreeStore>,
    listeners: Listeners<T, S>,
}

impl<T, Ser: ItemSerializer<T>, S: Storage> StreamMappedList<T, Ser, S> {
    /// Format `storage` as an empty list
    pub fn create(storage: S, serializer: Ser, config: CollectionConfig) -> Result<Self> {
        config.validate()?;
        let layout = RecordLayout::for_constant_size(serializer.constant_size());

        let mut container = ClusterContainer::create(storage, config.container.clone())?;
        container.with_access_scope(|c| {
            c.write_property(&ITEM_LAYOUT, &layout.tag())?;
            c.write_property(&MERKLE_ALGORITHM, &config.merkle.map_or(0, HashAlgorithm::id))
        })?;

        let mut list = Self::assemble(container, serializer, layout, config.merkle);
        list.attach_merkle()?;
        info!("Created list: {:?} records, Merkle {:?}", layout, config.merkle);
        Ok(list)
    }

    /// Open a list written with the same serializer layout and Merkle
    /// algorithm
    pub fn open(storage: S, serializer: Ser, config: CollectionConfig) -> Result<Self> {
        config.validate()?;
        let layout = RecordLayout::for_constant_size(serializer.constant_size());

        let mut container = ClusterContainer::open(storage, config.container.clone())?;
        if container.reserved_stream_count() < MIN_COLLECTION_RESERVED_STREAMS as u64 {
            return Err(StoreError::InvalidConfig(format!(
                "container has {} reserved streams, collections need {}",
                container.reserved_stream_count(),
                MIN_COLLECTION_RESERVED_STREAMS
            )));
        }

        match RecordLayout::from_tag(container.read_property(&ITEM_LAYOUT)?) {
            Some(stored) if stored == layout => {}
            Some(stored) => {
                return Err(StoreError::InvalidConfig(format!(
                    "items were written as {:?}, serializer produces {:?}",
                    stored, layout
                )))
            }
            None => {
                return Err(StoreError::Corruption(
                    "container holds no collection (item layout unset)".into(),
                ))
            }
        }

        let stored = HashAlgorithm::from_id(container.read_property(&MERKLE_ALGORITHM)?)?;
        if stored != config.merkle {
            return Err(StoreError::InvalidConfig(format!(
                "list was written with Merkle {:?}, config asks for {:?}",
                stored, config.merkle
            )));
        }

        let mut list = Self::assemble(container, serializer, layout, config.merkle);
        list.attach_merkle()?;
        info!("Opened list: {} items", list.len()?);
        Ok(list)
    }

    fn assemble(
        container: ClusterContainer<S>,
        serializer: Ser,
        layout: RecordLayout,
        merkle: Option<HashAlgorithm>,
    ) -> Self {
        StreamMappedList {
            container,
            serializer,
            items: RecordStore::new(ITEMS_STREAM, layout),
            merkle: merkle.map(|algorithm| MerkleTreeStore::new(algorithm, MERKLE_LEAVES_STREAM)),
            listeners: Vec::new(),
        }
    }

    fn attach_merkle(&mut self) -> Result<()> {
        let count = self.len()?;
        if let Some(merkle) = self.merkle.as_mut() {
            if !MutationListener::<T, S>::attach(merkle, &mut self.container, count)? {
                debug!("Merkle leaves out of step, replaying {} items", count);
                replay::<T, _, _, _>(&mut self.container, &self.items, &self.serializer, merkle)?;
            }
        }
        Ok(())
    }

    pub fn serializer(&self) -> &Ser {
        &self.serializer
    }

    pub fn container(&self) -> &ClusterContainer<S> {
        &self.container
    }

    pub fn layout(&self) -> RecordLayout {
        self.items.layout()
    }

    /// Number of slots, reaped ones included
    pub fn len(&self) -> Result<u64> {
        self.items.count(&self.container)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ---------------------------------------------------------------------
    // Listeners
    // ---------------------------------------------------------------------

    /// Register a listener; it is notified after the Merkle store and every
    /// listener registered before it
    ///
    /// A listener that persists state must be anchored on a reserved stream
    /// from [`FIRST_USER_STREAM`] up that no other listener uses. When its
    /// persisted state does not match the list, every item is replayed into
    /// it first.
    pub fn attach_listener<L: MutationListener<T, S> + 'static>(&mut self, listener: L) -> Result<()> {
        self.register(listener, FIRST_USER_STREAM)
    }

    /// Register the dictionary key index, which lives below the user streams
    pub(crate) fn attach_key_index<L: MutationListener<T, S> + 'static>(&mut self, listener: L) -> Result<()> {
        self.register(listener, KEY_INDEX_STREAM)
    }

    fn register<L: MutationListener<T, S> + 'static>(&mut self, mut listener: L, lowest: u64) -> Result<()> {
        if let Some(anchor) = listener.anchor_stream() {
            self.check_anchor(anchor, lowest)?;
        }
        let count = self.len()?;
        if !listener.attach(&mut self.container, count)? {
            debug!("Listener out of step, replaying {} items", count);
            replay::<T, _, _, _>(&mut self.container, &self.items, &self.serializer, &mut listener)?;
        }
        self.listeners.push(Box::new(listener));
        Ok(())
    }

    /// Detach and drop every registered listener
    pub fn detach_listeners(&mut self) {
        for mut listener in self.listeners.drain(..) {
            listener.detach();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn check_anchor(&self, anchor: u64, lowest: u64) -> Result<()> {
        let reserved = self.container.reserved_stream_count();
        if anchor < lowest || anchor >= reserved {
            return Err(StoreError::InvalidArgument(format!(
                "listener anchor {} outside reserved streams {}..{}",
                anchor, lowest, reserved
            )));
        }
        if self.listeners.iter().any(|l| l.anchor_stream() == Some(anchor)) {
            return Err(StoreError::InvalidArgument(format!(
                "stream {} already anchors a listener",
                anchor
            )));
        }
        Ok(())
    }

    /// Reload the Merkle store and every listener from the container after
    /// a failed mutation was rolled back
    fn resync(&mut self) -> Result<()> {
        let count = self.len()?;
        if let Some(merkle) = self.merkle.as_mut() {
            if !MutationListener::<T, S>::attach(merkle, &mut self.container, count)? {
                replay::<T, _, _, _>(&mut self.container, &self.items, &self.serializer, merkle)?;
            }
        }
        for listener in self.listeners.iter_mut() {
            if !listener.attach(&mut self.container, count)? {
                replay::<T, _, _, _>(&mut self.container, &self.items, &self.serializer, listener.as_mut())?;
            }
        }
        Ok(())
    }

    /// Pass `result` through, resyncing listeners when it is an error the
    /// container rolled back
    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            if !e.is_fatal() && !self.container.is_poisoned() {
                warn!("List mutation failed ({}), reloading listeners", e);
                self.resync()?;
            }
        }
        result
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Append an item and return its index
    pub fn add(&mut self, item: &T) -> Result<u64> {
        let bytes = self.encode(item)?;
        let index = self.len()?;
        self.apply(
            Mutation::Add {
                index,
                item,
                bytes: &bytes,
            },
            |c, items| items.push(c, Some(&bytes)).map(|_| ()),
        )?;
        Ok(index)
    }

    /// Insert an item at `index` (`index == len` appends)
    pub fn insert(&mut self, index: u64, item: &T) -> Result<()> {
        let count = self.len()?;
        if index > count {
            return Err(StoreError::IndexOutOfRange { index, count });
        }
        let bytes = self.encode(item)?;
        self.apply(
            Mutation::Insert {
                index,
                item,
                bytes: &bytes,
            },
            |c, items| items.insert(c, index, Some(&bytes)),
        )
    }

    /// Replace the item at `index`; a reaped slot is filled again
    pub fn update(&mut self, index: u64, item: &T) -> Result<()> {
        self.check_index(index)?;
        let bytes = self.encode(item)?;
        self.apply(
            Mutation::Update {
                index,
                item,
                bytes: &bytes,
            },
            |c, items| items.update(c, index, Some(&bytes)),
        )
    }

    /// Remove the slot at `index`, shifting later items down
    pub fn remove_at(&mut self, index: u64) -> Result<()> {
        self.check_index(index)?;
        self.apply(Mutation::Remove { index }, |c, items| items.remove(c, index))
    }

    /// Drop the item at `index` but keep its slot
    pub fn reap(&mut self, index: u64) -> Result<()> {
        if self.is_reaped(index)? {
            return Ok(());
        }
        self.apply(Mutation::Reap { index }, |c, items| items.update(c, index, None))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.validate(&Mutation::Clearing)?;

        let items = self.items;
        let merkle = &mut self.merkle;
        let listeners = &mut self.listeners;
        let result = self.container.with_access_scope(|c| {
            broadcast(c, merkle, listeners, &Mutation::Clearing)?;
            items.clear(c)?;
            broadcast(c, merkle, listeners, &Mutation::Cleared)
        });
        self.settle(result)?;
        debug!("Cleared list");
        Ok(())
    }

    /// Run several operations under one access scope and one commit
    ///
    /// When `f` fails, every change it made is rolled back.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let result = ClusterContainer::scoped(self, |list| &mut list.container, f);
        self.settle(result)
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>> {
        let bytes = self.serializer.to_bytes(item)?;
        if let RecordLayout::Packed { payload_size } = self.items.layout() {
            if bytes.len() != payload_size {
                return Err(StoreError::Serialization(format!(
                    "constant-size serializer produced {} bytes, expected {}",
                    bytes.len(),
                    payload_size
                )));
            }
        }
        Ok(bytes)
    }

    fn check_index(&self, index: u64) -> Result<()> {
        let count = self.len()?;
        if index >= count {
            return Err(StoreError::IndexOutOfRange { index, count });
        }
        Ok(())
    }

    fn validate(&self, mutation: &Mutation<'_, T>) -> Result<()> {
        if let Some(merkle) = &self.merkle {
            MutationListener::<T, S>::validate(merkle, mutation)?;
        }
        for listener in &self.listeners {
            listener.validate(mutation)?;
        }
        Ok(())
    }

    /// Validate, write the item table, notify; one access scope, rolled
    /// back as a whole when any step fails
    fn apply(
        &mut self,
        mutation: Mutation<'_, T>,
        write: impl FnOnce(&mut ClusterContainer<S>, &RecordStore) -> Result<()>,
    ) -> Result<()> {
        self.validate(&mutation)?;

        let items = self.items;
        let merkle = &mut self.merkle;
        let listeners = &mut self.listeners;
        let result = self.container.with_access_scope(|c| {
            write(c, &items)?;
            broadcast(c, merkle, listeners, &mutation)
        });
        self.settle(result)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Item at `index`; fails with `ItemReaped` on a reaped slot
    pub fn read(&mut self, index: u64) -> Result<T> {
        self.get(index)?.ok_or(StoreError::ItemReaped(index))
    }

    /// Item at `index`, `None` when reaped
    pub fn get(&mut self, index: u64) -> Result<Option<T>> {
        self.items
            .read(&mut self.container, index)?
            .map(|bytes| self.serializer.deserialize(&bytes))
            .transpose()
    }

    pub fn is_reaped(&mut self, index: u64) -> Result<bool> {
        self.items.is_vacant(&mut self.container, index)
    }

    /// Indices of reaped slots, ascending
    pub fn reaped_indices(&mut self) -> Result<Vec<u64>> {
        self.items.vacancies(&mut self.container)
    }

    /// Live items with their indices
    pub fn iter(&mut self) -> Result<Iter<'_, T, Ser, S>> {
        let end = self.len()?;
        Ok(Iter {
            list: self,
            next: 0,
            end,
        })
    }

    // ---------------------------------------------------------------------
    // Merkle
    // ---------------------------------------------------------------------

    pub fn merkle_algorithm(&self) -> Option<HashAlgorithm> {
        self.merkle.as_ref().map(|m| m.algorithm())
    }

    /// Merkle store of a Merkleized list
    pub fn merkle(&mut self) -> Result<&mut MerkleTreeStore> {
        self.merkle
            .as_mut()
            .ok_or_else(|| StoreError::InvalidArgument("list is not Merkleized".into()))
    }

    /// Root over every slot (reaped slots hash as the zero digest); `None`
    /// for an empty list
    pub fn merkle_root(&mut self) -> Result<Option<Vec<u8>>> {
        let merkle = self
            .merkle
            .as_mut()
            .ok_or_else(|| StoreError::InvalidArgument("list is not Merkleized".into()))?;
        merkle.root(&mut self.container)
    }

    pub fn existence_proof(&mut self, index: u64) -> Result<Proof> {
        self.merkle()?.existence_proof(index)
    }

    // ---------------------------------------------------------------------
    // Storage
    // ---------------------------------------------------------------------

    pub fn flush(&mut self) -> Result<()> {
        self.container.flush()
    }

    pub fn verify_integrity(&mut self) -> Result<ContainerStats> {
        self.container.verify_integrity()
    }

    /// Detach listeners, flush and hand back the backing storage
    pub fn into_storage(mut self) -> Result<S> {
        self.detach_listeners();
        self.container.flush()?;
        self.container.into_storage()
    }
}

impl<T: PartialEq, Ser: ItemSerializer<T>, S: Storage> StreamMappedList<T, Ser, S> {
    /// Index of the first live item equal to `item`
    pub fn index_of(&mut self, item: &T) -> Result<Option<u64>> {
        for entry in self.iter()? {
            let (index, candidate) = entry?;
            if candidate == *item {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    pub fn contains(&mut self, item: &T) -> Result<bool> {
        Ok(self.index_of(item)?.is_some())
    }

    /// Remove the first live item equal to `item`, shifting later items
    /// down; `false` when there is none
    pub fn remove(&mut self, item: &T) -> Result<bool> {
        match self.index_of(item)? {
            Some(index) => {
                self.remove_at(index)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Notify the Merkle store, then every listener in registration order
fn broadcast<T, S: Storage>(
    c: &mut ClusterContainer<S>,
    merkle: &mut Option<MerkleTreeStore>,
    listeners: &mut Listeners<T, S>,
    mutation: &Mutation<'_, T>,
) -> Result<()> {
    if let Some(merkle) = merkle {
        merkle.notify(c, mutation)?;
    }
    for listener in listeners.iter_mut() {
        listener.notify(c, mutation)?;
    }
    Ok(())
}

/// Feed every slot into `listener` as if the list were rebuilt from empty
fn replay<T, Ser, S, L>(
    c: &mut ClusterContainer<S>,
    items: &RecordStore,
    serializer: &Ser,
    listener: &mut L,
) -> Result<()>
where
    Ser: ItemSerializer<T>,
    S: Storage,
    L: MutationListener<T, S> + ?Sized,
{
    c.with_access_scope(|c| {
        listener.notify(c, &Mutation::Clearing)?;
        listener.notify(c, &Mutation::Cleared)?;
        for (index, record) in items.read_all(c)?.into_iter().enumerate() {
            let index = index as u64;
            match record {
                Some(bytes) => {
                    let item = serializer.deserialize(&bytes)?;
                    listener.notify(
                        c,
                        &Mutation::Add {
                            index,
                            item: &item,
                            bytes: &bytes,
                        },
                    )?;
                }
                None => listener.notify(c, &Mutation::AddReaped { index })?,
            }
        }
        Ok(())
    })
}

/// Iterator over the live items of a list, as `(index, item)`
pub struct Iter<'a, T, Ser, S: Storage> {
    list: &'a mut StreamMappedList<T, Ser, S>,
    next: u64,
    end: u64,
}

impl<T, Ser: ItemSerializer<T>, S: Storage> Iterator for Iter<'_, T, Ser, S> {
    type Item = Result<(u64, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.end {
            let index = self.next;
            self.next += 1;
            match self.list.get(index) {
                Ok(Some(item)) => return Some(Ok((index, item))),
                Ok(None) => continue,
                Err(e) => {
                    self.next = self.end;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
