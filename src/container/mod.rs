//! Cluster stream container
//!
//! Maps variable-length logical streams onto fixed-size clusters of a single
//! backing [`Storage`]. Each stream is a singly linked chain of clusters
//! described by a directory record; the directory is itself a chain whose
//! location lives in the header. Freed clusters go onto a LIFO free list and
//! are reused before the storage grows.
//!
//! Structural changes are committed (directory records, then header) when the
//! outermost [`AccessScope`] closes. Every public mutating call opens its own
//! scope, so callers only need explicit scopes to batch several calls into
//! one commit.
//!
//! While a scope is open, the before-image of every overwritten byte range and
//! directory record is journaled. A closure run through
//! [`ClusterContainer::with_access_scope`] that fails with a non-fatal error
//! is rolled back to the state its scope started from.

pub mod cluster;
pub mod directory;
pub mod properties;
pub mod scope;
pub mod stream;

pub use cluster::Geometry;
pub use directory::{StreamRecord, RECORD_SIZE};
pub use properties::{HeaderProperty, PropertySlot, PropertyValue};
pub use scope::AccessScope;
pub use stream::ClusterStream;

use crate::config::ContainerConfig;
use crate::error::{Result, StoreError};
use crate::header::{Header, HEADER_SIZE, NIL};
use crate::storage::Storage;
use lru::LruCache;
use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Reserved stream holding the header extension properties
pub const PROPERTIES_STREAM: u64 = 0;

const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ChainKey {
    Directory,
    Stream(u64),
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKey::Directory => write!(f, "directory"),
            ChainKey::Stream(id) => write!(f, "stream {}", id),
        }
    }
}

/// Before-image of a change made inside an access scope
#[derive(Debug)]
enum Undo {
    Bytes { offset: u64, old: Vec<u8> },
    /// `None` when the record was appended to the directory
    Record { id: u64, old: Option<StreamRecord> },
}

/// State at the start of an access scope
#[derive(Debug, Clone, Copy)]
struct Savepoint {
    journal_len: usize,
    header: Header,
    storage_len: u64,
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    length: u64,
    start: u64,
    end: u64,
}

/// Container statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStats {
    pub cluster_size: u32,
    pub reserved_streams: u32,
    /// Directory slots, empty and reserved ones included
    pub stream_slots: u64,
    /// Live user streams
    pub live_streams: u64,
    pub total_clusters: u64,
    pub free_clusters: u64,
    pub storage_bytes: u64,
}

#[derive(Debug)]
pub struct ClusterContainer<S: Storage> {
    storage: S,
    header: Header,
    geometry: Geometry,
    config: ContainerConfig,
    directory: Vec<StreamRecord>,
    empty_slots: BTreeSet<u64>,
    dirty_records: BTreeSet<u64>,
    header_dirty: bool,
    chain_cache: Option<LruCache<ChainKey, Arc<Vec<u64>>>>,
    journal: Vec<Undo>,
    savepoints: Vec<Savepoint>,
    poisoned: bool,
}

impl<S: Storage> ClusterContainer<S> {
    /// Format `storage` as an empty container
    ///
    /// Any previous content of the storage is discarded. Streams
    /// `0..config.reserved_streams` are created immediately and flagged
    /// reserved.
    pub fn create(mut storage: S, config: ContainerConfig) -> Result<Self> {
        config.validate()?;

        storage.set_len(HEADER_SIZE as u64)?;

        let mut header = Header::new(config.cluster_size, config.reserved_streams);
        header.stream_count = config.reserved_streams as u64;

        let directory: Vec<StreamRecord> = (0..config.reserved_streams)
            .map(|_| StreamRecord::reserved())
            .collect();
        let dirty_records = (0..config.reserved_streams as u64).collect();

        let mut container = ClusterContainer {
            storage,
            geometry: Geometry::new(config.cluster_size),
            header,
            chain_cache: new_chain_cache(config.chain_cache_capacity),
            config,
            directory,
            empty_slots: BTreeSet::new(),
            dirty_records,
            header_dirty: true,
            journal: Vec::new(),
            savepoints: Vec::new(),
            poisoned: false,
        };
        container.commit()?;

        info!(
            "Created container: cluster size {}, {} reserved streams",
            container.header.cluster_size, container.header.reserved_streams
        );

        Ok(container)
    }

    /// Open an existing container
    ///
    /// Geometry comes from the stored header; only the runtime settings of
    /// `config` (stream limit, cache size, verification) apply.
    pub fn open(mut storage: S, config: ContainerConfig) -> Result<Self> {
        config.validate()?;

        let storage_len = storage.len()?;
        if storage_len < HEADER_SIZE as u64 {
            return Err(StoreError::Corruption(format!(
                "storage of {} bytes cannot hold a header",
                storage_len
            )));
        }

        let mut bytes = [0u8; HEADER_SIZE];
        storage.read_at(0, &mut bytes)?;
        let header = Header::from_bytes(&bytes)?;
        let geometry = Geometry::new(header.cluster_size);

        let required = geometry
            .checked_storage_len(header.cluster_count)
            .ok_or_else(|| {
                StoreError::Corruption(format!(
                    "cluster count {} overflows the addressable storage",
                    header.cluster_count
                ))
            })?;
        if storage_len < required {
            return Err(StoreError::Corruption(format!(
                "storage truncated: {} bytes, header describes {}",
                storage_len, required
            )));
        }

        let mut container = ClusterContainer {
            storage,
            header,
            geometry,
            chain_cache: new_chain_cache(config.chain_cache_capacity),
            config,
            directory: Vec::new(),
            empty_slots: BTreeSet::new(),
            dirty_records: BTreeSet::new(),
            header_dirty: false,
            journal: Vec::new(),
            savepoints: Vec::new(),
            poisoned: false,
        };
        container.load_directory()?;

        if container.config.verify_on_open {
            container.verify_integrity()?;
        }

        info!(
            "Opened container: {} stream slots, {} clusters ({} free)",
            container.header.stream_count,
            container.header.cluster_count,
            container.header.free_count
        );

        Ok(container)
    }

    fn load_directory(&mut self) -> Result<()> {
        // bound the allocation by the validated chain before reading it
        self.walk(ChainKey::Directory)?;
        let length = self.header.directory_length;
        let mut bytes = vec![0u8; length as usize];
        self.read_chain(ChainKey::Directory, 0, &mut bytes)?;

        let reserved = self.header.reserved_streams as u64;
        let mut directory = Vec::with_capacity(self.header.stream_count as usize);
        for (id, chunk) in bytes.chunks_exact(RECORD_SIZE).enumerate() {
            let record = StreamRecord::from_bytes(chunk);
            if let Err(StoreError::Corruption(message)) = record.validate(id as u64, reserved) {
                return Err(self.corrupt(message));
            }
            if !record.is_in_use() {
                self.empty_slots.insert(id as u64);
            }
            directory.push(record);
        }

        self.directory = directory;
        debug!(
            "Loaded directory: {} slots, {} empty",
            self.directory.len(),
            self.empty_slots.len()
        );
        Ok(())
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn cluster_size(&self) -> u32 {
        self.header.cluster_size
    }

    pub fn reserved_stream_count(&self) -> u64 {
        self.header.reserved_streams as u64
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Flush and hand back the backing storage
    pub fn into_storage(mut self) -> Result<S> {
        self.storage.flush()?;
        Ok(self.storage)
    }

    pub fn stats(&self) -> ContainerStats {
        let reserved = self.header.reserved_streams as u64;
        let live_streams = self
            .directory
            .iter()
            .skip(reserved as usize)
            .filter(|r| r.is_in_use())
            .count() as u64;

        ContainerStats {
            cluster_size: self.header.cluster_size,
            reserved_streams: self.header.reserved_streams,
            stream_slots: self.header.stream_count,
            live_streams,
            total_clusters: self.header.cluster_count,
            free_clusters: self.header.free_count,
            storage_bytes: self.geometry.storage_len(self.header.cluster_count),
        }
    }

    // ---------------------------------------------------------------------
    // Stream directory
    // ---------------------------------------------------------------------

    /// Allocate an empty user stream, reusing the lowest empty slot
    pub fn create_stream(&mut self) -> Result<u64> {
        self.check_poisoned()?;

        if self.empty_slots.is_empty() && self.header.stream_count >= self.config.max_streams {
            return Err(StoreError::Capacity(format!(
                "stream directory full ({} slots)",
                self.config.max_streams
            )));
        }

        self.with_access_scope(|c| {
            let id = match c.empty_slots.pop_first() {
                Some(id) => {
                    c.journal_record(id);
                    c.directory[id as usize] = StreamRecord::live();
                    id
                }
                None => {
                    let id = c.header.stream_count;
                    c.journal_record(id);
                    c.directory.push(StreamRecord::live());
                    c.header.stream_count += 1;
                    c.header_dirty = true;
                    id
                }
            };
            c.dirty_records.insert(id);
            trace!("Created stream {}", id);
            Ok(id)
        })
    }

    /// Free every cluster of a user stream and mark its slot reusable
    pub fn remove_stream(&mut self, id: u64) -> Result<()> {
        self.check_poisoned()?;
        self.record(id)?;
        if self.is_reserved(id) {
            return Err(StoreError::ReservedStream(id));
        }

        self.with_access_scope(|c| {
            c.set_chain_len(ChainKey::Stream(id), 0, 0)?;
            c.journal_record(id);
            c.directory[id as usize] = StreamRecord::empty();
            c.dirty_records.insert(id);
            c.empty_slots.insert(id);
            if let Some(cache) = c.chain_cache.as_mut() {
                cache.pop(&ChainKey::Stream(id));
            }
            trace!("Removed stream {}", id);
            Ok(())
        })
    }

    pub fn contains_stream(&self, id: u64) -> bool {
        self.directory
            .get(id as usize)
            .map(|r| r.is_in_use())
            .unwrap_or(false)
    }

    pub fn is_reserved(&self, id: u64) -> bool {
        id < self.header.reserved_streams as u64
    }

    /// Live user streams in id order (reserved streams are never listed)
    pub fn streams(&self) -> Vec<u64> {
        self.directory
            .iter()
            .enumerate()
            .skip(self.header.reserved_streams as usize)
            .filter(|(_, r)| r.is_in_use())
            .map(|(id, _)| id as u64)
            .collect()
    }

    pub fn stream_len(&self, id: u64) -> Result<u64> {
        self.check_poisoned()?;
        Ok(self.record(id)?.length)
    }

    /// Seekable view of a stream
    pub fn open_stream(&mut self, id: u64, writable: bool) -> Result<ClusterStream<'_, S>> {
        self.check_poisoned()?;
        self.record(id)?;
        Ok(ClusterStream::new(self, id, writable))
    }

    // ---------------------------------------------------------------------
    // Stream data
    // ---------------------------------------------------------------------

    /// Grow (zero-filled) or shrink a stream
    pub fn resize_stream(&mut self, id: u64, length: u64) -> Result<()> {
        self.check_poisoned()?;
        self.record(id)?;
        self.with_access_scope(|c| c.set_chain_len(ChainKey::Stream(id), length, length))
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&mut self, id: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_poisoned()?;
        let length = self.record(id)?.length;
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > length) {
            return Err(StoreError::InvalidArgument(format!(
                "read of {} bytes at {} past end of stream {} ({} bytes)",
                buf.len(),
                offset,
                id,
                length
            )));
        }
        self.with_access_scope(|c| c.read_chain(ChainKey::Stream(id), offset, buf))
    }

    /// Write `data` at `offset`, extending the stream and zero-filling any gap
    pub fn write_at(&mut self, id: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.check_poisoned()?;
        let length = self.record(id)?.length;
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            StoreError::InvalidArgument(format!("write at {} overflows stream {}", offset, id))
        })?;

        self.with_access_scope(|c| {
            if end > length {
                c.set_chain_len(ChainKey::Stream(id), end, offset)?;
            }
            c.write_chain(ChainKey::Stream(id), offset, data)
        })
    }

    pub fn read_stream(&mut self, id: u64) -> Result<Vec<u8>> {
        let length = self.stream_len(id)?;
        let mut bytes = vec![0u8; length as usize];
        self.read_at(id, 0, &mut bytes)?;
        Ok(bytes)
    }

    /// Replace the whole content of a stream
    pub fn write_stream(&mut self, id: u64, data: &[u8]) -> Result<()> {
        self.check_poisoned()?;
        self.record(id)?;
        self.with_access_scope(|c| {
            c.set_chain_len(ChainKey::Stream(id), data.len() as u64, 0)?;
            c.write_chain(ChainKey::Stream(id), 0, data)
        })
    }

    // ---------------------------------------------------------------------
    // Header extension properties
    // ---------------------------------------------------------------------

    pub fn read_property<T: PropertyValue>(&mut self, property: &HeaderProperty<T>) -> Result<T> {
        let slot = property.slot();
        let length = self.stream_len(PROPERTIES_STREAM)?;
        let mut buf = vec![0u8; slot.size];
        if length > slot.offset {
            let available = (length - slot.offset).min(slot.size as u64) as usize;
            self.read_at(PROPERTIES_STREAM, slot.offset, &mut buf[..available])?;
        }
        T::decode(&buf)
    }

    pub fn write_property<T: PropertyValue>(
        &mut self,
        property: &HeaderProperty<T>,
        value: &T,
    ) -> Result<()> {
        let slot = property.slot();
        let mut buf = vec![0u8; slot.size];
        value.encode(&mut buf)?;
        self.write_at(PROPERTIES_STREAM, slot.offset, &buf)
    }

    // ---------------------------------------------------------------------
    // Access scope
    // ---------------------------------------------------------------------

    /// Hold a scope across several calls so they commit once, on exit
    pub fn enter_access_scope(&mut self) -> Result<AccessScope<'_, S>> {
        self.check_poisoned()?;
        self.begin_scope()?;
        Ok(AccessScope::new(self))
    }

    fn begin_scope(&mut self) -> Result<()> {
        let storage_len = self.storage.len()?;
        self.savepoints.push(Savepoint {
            journal_len: self.journal.len(),
            header: self.header,
            storage_len,
        });
        Ok(())
    }

    fn end_scope(&mut self) -> Result<()> {
        self.savepoints.pop();
        if !self.savepoints.is_empty() {
            return Ok(());
        }
        self.journal.clear();
        if self.poisoned {
            self.dirty_records.clear();
            self.header_dirty = false;
            return Err(StoreError::Poisoned);
        }
        self.commit()
    }

    pub fn scope_depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Run `f` inside an access scope
    ///
    /// Fatal errors poison the container; any other error rolls back what
    /// `f` changed before it is returned.
    pub fn with_access_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        Self::scoped(self, |c| c, f)
    }

    /// Same as [`with_access_scope`](Self::with_access_scope) for an owner
    /// that reaches its container through `project`
    pub(crate) fn scoped<O, T>(
        owner: &mut O,
        project: impl Fn(&mut O) -> &mut Self,
        f: impl FnOnce(&mut O) -> Result<T>,
    ) -> Result<T> {
        let container = project(owner);
        container.check_poisoned()?;
        container.begin_scope()?;

        let result = f(owner);

        let container = project(owner);
        if let Err(e) = &result {
            if e.is_fatal() {
                container.poisoned = true;
            } else if let Err(undo) = container.rollback() {
                error!("Rollback after '{}' failed: {}", e, undo);
                container.poisoned = true;
            }
        }
        let ended = container.end_scope();
        match result {
            Ok(value) => ended.map(|_| value),
            Err(e) => Err(e),
        }
    }

    /// Restore the state the innermost scope started from
    fn rollback(&mut self) -> Result<()> {
        let Some(savepoint) = self.savepoints.last().copied() else {
            return Ok(());
        };
        if self.journal.len() == savepoint.journal_len && self.header == savepoint.header {
            return Ok(());
        }

        let undone = self.journal.split_off(savepoint.journal_len);
        let count = undone.len();
        for undo in undone.into_iter().rev() {
            match undo {
                Undo::Bytes { offset, old } => self.storage.write_at(offset, &old)?,
                Undo::Record { id, old: Some(record) } => self.directory[id as usize] = record,
                Undo::Record { old: None, .. } => {
                    self.directory.pop();
                }
            }
        }
        self.storage.set_len(savepoint.storage_len)?;

        self.header = savepoint.header;
        self.header_dirty = true;
        let slots = self.directory.len() as u64;
        self.dirty_records.retain(|id| *id < slots);
        self.empty_slots = self
            .directory
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_in_use())
            .map(|(id, _)| id as u64)
            .collect();
        if let Some(cache) = self.chain_cache.as_mut() {
            cache.clear();
        }

        warn!("Rolled back {} journaled changes", count);
        Ok(())
    }

    fn journal_record(&mut self, id: u64) {
        if !self.savepoints.is_empty() {
            let old = self.directory.get(id as usize).copied();
            self.journal.push(Undo::Record { id, old });
        }
    }

    /// Write through to storage, keeping the before-image of bytes that
    /// existed when the innermost scope began
    fn write_storage(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(savepoint) = self.savepoints.last() {
            if offset < savepoint.storage_len {
                let n = (savepoint.storage_len - offset).min(data.len() as u64) as usize;
                let mut old = vec![0u8; n];
                self.storage.read_at(offset, &mut old)?;
                self.journal.push(Undo::Bytes { offset, old });
            }
        }
        self.storage.write_at(offset, data)
    }

    /// Persist dirty directory records and the header
    pub fn flush(&mut self) -> Result<()> {
        self.check_poisoned()?;
        self.commit()?;
        self.storage.flush()
    }

    fn commit(&mut self) -> Result<()> {
        if !self.header_dirty && self.dirty_records.is_empty() {
            return Ok(());
        }

        let directory_len = self.header.stream_count * RECORD_SIZE as u64;
        self.set_chain_len(ChainKey::Directory, directory_len, 0)?;

        let dirty = std::mem::take(&mut self.dirty_records);
        for id in &dirty {
            let bytes = self.directory[*id as usize].to_bytes();
            self.write_chain(ChainKey::Directory, id * RECORD_SIZE as u64, &bytes)?;
        }

        self.storage.write_at(0, &self.header.to_bytes())?;
        self.storage.flush()?;
        self.header_dirty = false;

        trace!(
            "Committed header and {} directory records ({} clusters, {} free)",
            dirty.len(),
            self.header.cluster_count,
            self.header.free_count
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Integrity
    // ---------------------------------------------------------------------

    /// Walk every chain and the free list, checking that each cluster has
    /// exactly one owner
    pub fn verify_integrity(&mut self) -> Result<ContainerStats> {
        self.check_poisoned()?;

        const UNOWNED: u8 = 0;
        const OWNED: u8 = 1;
        const FREE: u8 = 2;

        if let Some(cache) = self.chain_cache.as_mut() {
            cache.clear();
        }

        let mut owners = vec![UNOWNED; self.header.cluster_count as usize];

        let mut chains = vec![ChainKey::Directory];
        chains.extend(
            self.directory
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_in_use())
                .map(|(id, _)| ChainKey::Stream(id as u64)),
        );

        for key in chains {
            let chain = self.walk(key)?;
            for cluster in chain.iter() {
                let owner = &mut owners[*cluster as usize];
                if *owner != UNOWNED {
                    let message = format!("cluster {} of {} is owned twice", cluster, key);
                    return Err(self.corrupt(message));
                }
                *owner = OWNED;
            }
        }

        let mut free = 0u64;
        let mut current = self.header.free_head;
        while current != NIL {
            if current >= self.header.cluster_count {
                let message = format!("free list points to cluster {} beyond end", current);
                return Err(self.corrupt(message));
            }
            if free == self.header.free_count {
                let message = format!(
                    "free list longer than free count {}",
                    self.header.free_count
                );
                return Err(self.corrupt(message));
            }
            if owners[current as usize] != UNOWNED {
                let message = format!("free cluster {} is also in use", current);
                return Err(self.corrupt(message));
            }
            owners[current as usize] = FREE;
            free += 1;
            current = self.read_next(current)?;
        }

        if free != self.header.free_count {
            let message = format!(
                "free list has {} clusters, header records {}",
                free, self.header.free_count
            );
            return Err(self.corrupt(message));
        }

        let leaked = owners.iter().filter(|o| **o == UNOWNED).count();
        if leaked > 0 {
            let message = format!("{} clusters are neither free nor owned", leaked);
            return Err(self.corrupt(message));
        }

        debug!(
            "Integrity verified: {} clusters, {} free",
            self.header.cluster_count, free
        );
        Ok(self.stats())
    }

    // ---------------------------------------------------------------------
    // Chains
    // ---------------------------------------------------------------------

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(StoreError::Poisoned);
        }
        Ok(())
    }

    fn record(&self, id: u64) -> Result<&StreamRecord> {
        self.directory
            .get(id as usize)
            .filter(|r| r.is_in_use())
            .ok_or(StoreError::StreamNotFound(id))
    }

    /// Record a corruption and poison the container
    fn corrupt(&mut self, message: String) -> StoreError {
        error!("Container corruption: {}", message);
        self.poisoned = true;
        StoreError::Corruption(message)
    }

    fn extent(&self, key: ChainKey) -> Extent {
        match key {
            ChainKey::Directory => Extent {
                length: self.header.directory_length,
                start: self.header.directory_start,
                end: self.header.directory_end,
            },
            ChainKey::Stream(id) => {
                let record = &self.directory[id as usize];
                Extent {
                    length: record.length,
                    start: record.start,
                    end: record.end,
                }
            }
        }
    }

    fn set_extent(&mut self, key: ChainKey, extent: Extent) {
        match key {
            ChainKey::Directory => {
                self.header.directory_length = extent.length;
                self.header.directory_start = extent.start;
                self.header.directory_end = extent.end;
                self.header_dirty = true;
            }
            ChainKey::Stream(id) => {
                self.journal_record(id);
                let record = &mut self.directory[id as usize];
                record.length = extent.length;
                record.start = extent.start;
                record.end = extent.end;
                self.dirty_records.insert(id);
            }
        }
    }

    fn read_next(&mut self, cluster: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.storage
            .read_at(self.geometry.cluster_offset(cluster), &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_next(&mut self, cluster: u64, next: u64) -> Result<()> {
        self.write_storage(self.geometry.cluster_offset(cluster), &next.to_le_bytes())
    }

    /// Cluster ids of a chain in order, validated against its extent
    fn walk(&mut self, key: ChainKey) -> Result<Arc<Vec<u64>>> {
        if let Some(chain) = self.chain_cache.as_mut().and_then(|c| c.get(&key)) {
            return Ok(Arc::clone(chain));
        }

        let extent = self.extent(key);
        let expected = self.geometry.clusters_for(extent.length);
        if expected > self.header.cluster_count {
            let message = format!(
                "{} length {} needs {} clusters, container has {}",
                key, extent.length, expected, self.header.cluster_count
            );
            return Err(self.corrupt(message));
        }

        let mut chain = Vec::with_capacity(expected as usize);
        let mut current = extent.start;
        while current != NIL {
            if current >= self.header.cluster_count {
                let message = format!("{} has dangling pointer to cluster {}", key, current);
                return Err(self.corrupt(message));
            }
            if chain.len() as u64 == expected {
                let message = format!(
                    "{} chain runs past {} clusters (cycle or length mismatch)",
                    key, expected
                );
                return Err(self.corrupt(message));
            }
            chain.push(current);
            current = self.read_next(current)?;
        }

        if chain.len() as u64 != expected {
            let message = format!(
                "{} chain has {} clusters, length {} requires {}",
                key,
                chain.len(),
                extent.length,
                expected
            );
            return Err(self.corrupt(message));
        }

        if chain.last().copied().unwrap_or(NIL) != extent.end {
            let message = format!("{} tail does not match directory ({})", key, extent.end);
            return Err(self.corrupt(message));
        }

        let chain = Arc::new(chain);
        if let Some(cache) = self.chain_cache.as_mut() {
            cache.put(key, Arc::clone(&chain));
        }
        Ok(chain)
    }

    /// Take a cluster from the free list, or append one to the storage
    fn allocate(&mut self) -> Result<u64> {
        self.header_dirty = true;

        if self.header.free_head != NIL {
            let cluster = self.header.free_head;
            if cluster >= self.header.cluster_count || self.header.free_count == 0 {
                let message = format!(
                    "free list head {} invalid ({} free of {})",
                    cluster, self.header.free_count, self.header.cluster_count
                );
                return Err(self.corrupt(message));
            }
            let next = self.read_next(cluster)?;
            if next != NIL && next >= self.header.cluster_count {
                let message = format!("free cluster {} links to {}", cluster, next);
                return Err(self.corrupt(message));
            }
            self.header.free_head = next;
            self.header.free_count -= 1;
            trace!("Recycled cluster {}", cluster);
            return Ok(cluster);
        }

        let cluster = self.header.cluster_count;
        self.header.cluster_count += 1;
        self.storage
            .set_len(self.geometry.storage_len(self.header.cluster_count))?;
        Ok(cluster)
    }

    /// Push a linked run of clusters onto the free list
    fn release(&mut self, run: &[u64]) -> Result<()> {
        let (Some(&first), Some(&last)) = (run.first(), run.last()) else {
            return Ok(());
        };
        self.write_next(last, self.header.free_head)?;
        self.header.free_head = first;
        self.header.free_count += run.len() as u64;
        self.header_dirty = true;
        Ok(())
    }

    /// Resize a chain; bytes in `old_len..min(zero_until, new_len)` are zeroed
    fn set_chain_len(&mut self, key: ChainKey, new_len: u64, zero_until: u64) -> Result<()> {
        let extent = self.extent(key);
        if new_len == extent.length {
            return Ok(());
        }

        let old_count = self.geometry.clusters_for(extent.length);
        let new_count = self.geometry.clusters_for(new_len);
        let mut clusters = self.walk(key)?.as_ref().clone();

        if new_count > old_count {
            let mut fresh = Vec::with_capacity((new_count - old_count) as usize);
            for _ in old_count..new_count {
                fresh.push(self.allocate()?);
            }
            if let Some(&tail) = clusters.last() {
                self.write_next(tail, fresh[0])?;
            }
            for pair in fresh.windows(2) {
                self.write_next(pair[0], pair[1])?;
            }
            if let Some(&last) = fresh.last() {
                self.write_next(last, NIL)?;
            }
            clusters.extend(fresh);
        } else if new_count < old_count {
            let detached = clusters.split_off(new_count as usize);
            if let Some(&tail) = clusters.last() {
                self.write_next(tail, NIL)?;
            }
            self.release(&detached)?;
            debug!("Released {} clusters from {}", detached.len(), key);
        }

        self.set_extent(
            key,
            Extent {
                length: new_len,
                start: clusters.first().copied().unwrap_or(NIL),
                end: clusters.last().copied().unwrap_or(NIL),
            },
        );
        if let Some(cache) = self.chain_cache.as_mut() {
            cache.put(key, Arc::new(clusters));
        }

        let zero_end = zero_until.min(new_len);
        if zero_end > extent.length {
            self.zero_chain(key, extent.length, zero_end)?;
        }
        Ok(())
    }

    fn zero_chain(&mut self, key: ChainKey, from: u64, to: u64) -> Result<()> {
        let zeros = vec![0u8; ((to - from) as usize).min(ZERO_CHUNK)];
        let mut position = from;
        while position < to {
            let n = ((to - position) as usize).min(zeros.len());
            self.write_chain(key, position, &zeros[..n])?;
            position += n as u64;
        }
        Ok(())
    }

    fn read_chain(&mut self, key: ChainKey, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let chain = self.walk(key)?;
        let mut done = 0usize;
        while done < buf.len() {
            let (index, within) = self.geometry.locate(offset + done as u64);
            let cluster = chain_cluster(&chain, index, key)?;
            let n = ((self.geometry.cluster_size() - within) as usize).min(buf.len() - done);
            self.storage.read_at(
                self.geometry.payload_offset(cluster) + within,
                &mut buf[done..done + n],
            )?;
            done += n;
        }
        Ok(())
    }

    fn write_chain(&mut self, key: ChainKey, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let chain = self.walk(key)?;
        let mut done = 0usize;
        while done < data.len() {
            let (index, within) = self.geometry.locate(offset + done as u64);
            let cluster = chain_cluster(&chain, index, key)?;
            let n = ((self.geometry.cluster_size() - within) as usize).min(data.len() - done);
            self.write_storage(
                self.geometry.payload_offset(cluster) + within,
                &data[done..done + n],
            )?;
            done += n;
        }
        Ok(())
    }
}

fn chain_cluster(chain: &[u64], index: u64, key: ChainKey) -> Result<u64> {
    chain.get(index as usize).copied().ok_or_else(|| {
        StoreError::Corruption(format!(
            "{} has no cluster at position {} ({} clusters)",
            key,
            index,
            chain.len()
        ))
    })
}

fn new_chain_cache(capacity: usize) -> Option<LruCache<ChainKey, Arc<Vec<u64>>>> {
    NonZeroUsize::new(capacity).map(LruCache::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn config(cluster_size: u32) -> ContainerConfig {
        ContainerConfig {
            cluster_size,
            reserved_streams: 4,
            ..ContainerConfig::default()
        }
    }

    fn container(cluster_size: u32) -> ClusterContainer<MemoryStorage> {
        ClusterContainer::create(MemoryStorage::new(), config(cluster_size)).unwrap()
    }

    fn reopen(c: ClusterContainer<MemoryStorage>) -> ClusterContainer<MemoryStorage> {
        let storage = c.into_storage().unwrap();
        ClusterContainer::open(storage, config(16)).unwrap()
    }

    #[test]
    fn test_create_reserves_streams() {
        let c = container(32);
        assert_eq!(c.reserved_stream_count(), 4);
        assert!(c.streams().is_empty());
        for id in 0..4 {
            assert!(c.contains_stream(id));
            assert!(c.is_reserved(id));
            assert_eq!(c.stream_len(id).unwrap(), 0);
        }
        assert!(!c.contains_stream(4));
    }

    #[test]
    fn test_create_and_list_streams() {
        let mut c = container(32);
        let a = c.create_stream().unwrap();
        let b = c.create_stream().unwrap();
        assert_eq!((a, b), (4, 5));
        assert_eq!(c.streams(), vec![4, 5]);
        assert_eq!(c.stats().live_streams, 2);
    }

    #[test]
    fn test_write_read_across_clusters() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        c.write_stream(id, &data).unwrap();
        assert_eq!(c.stream_len(id).unwrap(), 100);
        assert_eq!(c.read_stream(id).unwrap(), data);

        let mut buf = [0u8; 20];
        c.read_at(id, 10, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[10..30]);
        // 7 data clusters plus 10 holding five 32-byte directory records
        assert_eq!(c.stats().total_clusters, 7 + 10);
    }

    #[test]
    fn test_write_past_end_zero_fills_gap() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();
        c.write_at(id, 0, b"abc").unwrap();
        c.write_at(id, 40, b"xyz").unwrap();

        let bytes = c.read_stream(id).unwrap();
        assert_eq!(bytes.len(), 43);
        assert_eq!(&bytes[..3], b"abc");
        assert!(bytes[3..40].iter().all(|b| *b == 0));
        assert_eq!(&bytes[40..], b"xyz");
    }

    #[test]
    fn test_read_past_end_is_usage_error() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();
        c.write_stream(id, b"hello").unwrap();
        let mut buf = [0u8; 6];
        assert!(matches!(
            c.read_at(id, 0, &mut buf),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(!c.is_poisoned());
    }

    #[test]
    fn test_resize_shrink_and_regrow_zeroes() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();
        c.write_stream(id, &[0xff; 40]).unwrap();

        c.resize_stream(id, 5).unwrap();
        assert_eq!(c.stats().free_clusters, 2);

        c.resize_stream(id, 40).unwrap();
        let bytes = c.read_stream(id).unwrap();
        assert_eq!(&bytes[..5], &[0xff; 5]);
        assert!(bytes[5..].iter().all(|b| *b == 0));
        assert_eq!(c.stats().free_clusters, 0);
    }

    #[test]
    fn test_resize_to_zero_keeps_slot() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();
        c.write_stream(id, &[1; 50]).unwrap();
        c.resize_stream(id, 0).unwrap();
        assert!(c.contains_stream(id));
        assert_eq!(c.stream_len(id).unwrap(), 0);
        assert_eq!(c.stats().free_clusters, 4);
    }

    #[test]
    fn test_remove_reuses_slot_and_clusters() {
        let mut c = container(16);
        let a = c.create_stream().unwrap();
        let b = c.create_stream().unwrap();
        c.write_stream(a, &[1; 64]).unwrap();
        c.write_stream(b, &[2; 16]).unwrap();
        let clusters = c.stats().total_clusters;

        c.remove_stream(a).unwrap();
        assert!(!c.contains_stream(a));
        assert_eq!(c.stats().free_clusters, 4);

        let reused = c.create_stream().unwrap();
        assert_eq!(reused, a);
        c.write_stream(reused, &[3; 48]).unwrap();
        assert_eq!(c.stats().total_clusters, clusters);
        assert_eq!(c.stats().free_clusters, 1);
        assert_eq!(c.read_stream(b).unwrap(), vec![2; 16]);
        c.verify_integrity().unwrap();
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut c = container(16);
        let a = c.create_stream().unwrap();
        let b = c.create_stream().unwrap();
        c.write_stream(a, &[1; 16]).unwrap();
        c.write_stream(b, &[2; 16]).unwrap();
        let cluster_a = c.directory[a as usize].start;
        let cluster_b = c.directory[b as usize].start;

        c.remove_stream(a).unwrap();
        c.remove_stream(b).unwrap();

        let d = c.create_stream().unwrap();
        c.write_stream(d, &[3; 16]).unwrap();
        assert_eq!(c.directory[d as usize].start, cluster_b);

        let e = c.create_stream().unwrap();
        c.write_stream(e, &[4; 16]).unwrap();
        assert_eq!(c.directory[e as usize].start, cluster_a);
    }

    #[test]
    fn test_reserved_stream_cannot_be_removed() {
        let mut c = container(16);
        assert!(matches!(
            c.remove_stream(1),
            Err(StoreError::ReservedStream(1))
        ));
        assert!(matches!(
            c.remove_stream(99),
            Err(StoreError::StreamNotFound(99))
        ));
    }

    #[test]
    fn test_capacity_error() {
        let mut c = ClusterContainer::create(
            MemoryStorage::new(),
            ContainerConfig {
                reserved_streams: 2,
                max_streams: 3,
                ..ContainerConfig::default()
            },
        )
        .unwrap();
        let id = c.create_stream().unwrap();
        assert!(matches!(c.create_stream(), Err(StoreError::Capacity(_))));

        c.remove_stream(id).unwrap();
        assert_eq!(c.create_stream().unwrap(), id);
    }

    #[test]
    fn test_reopen_preserves_streams() {
        let mut c = container(16);
        let a = c.create_stream().unwrap();
        let b = c.create_stream().unwrap();
        c.write_stream(a, b"persisted across reopen").unwrap();
        c.remove_stream(b).unwrap();

        let mut c = reopen(c);
        assert_eq!(c.cluster_size(), 16);
        assert_eq!(c.streams(), vec![a]);
        assert_eq!(c.read_stream(a).unwrap(), b"persisted across reopen");
        assert_eq!(c.create_stream().unwrap(), b);
        c.verify_integrity().unwrap();
    }

    #[test]
    fn test_directory_spans_clusters() {
        let mut c = container(16);
        let ids: Vec<u64> = (0..20).map(|_| c.create_stream().unwrap()).collect();
        for id in &ids {
            c.write_stream(*id, &id.to_le_bytes()).unwrap();
        }

        let mut c = reopen(c);
        for id in &ids {
            assert_eq!(c.read_stream(*id).unwrap(), id.to_le_bytes());
        }
        c.verify_integrity().unwrap();
    }

    #[test]
    fn test_properties_default_to_zero() {
        let mut c = container(16);
        assert_eq!(c.read_property(&properties::ITEM_LAYOUT).unwrap(), 0);
        assert_eq!(c.read_property(&properties::MERKLE_ROOT).unwrap(), None);

        c.write_property(&properties::MERKLE_ALGORITHM, &2).unwrap();
        assert_eq!(c.read_property(&properties::MERKLE_ALGORITHM).unwrap(), 2);
        assert_eq!(c.read_property(&properties::ITEM_LAYOUT).unwrap(), 0);
        assert_eq!(c.stream_len(PROPERTIES_STREAM).unwrap(), 77);

        c.write_property(&properties::MERKLE_ROOT, &Some(vec![7; 32]))
            .unwrap();
        let mut c = reopen(c);
        assert_eq!(
            c.read_property(&properties::MERKLE_ROOT).unwrap(),
            Some(vec![7; 32])
        );
    }

    #[test]
    fn test_access_scope_defers_commit() {
        let mut c = container(16);
        let header_before = c.storage().as_bytes()[..HEADER_SIZE].to_vec();
        {
            let mut scope = c.enter_access_scope().unwrap();
            let id = scope.create_stream().unwrap();
            scope.write_stream(id, b"deferred").unwrap();
            assert_eq!(scope.scope_depth(), 1);
            assert_eq!(&scope.storage().as_bytes()[..HEADER_SIZE], &header_before[..]);
            scope.exit().unwrap();
        }
        assert_eq!(c.scope_depth(), 0);
        assert_ne!(&c.storage().as_bytes()[..HEADER_SIZE], &header_before[..]);

        let mut c = reopen(c);
        assert_eq!(c.read_stream(4).unwrap(), b"deferred");
    }

    #[test]
    fn test_nested_scopes_commit_once_outermost() {
        let mut c = container(16);
        let mut outer = c.enter_access_scope().unwrap();
        {
            let inner = outer.enter_access_scope().unwrap();
            assert_eq!(inner.scope_depth(), 2);
            inner.exit().unwrap();
        }
        assert_eq!(outer.scope_depth(), 1);
        drop(outer);
        assert_eq!(c.scope_depth(), 0);
    }

    #[test]
    fn test_failed_scope_rolls_back() {
        let mut c = container(16);
        let keep = c.create_stream().unwrap();
        c.write_stream(keep, &[1; 40]).unwrap();
        let spare = c.create_stream().unwrap();
        c.write_stream(spare, &[2; 40]).unwrap();
        c.remove_stream(spare).unwrap();
        let before = c.storage().as_bytes().to_vec();
        let stats = c.stats();

        let err = c
            .with_access_scope(|c| {
                // overwrite in place, recycle the free list, then grow the storage
                c.write_at(keep, 8, &[9; 60])?;
                let id = c.create_stream()?;
                c.write_stream(id, &[3; 100])?;
                Err::<(), _>(StoreError::InvalidArgument("abandoned".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(!c.is_poisoned());
        assert_eq!(c.scope_depth(), 0);

        assert_eq!(c.stats(), stats);
        assert_eq!(c.storage().as_bytes(), &before[..]);
        assert_eq!(c.read_stream(keep).unwrap(), vec![1; 40]);
        assert_eq!(c.create_stream().unwrap(), spare);
        c.verify_integrity().unwrap();
    }

    #[test]
    fn test_nested_failure_rolls_back_to_inner_scope() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();

        c.with_access_scope(|c| {
            c.write_stream(id, b"outer")?;
            let inner = c.with_access_scope(|c| {
                c.write_stream(id, &[7; 64])?;
                c.create_stream()?;
                Err::<(), _>(StoreError::InvalidArgument("inner".into()))
            });
            assert!(inner.is_err());
            assert_eq!(c.scope_depth(), 1);
            assert_eq!(c.read_stream(id)?, b"outer");
            assert_eq!(c.streams(), vec![id]);
            Ok(())
        })
        .unwrap();

        let mut c = reopen(c);
        assert_eq!(c.read_stream(id).unwrap(), b"outer");
        c.verify_integrity().unwrap();
    }

    #[test]
    fn test_open_rejects_garbage() {
        let storage = MemoryStorage::from_bytes(vec![0u8; 200]);
        assert!(matches!(
            ClusterContainer::open(storage, config(16)),
            Err(StoreError::InvalidMagic)
        ));

        let storage = MemoryStorage::from_bytes(vec![0u8; 10]);
        assert!(ClusterContainer::open(storage, config(16)).is_err());
    }

    #[test]
    fn test_cycle_poisons_container() {
        let mut c = container(16);
        let id = c.create_stream().unwrap();
        c.write_stream(id, &[5; 48]).unwrap();
        let chain = c.walk(ChainKey::Stream(id)).unwrap();

        let mut storage = c.into_storage().unwrap();
        // point the tail back at the head
        let offset = Geometry::new(16).cluster_offset(chain[2]) as usize;
        storage.bytes_mut()[offset..offset + 8].copy_from_slice(&chain[0].to_le_bytes());

        let mut c = ClusterContainer::open(storage, config(16)).unwrap();
        assert!(matches!(c.read_stream(id), Err(StoreError::Corruption(_))));
        assert!(c.is_poisoned());
        assert!(matches!(c.create_stream(), Err(StoreError::Poisoned)));
    }
}
