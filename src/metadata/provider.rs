use super::projection::{LookupProjection, Projection, UniqueProjection};
use crate::container::ClusterContainer;
use crate::error::{Result, StoreError};
use crate::events::{Mutation, MutationListener};
use crate::hashing::Checksummer;
use crate::records::{RecordLayout, RecordStore};
use crate::serializer::{ItemSerializer, U64Serializer};
use crate::storage::Storage;
use std::hash::Hash;
use tracing::debug;

/// Derives a datum from an item
pub type Extractor<T, D> = Box<dyn Fn(&T) -> Result<D> + Send + Sync>;

/// Per-item datums persisted in a reserved stream, projected into an
/// in-memory index
///
/// The datum table is positional: record `i` belongs to item `i`, and a
/// reaped item has a vacant record. The projection is a cache over that
/// table and is rebuilt from it after inserts and removes.
pub struct MetaDataProvider<T, D, C, P> {
    datums: RecordStore,
    codec: C,
    extractor: Extractor<T, D>,
    projection: P,
    values: Vec<Option<D>>,
    attached: bool,
}

pub type UniqueKeyIndex<T, D, C> = MetaDataProvider<T, D, C, UniqueProjection<D>>;
pub type LookupIndex<T, D, C> = MetaDataProvider<T, D, C, LookupProjection<D>>;

/// Lookup from a 64-bit checksum of item-derived bytes to item indices
pub fn checksum_index<T: 'static>(
    anchor: u64,
    checksummer: Checksummer,
    bytes_of: impl Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
) -> LookupIndex<T, u64, U64Serializer> {
    MetaDataProvider::new(anchor, U64Serializer, move |item: &T| {
        Ok(checksummer.checksum(&bytes_of(item)?))
    })
}

impl<T, D, C, P> MetaDataProvider<T, D, C, P>
where
    C: ItemSerializer<D>,
    P: Projection<D>,
{
    /// Provider over reserved stream `anchor`
    pub fn new(
        anchor: u64,
        codec: C,
        extractor: impl Fn(&T) -> Result<D> + Send + Sync + 'static,
    ) -> Self {
        let layout = RecordLayout::for_constant_size(codec.constant_size());
        MetaDataProvider {
            datums: RecordStore::new(anchor, layout),
            codec,
            extractor: Box::new(extractor),
            projection: P::default(),
            values: Vec::new(),
            attached: false,
        }
    }

    pub fn anchor(&self) -> u64 {
        self.datums.anchor()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn projection(&self) -> Result<&P> {
        self.check_attached()?;
        Ok(&self.projection)
    }

    /// Datum of the item at `index`, `None` when reaped
    pub fn datum(&self, index: u64) -> Result<Option<&D>> {
        self.check_attached()?;
        self.values
            .get(index as usize)
            .map(|d| d.as_ref())
            .ok_or(StoreError::IndexOutOfRange {
                index,
                count: self.values.len() as u64,
            })
    }

    pub fn extract(&self, item: &T) -> Result<D> {
        (self.extractor)(item)
    }

    fn check_attached(&self) -> Result<()> {
        if !self.attached {
            return Err(StoreError::Detached);
        }
        Ok(())
    }

    fn encode(&self, datum: &D) -> Result<Vec<u8>> {
        self.codec.to_bytes(datum)
    }

    /// Rebuild values and projection from the datum table
    fn reload<S: Storage>(&mut self, c: &mut ClusterContainer<S>) -> Result<()> {
        let mut values = Vec::new();
        for record in self.datums.read_all(c)? {
            values.push(match record {
                Some(bytes) => Some(self.codec.deserialize(&bytes)?),
                None => None,
            });
        }

        self.projection.clear();
        for (index, value) in values.iter().enumerate() {
            if let Some(datum) = value {
                self.projection.insert(index as u64, datum);
            }
        }
        self.values = values;
        Ok(())
    }

    fn unproject(&mut self, index: u64) {
        if let Some(Some(old)) = self.values.get_mut(index as usize).map(Option::take) {
            self.projection.remove(index, &old);
        }
    }
}

impl<T, D, C> MetaDataProvider<T, D, C, UniqueProjection<D>>
where
    D: Eq + Hash + Clone,
    C: ItemSerializer<D>,
{
    /// Index of the item holding `key`
    pub fn find(&self, key: &D) -> Result<Option<u64>> {
        Ok(self.projection()?.get(key))
    }
}

impl<T, D, C> MetaDataProvider<T, D, C, LookupProjection<D>>
where
    D: Eq + Hash + Clone,
    C: ItemSerializer<D>,
{
    /// Indices of the items carrying `key`, ascending
    pub fn find_all(&self, key: &D) -> Result<Vec<u64>> {
        Ok(self
            .projection()?
            .get(key)
            .map(|indices| indices.iter().copied().collect())
            .unwrap_or_default())
    }
}

impl<T, D, C, P, S> MutationListener<T, S> for MetaDataProvider<T, D, C, P>
where
    C: ItemSerializer<D>,
    P: Projection<D>,
    S: Storage,
{
    fn attach(&mut self, c: &mut ClusterContainer<S>, item_count: u64) -> Result<bool> {
        self.reload(c)?;
        self.attached = true;
        debug!(
            "Attached meta-data provider on stream {}: {} datums for {} items",
            self.anchor(),
            self.values.len(),
            item_count
        );
        Ok(self.values.len() as u64 == item_count)
    }

    fn detach(&mut self) {
        self.projection.clear();
        self.values.clear();
        self.attached = false;
    }

    fn anchor_stream(&self) -> Option<u64> {
        Some(self.datums.anchor())
    }

    fn validate(&self, mutation: &Mutation<'_, T>) -> Result<()> {
        self.check_attached()?;
        match mutation {
            Mutation::Add { item, .. } | Mutation::Insert { item, .. } => {
                self.projection.check(&self.extract(item)?, None)
            }
            Mutation::Update { index, item, .. } => {
                self.projection.check(&self.extract(item)?, Some(*index))
            }
            _ => Ok(()),
        }
    }

    fn notify(&mut self, c: &mut ClusterContainer<S>, mutation: &Mutation<'_, T>) -> Result<()> {
        self.check_attached()?;
        match mutation {
            Mutation::Add { index, item, .. } => {
                let datum = self.extract(item)?;
                self.datums.push(c, Some(&self.encode(&datum)?))?;
                self.projection.insert(*index, &datum);
                self.values.push(Some(datum));
            }
            Mutation::AddReaped { .. } => {
                self.datums.push(c, None)?;
                self.values.push(None);
            }
            Mutation::Update { index, item, .. } => {
                let datum = self.extract(item)?;
                self.datums.update(c, *index, Some(&self.encode(&datum)?))?;
                self.unproject(*index);
                self.projection.insert(*index, &datum);
                self.values[*index as usize] = Some(datum);
            }
            Mutation::Insert { index, item, .. } => {
                let datum = self.extract(item)?;
                self.datums.insert(c, *index, Some(&self.encode(&datum)?))?;
                self.reload(c)?;
            }
            Mutation::Remove { index } => {
                self.datums.remove(c, *index)?;
                self.reload(c)?;
            }
            Mutation::Reap { index } => {
                self.datums.update(c, *index, None)?;
                self.unproject(*index);
            }
            Mutation::Clearing => {}
            Mutation::Cleared => {
                self.datums.clear(c)?;
                self.projection.clear();
                self.values.clear();
            }
        }
        Ok(())
    }
}
