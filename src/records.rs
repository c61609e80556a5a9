//! Nullable record tables anchored in a reserved stream
//!
//! Two layouts:
//!
//! - **Packed**: fixed-size slots `[flag: u8][payload]` laid end to end in the
//!   anchor stream, so record `i` sits at `i * (1 + payload_size)`.
//! - **Chained**: the anchor stream is a table of `u64` stream ids, one per
//!   record; each record's bytes live in their own stream, whose directory
//!   length doubles as the record's length prefix. `NIL` marks a vacant
//!   record.
//!
//! Insert and remove shift the records after the affected index. Both run
//! inside one access scope, so a reader never sees a half-shifted table.

use crate::container::ClusterContainer;
use crate::error::{Result, StoreError};
use crate::header::{read_u64, NIL};
use crate::storage::Storage;

const FLAG_VACANT: u8 = 0;
const FLAG_PRESENT: u8 = 1;
const TABLE_ENTRY_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Packed { payload_size: usize },
    Chained,
}

impl RecordLayout {
    /// Packed when the encoding is constant-size, chained otherwise
    pub fn for_constant_size(constant_size: Option<usize>) -> Self {
        match constant_size {
            Some(payload_size) => RecordLayout::Packed { payload_size },
            None => RecordLayout::Chained,
        }
    }

    /// Persisted tag: `n + 1` for packed `n`-byte payloads, `u64::MAX` for chained
    pub fn tag(&self) -> u64 {
        match self {
            RecordLayout::Packed { payload_size } => *payload_size as u64 + 1,
            RecordLayout::Chained => u64::MAX,
        }
    }

    /// Decode a tag; 0 means the layout was never recorded
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => None,
            u64::MAX => Some(RecordLayout::Chained),
            n => Some(RecordLayout::Packed {
                payload_size: (n - 1) as usize,
            }),
        }
    }

    fn slot_size(&self) -> u64 {
        match self {
            RecordLayout::Packed { payload_size } => 1 + *payload_size as u64,
            RecordLayout::Chained => TABLE_ENTRY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStore {
    anchor: u64,
    layout: RecordLayout,
}

impl RecordStore {
    pub fn new(anchor: u64, layout: RecordLayout) -> Self {
        RecordStore { anchor, layout }
    }

    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn count<S: Storage>(&self, c: &ClusterContainer<S>) -> Result<u64> {
        let length = c.stream_len(self.anchor)?;
        let slot = self.layout.slot_size();
        if length % slot != 0 {
            return Err(StoreError::Corruption(format!(
                "record stream {} length {} is not a multiple of {}",
                self.anchor, length, slot
            )));
        }
        Ok(length / slot)
    }

    pub fn read<S: Storage>(
        &self,
        c: &mut ClusterContainer<S>,
        index: u64,
    ) -> Result<Option<Vec<u8>>> {
        let count = self.count(c)?;
        check_index(index, count)?;

        let mut slot = vec![0u8; self.layout.slot_size() as usize];
        c.read_at(self.anchor, index * self.layout.slot_size(), &mut slot)?;
        self.decode_slot(c, index, &slot)
    }

    pub fn read_all<S: Storage>(&self, c: &mut ClusterContainer<S>) -> Result<Vec<Option<Vec<u8>>>> {
        let count = self.count(c)?;
        let table = c.read_stream(self.anchor)?;
        let slot = self.layout.slot_size() as usize;

        let mut records = Vec::with_capacity(count as usize);
        for (index, bytes) in table.chunks_exact(slot).enumerate() {
            records.push(self.decode_slot(c, index as u64, bytes)?);
        }
        Ok(records)
    }

    /// Indices of vacant records
    pub fn vacancies<S: Storage>(&self, c: &mut ClusterContainer<S>) -> Result<Vec<u64>> {
        let table = c.read_stream(self.anchor)?;
        let slot = self.layout.slot_size() as usize;
        Ok(table
            .chunks_exact(slot)
            .enumerate()
            .filter(|(_, bytes)| self.is_vacant_slot(bytes))
            .map(|(index, _)| index as u64)
            .collect())
    }

    pub fn is_vacant<S: Storage>(&self, c: &mut ClusterContainer<S>, index: u64) -> Result<bool> {
        let count = self.count(c)?;
        check_index(index, count)?;
        let mut slot = vec![0u8; self.layout.slot_size() as usize];
        c.read_at(self.anchor, index * self.layout.slot_size(), &mut slot)?;
        Ok(self.is_vacant_slot(&slot))
    }

    /// Append a record and return its index
    pub fn push<S: Storage>(
        &self,
        c: &mut ClusterContainer<S>,
        value: Option<&[u8]>,
    ) -> Result<u64> {
        self.check_payload(value)?;
        let index = self.count(c)?;
        c.with_access_scope(|c| {
            let slot = self.encode_slot(c, value)?;
            c.write_at(self.anchor, index * self.layout.slot_size(), &slot)?;
            Ok(index)
        })
    }

    /// Replace the record at `index`
    pub fn update<S: Storage>(
        &self,
        c: &mut ClusterContainer<S>,
        index: u64,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_payload(value)?;
        let count = self.count(c)?;
        check_index(index, count)?;

        c.with_access_scope(|c| match self.layout {
            RecordLayout::Packed { .. } => {
                let slot = self.encode_slot(c, value)?;
                c.write_at(self.anchor, index * self.layout.slot_size(), &slot)
            }
            RecordLayout::Chained => {
                let current = self.table_entry(c, index)?;
                let next = match (current, value) {
                    (NIL, None) => NIL,
                    (NIL, Some(bytes)) => {
                        let id = c.create_stream()?;
                        c.write_stream(id, bytes)?;
                        id
                    }
                    (id, Some(bytes)) => {
                        c.write_stream(id, bytes)?;
                        id
                    }
                    (id, None) => {
                        c.remove_stream(id)?;
                        NIL
                    }
                };
                if next != current {
                    c.write_at(self.anchor, index * TABLE_ENTRY_SIZE, &next.to_le_bytes())?;
                }
                Ok(())
            }
        })
    }

    /// Insert a record at `index`, shifting later records up by one
    pub fn insert<S: Storage>(
        &self,
        c: &mut ClusterContainer<S>,
        index: u64,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_payload(value)?;
        let count = self.count(c)?;
        if index > count {
            return Err(StoreError::IndexOutOfRange { index, count });
        }

        let slot_size = self.layout.slot_size();
        c.with_access_scope(|c| {
            let mut tail = vec![0u8; ((count - index) * slot_size) as usize];
            c.read_at(self.anchor, index * slot_size, &mut tail)?;
            c.write_at(self.anchor, (index + 1) * slot_size, &tail)?;

            let slot = self.encode_slot(c, value)?;
            c.write_at(self.anchor, index * slot_size, &slot)
        })
    }

    /// Remove the record at `index`, shifting later records down by one
    pub fn remove<S: Storage>(&self, c: &mut ClusterContainer<S>, index: u64) -> Result<()> {
        let count = self.count(c)?;
        check_index(index, count)?;

        let slot_size = self.layout.slot_size();
        c.with_access_scope(|c| {
            if self.layout == RecordLayout::Chained {
                let id = self.table_entry(c, index)?;
                if id != NIL {
                    c.remove_stream(id)?;
                }
            }

            let mut tail = vec![0u8; ((count - index - 1) * slot_size) as usize];
            c.read_at(self.anchor, (index + 1) * slot_size, &mut tail)?;
            c.write_at(self.anchor, index * slot_size, &tail)?;
            c.resize_stream(self.anchor, (count - 1) * slot_size)
        })
    }

    /// Drop every record
    pub fn clear<S: Storage>(&self, c: &mut ClusterContainer<S>) -> Result<()> {
        c.with_access_scope(|c| {
            if self.layout == RecordLayout::Chained {
                let table = c.read_stream(self.anchor)?;
                for entry in table.chunks_exact(TABLE_ENTRY_SIZE as usize) {
                    let id = read_u64(entry, 0);
                    if id != NIL {
                        c.remove_stream(id)?;
                    }
                }
            }
            c.resize_stream(self.anchor, 0)
        })
    }

    fn check_payload(&self, value: Option<&[u8]>) -> Result<()> {
        if let (RecordLayout::Packed { payload_size }, Some(bytes)) = (self.layout, value) {
            if bytes.len() != payload_size {
                return Err(StoreError::InvalidArgument(format!(
                    "record of {} bytes in a table of {}-byte records",
                    bytes.len(),
                    payload_size
                )));
            }
        }
        Ok(())
    }

    fn is_vacant_slot(&self, slot: &[u8]) -> bool {
        match self.layout {
            RecordLayout::Packed { .. } => slot[0] == FLAG_VACANT,
            RecordLayout::Chained => read_u64(slot, 0) == NIL,
        }
    }

    fn table_entry<S: Storage>(&self, c: &mut ClusterContainer<S>, index: u64) -> Result<u64> {
        let mut entry = [0u8; TABLE_ENTRY_SIZE as usize];
        c.read_at(self.anchor, index * TABLE_ENTRY_SIZE, &mut entry)?;
        Ok(u64::from_le_bytes(entry))
    }

    /// Slot bytes for `value`; chained layouts allocate the record's stream
    fn encode_slot<S: Storage>(
        &self,
        c: &mut ClusterContainer<S>,
        value: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        match self.layout {
            RecordLayout::Packed { payload_size } => {
                let mut slot = vec![0u8; 1 + payload_size];
                if let Some(bytes) = value {
                    slot[0] = FLAG_PRESENT;
                    slot[1..].copy_from_slice(bytes);
                }
                Ok(slot)
            }
            RecordLayout::Chained => {
                let id = match value {
                    Some(bytes) => {
                        let id = c.create_stream()?;
                        c.write_stream(id, bytes)?;
                        id
                    }
                    None => NIL,
                };
                Ok(id.to_le_bytes().to_vec())
            }
        }
    }

    fn decode_slot<S: Storage>(
        &self,
        c: &mut ClusterContainer<S>,
        index: u64,
        slot: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        match self.layout {
            RecordLayout::Packed { .. } => match slot[0] {
                FLAG_VACANT => Ok(None),
                FLAG_PRESENT => Ok(Some(slot[1..].to_vec())),
                flag => Err(StoreError::Corruption(format!(
                    "record {} in stream {} has flag {:#x}",
                    index, self.anchor, flag
                ))),
            },
            RecordLayout::Chained => {
                let id = read_u64(slot, 0);
                if id == NIL {
                    return Ok(None);
                }
                if !c.contains_stream(id) || c.is_reserved(id) {
                    return Err(StoreError::Corruption(format!(
                        "record {} in stream {} points to missing stream {}",
                        index, self.anchor, id
                    )));
                }
                Ok(Some(c.read_stream(id)?))
            }
        }
    }
}

fn check_index(index: u64, count: u64) -> Result<()> {
    if index >= count {
        return Err(StoreError::IndexOutOfRange { index, count });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::storage::MemoryStorage;

    fn container() -> ClusterContainer<MemoryStorage> {
        ClusterContainer::create(
            MemoryStorage::new(),
            ContainerConfig {
                cluster_size: 16,
                reserved_streams: 4,
                ..ContainerConfig::default()
            },
        )
        .unwrap()
    }

    fn strings(records: Vec<Option<Vec<u8>>>) -> Vec<Option<String>> {
        records
            .into_iter()
            .map(|r| r.map(|b| String::from_utf8(b).unwrap()))
            .collect()
    }

    #[test]
    fn test_layout_tags() {
        for layout in [
            RecordLayout::Packed { payload_size: 0 },
            RecordLayout::Packed { payload_size: 32 },
            RecordLayout::Chained,
        ] {
            assert_eq!(RecordLayout::from_tag(layout.tag()), Some(layout));
        }
        assert_eq!(RecordLayout::from_tag(0), None);
    }

    #[test]
    fn test_packed_crud() {
        let mut c = container();
        let store = RecordStore::new(1, RecordLayout::Packed { payload_size: 4 });

        store.push(&mut c, Some(b"aaaa")).unwrap();
        store.push(&mut c, Some(b"cccc")).unwrap();
        store.insert(&mut c, 1, Some(b"bbbb")).unwrap();
        store.push(&mut c, None).unwrap();
        assert_eq!(store.count(&c).unwrap(), 4);
        assert_eq!(c.stream_len(1).unwrap(), 4 * 5);

        assert_eq!(store.read(&mut c, 1).unwrap(), Some(b"bbbb".to_vec()));
        assert_eq!(store.read(&mut c, 3).unwrap(), None);
        assert_eq!(store.vacancies(&mut c).unwrap(), vec![3]);

        store.remove(&mut c, 0).unwrap();
        store.update(&mut c, 2, Some(b"dddd")).unwrap();
        assert_eq!(
            strings(store.read_all(&mut c).unwrap()),
            vec![Some("bbbb".into()), Some("cccc".into()), Some("dddd".into())]
        );
    }

    #[test]
    fn test_packed_rejects_wrong_size() {
        let mut c = container();
        let store = RecordStore::new(1, RecordLayout::Packed { payload_size: 4 });
        assert!(matches!(
            store.push(&mut c, Some(b"abc")),
            Err(StoreError::InvalidArgument(_))
        ));
        assert_eq!(store.count(&c).unwrap(), 0);
    }

    #[test]
    fn test_chained_crud_frees_streams() {
        let mut c = container();
        let store = RecordStore::new(2, RecordLayout::Chained);

        store.push(&mut c, Some(b"a longer record spanning clusters")).unwrap();
        store.push(&mut c, Some(b"short")).unwrap();
        store.insert(&mut c, 0, None).unwrap();
        assert_eq!(store.count(&c).unwrap(), 3);
        assert_eq!(c.streams().len(), 2);

        assert_eq!(
            strings(store.read_all(&mut c).unwrap()),
            vec![
                None,
                Some("a longer record spanning clusters".into()),
                Some("short".into())
            ]
        );

        store.update(&mut c, 0, Some(b"filled")).unwrap();
        store.update(&mut c, 2, None).unwrap();
        assert_eq!(c.streams().len(), 2);
        assert_eq!(store.vacancies(&mut c).unwrap(), vec![2]);

        store.remove(&mut c, 1).unwrap();
        assert_eq!(c.streams().len(), 1);
        assert_eq!(store.read(&mut c, 0).unwrap(), Some(b"filled".to_vec()));

        store.clear(&mut c).unwrap();
        assert_eq!(store.count(&c).unwrap(), 0);
        assert!(c.streams().is_empty());
        c.verify_integrity().unwrap();
    }

    #[test]
    fn test_out_of_range() {
        let mut c = container();
        let store = RecordStore::new(1, RecordLayout::Packed { payload_size: 1 });
        assert!(matches!(
            store.read(&mut c, 0),
            Err(StoreError::IndexOutOfRange { index: 0, count: 0 })
        ));
        assert!(store.insert(&mut c, 1, Some(b"x")).is_err());
        store.insert(&mut c, 0, Some(b"x")).unwrap();
        assert!(store.remove(&mut c, 1).is_err());
    }

    #[test]
    fn test_insert_at_front_shifts_all() {
        let mut c = container();
        let store = RecordStore::new(1, RecordLayout::Packed { payload_size: 2 });
        for i in 0..10u8 {
            store.push(&mut c, Some(&[i, i])).unwrap();
        }
        store.insert(&mut c, 0, Some(&[9, 9])).unwrap();
        let records = store.read_all(&mut c).unwrap();
        assert_eq!(records[0], Some(vec![9, 9]));
        assert_eq!(records[10], Some(vec![9, 9]));
        assert_eq!(records.len(), 11);
        c.verify_integrity().unwrap();
    }
}
