//! In-memory projections of per-item datums

use crate::error::{Result, StoreError};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Index derived from `(item index, datum)` pairs
pub trait Projection<D>: Default {
    /// Reject `datum` for the item at `replacing` (`None` for a new item)
    fn check(&self, datum: &D, replacing: Option<u64>) -> Result<()>;

    fn insert(&mut self, index: u64, datum: &D);

    fn remove(&mut self, index: u64, datum: &D);

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unique datum to item index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueProjection<D: Eq + Hash> {
    by_datum: HashMap<D, u64>,
}

impl<D: Eq + Hash> Default for UniqueProjection<D> {
    fn default() -> Self {
        UniqueProjection {
            by_datum: HashMap::new(),
        }
    }
}

impl<D: Eq + Hash> UniqueProjection<D> {
    pub fn get(&self, datum: &D) -> Option<u64> {
        self.by_datum.get(datum).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&D, u64)> {
        self.by_datum.iter().map(|(d, i)| (d, *i))
    }
}

impl<D: Eq + Hash + Clone> Projection<D> for UniqueProjection<D> {
    fn check(&self, datum: &D, replacing: Option<u64>) -> Result<()> {
        match self.by_datum.get(datum) {
            Some(held) if Some(*held) != replacing => Err(StoreError::DuplicateKey),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, index: u64, datum: &D) {
        self.by_datum.insert(datum.clone(), index);
    }

    fn remove(&mut self, index: u64, datum: &D) {
        if self.by_datum.get(datum) == Some(&index) {
            self.by_datum.remove(datum);
        }
    }

    fn clear(&mut self) {
        self.by_datum.clear();
    }

    fn len(&self) -> usize {
        self.by_datum.len()
    }
}

/// Datum to the sorted set of item indices carrying it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupProjection<D: Eq + Hash> {
    by_datum: HashMap<D, BTreeSet<u64>>,
}

impl<D: Eq + Hash> Default for LookupProjection<D> {
    fn default() -> Self {
        LookupProjection {
            by_datum: HashMap::new(),
        }
    }
}

impl<D: Eq + Hash> LookupProjection<D> {
    pub fn get(&self, datum: &D) -> Option<&BTreeSet<u64>> {
        self.by_datum.get(datum)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&D, &BTreeSet<u64>)> {
        self.by_datum.iter()
    }
}

impl<D: Eq + Hash + Clone> Projection<D> for LookupProjection<D> {
    fn check(&self, _datum: &D, _replacing: Option<u64>) -> Result<()> {
        Ok(())
    }

    fn insert(&mut self, index: u64, datum: &D) {
        self.by_datum.entry(datum.clone()).or_default().insert(index);
    }

    fn remove(&mut self, index: u64, datum: &D) {
        if let Some(indices) = self.by_datum.get_mut(datum) {
            indices.remove(&index);
            if indices.is_empty() {
                self.by_datum.remove(datum);
            }
        }
    }

    fn clear(&mut self) {
        self.by_datum.clear();
    }

    /// Number of distinct datums
    fn len(&self) -> usize {
        self.by_datum.len()
    }
}
