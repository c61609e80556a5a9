//! Mutation notifications
//!
//! Collections announce every change to their items through
//! [`MutationListener`]s, in registration order. Each operation first asks
//! every listener to [`validate`](MutationListener::validate) the mutation,
//! then applies it to its own records, then [`notify`](MutationListener::notify)s
//! the listeners, all inside one access scope.

use crate::container::ClusterContainer;
use crate::error::Result;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::sync::Arc;

/// A change to a collection's items
///
/// `bytes` is the item as stored by the collection's serializer.
#[derive(Debug)]
pub enum Mutation<'a, T> {
    /// Item appended at `index`
    Add { index: u64, item: &'a T, bytes: &'a [u8] },
    /// Reaped slot appended at `index` (only seen while replaying)
    AddReaped { index: u64 },
    /// Item at `index` replaced
    Update { index: u64, item: &'a T, bytes: &'a [u8] },
    /// Item inserted at `index`; later items move up by one
    Insert { index: u64, item: &'a T, bytes: &'a [u8] },
    /// Item at `index` removed; later items move down by one
    Remove { index: u64 },
    /// Item at `index` reaped; its slot stays
    Reap { index: u64 },
    /// About to drop every item
    Clearing,
    /// Every item dropped
    Cleared,
}

impl<T> Mutation<'_, T> {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Add { .. } => "add",
            Mutation::AddReaped { .. } => "add-reaped",
            Mutation::Update { .. } => "update",
            Mutation::Insert { .. } => "insert",
            Mutation::Remove { .. } => "remove",
            Mutation::Reap { .. } => "reap",
            Mutation::Clearing => "clearing",
            Mutation::Cleared => "cleared",
        }
    }
}

/// Observer of a collection's mutations
pub trait MutationListener<T, S: Storage> {
    /// Load persisted state for a collection of `item_count` items
    ///
    /// Returns `false` when that state is out of step with the collection;
    /// the collection then replays every item (`Clearing`, `Cleared`, then
    /// `Add` or `AddReaped` per slot).
    fn attach(&mut self, container: &mut ClusterContainer<S>, item_count: u64) -> Result<bool>;

    /// Drop in-memory state
    fn detach(&mut self);

    /// Reserved stream holding the listener's persisted state, if any
    fn anchor_stream(&self) -> Option<u64> {
        None
    }

    /// Reject a mutation before anything changes
    fn validate(&self, _mutation: &Mutation<'_, T>) -> Result<()> {
        Ok(())
    }

    fn notify(&mut self, container: &mut ClusterContainer<S>, mutation: &Mutation<'_, T>) -> Result<()>;
}

/// Shared handle: the collection notifies the listener, the caller keeps
/// querying it
impl<T, S: Storage, L: MutationListener<T, S>> MutationListener<T, S> for Arc<Mutex<L>> {
    fn attach(&mut self, container: &mut ClusterContainer<S>, item_count: u64) -> Result<bool> {
        self.lock().attach(container, item_count)
    }

    fn detach(&mut self) {
        self.lock().detach()
    }

    fn anchor_stream(&self) -> Option<u64> {
        self.lock().anchor_stream()
    }

    fn validate(&self, mutation: &Mutation<'_, T>) -> Result<()> {
        self.lock().validate(mutation)
    }

    fn notify(&mut self, container: &mut ClusterContainer<S>, mutation: &Mutation<'_, T>) -> Result<()> {
        self.lock().notify(container, mutation)
    }
}
