use super::ClusterContainer;
use crate::error::Result;
use crate::storage::Storage;
use std::ops::{Deref, DerefMut};
use tracing::error;

/// Reentrant access scope over a container
///
/// Dereferences to the container. Scopes nest through the container's depth
/// counter; header and directory changes are committed when the outermost
/// scope closes. Use [`AccessScope::exit`] to observe commit errors, since
/// dropping the guard can only log them.
pub struct AccessScope<'a, S: Storage> {
    container: &'a mut ClusterContainer<S>,
    open: bool,
}

impl<'a, S: Storage> AccessScope<'a, S> {
    pub(super) fn new(container: &'a mut ClusterContainer<S>) -> Self {
        AccessScope {
            container,
            open: true,
        }
    }

    /// Close the scope, committing if it is the outermost one
    pub fn exit(mut self) -> Result<()> {
        self.open = false;
        self.container.end_scope()
    }
}

impl<S: Storage> Deref for AccessScope<'_, S> {
    type Target = ClusterContainer<S>;

    fn deref(&self) -> &Self::Target {
        self.container
    }
}

impl<S: Storage> DerefMut for AccessScope<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.container
    }
}

impl<S: Storage> Drop for AccessScope<'_, S> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.container.end_scope() {
                error!("Access scope commit failed on drop: {}", e);
            }
        }
    }
}
