//! Listener bookkeeping for reactive stores.
//!
//! Every callback registered on a store gets a [`ListenerId`]. Registering
//! returns an [`Unsubscribe`] handle that removes exactly that callback.
//! Stores can also carry a [`Lifecycle`] hook which is told when the first
//! listener arrives and when the last one leaves.

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a registered listener.
///
/// Each call to `listen` or `subscribe` gets a fresh ID, so the same
/// closure registered twice is tracked (and removed) twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Mount/unmount notifications for a store.
///
/// `on_mount` runs before the first listener is added, so anything it
/// writes into the store is not reported to that listener. `on_unmount`
/// runs after the last listener has been removed.
pub trait Lifecycle: Send + Sync {
    /// The store gained its first listener.
    fn on_mount(&self);

    /// The store lost its last listener.
    fn on_unmount(&self);
}

/// Handle returned by `listen`/`subscribe`.
///
/// Call [`Unsubscribe::unsubscribe`] to detach the listener. Dropping the
/// handle without calling it leaves the listener attached.
#[must_use = "dropping the handle keeps the listener attached; call `unsubscribe` to detach it"]
pub struct Unsubscribe {
    id: ListenerId,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub(crate) fn new<F>(id: ListenerId, detach: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            detach: Some(Box::new(detach)),
        }
    }

    /// The ID of the listener this handle controls.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Detach the listener.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
