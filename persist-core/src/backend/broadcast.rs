//! Several execution contexts sharing one store.
//!
//! A [`BroadcastHub`] owns a single [`MemoryStorage`]. Each call to
//! [`BroadcastHub::open_context`] returns a storage handle plus an event
//! backend for one simulated context (a "tab"). Writes through a context's
//! storage are announced to every *other* context. The writer never hears
//! its own write: echo suppression depends on where a write came from, not
//! on what value it holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::memory::{MemoryEvents, MemoryStorage};
use super::{ChangeEvent, StorageBackend};
use crate::error::StorageError;

/// Identifies one context attached to a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Shared store that fans writes out to the other contexts.
pub struct BroadcastHub {
    storage: MemoryStorage,
    per_key: bool,
    contexts: RwLock<Vec<(ContextId, Weak<MemoryEvents>)>>,
}

impl BroadcastHub {
    /// Hub whose contexts use shared-channel event backends.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            storage: MemoryStorage::new(),
            per_key: false,
            contexts: RwLock::new(Vec::new()),
        })
    }

    /// Hub whose contexts use per-key event backends.
    pub fn per_key() -> Arc<Self> {
        Arc::new(Self {
            storage: MemoryStorage::new(),
            per_key: true,
            contexts: RwLock::new(Vec::new()),
        })
    }

    /// Attach a new context.
    ///
    /// The context stays attached for as long as its event backend is alive.
    pub fn open_context(self: &Arc<Self>) -> (Arc<ContextStorage>, Arc<MemoryEvents>) {
        let id = ContextId::new();
        let events = Arc::new(if self.per_key {
            MemoryEvents::per_key()
        } else {
            MemoryEvents::new()
        });

        self.contexts.write().push((id, Arc::downgrade(&events)));

        let storage = Arc::new(ContextStorage {
            id,
            hub: Arc::clone(self),
        });
        (storage, events)
    }

    /// The underlying shared store.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Number of contexts still alive.
    pub fn context_count(&self) -> usize {
        self.contexts
            .read()
            .iter()
            .filter(|(_, events)| events.strong_count() > 0)
            .count()
    }

    fn broadcast(&self, origin: ContextId, event: ChangeEvent) {
        let targets: Vec<(ContextId, Arc<MemoryEvents>)> = {
            let mut contexts = self.contexts.write();
            contexts.retain(|(_, events)| events.strong_count() > 0);
            contexts
                .iter()
                .filter(|(id, _)| *id != origin)
                .filter_map(|(id, events)| events.upgrade().map(|events| (*id, events)))
                .collect()
        };

        trace!(?origin, key = ?event.key, targets = targets.len(), "broadcasting change");

        // Contexts are isolated: a failure in one of them is not the writer's.
        for (id, events) in targets {
            if let Err(error) = events.emit(&event) {
                warn!(context = ?id, key = ?event.key, %error, "change delivery failed");
            }
        }
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("per_key", &self.per_key)
            .field("contexts", &self.context_count())
            .field("entries", &self.storage.len())
            .finish()
    }
}

/// One context's view of a [`BroadcastHub`].
#[derive(Debug)]
pub struct ContextStorage {
    id: ContextId,
    hub: Arc<BroadcastHub>,
}

impl ContextStorage {
    pub fn id(&self) -> ContextId {
        self.id
    }
}

impl StorageBackend for ContextStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.hub.storage.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.hub.storage.set(key, value)?;
        self.hub.broadcast(self.id, ChangeEvent::changed(key, value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.hub.storage.remove(key)?;
        self.hub.broadcast(self.id, ChangeEvent::removed(key));
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.hub.storage.keys()
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.hub.storage.clear()?;
        self.hub.broadcast(self.id, ChangeEvent::cleared());
        Ok(())
    }
}
