//! In-memory engine for tests.
//!
//! [`TestEngine`] plays the role of "another context": its [`set_key`] and
//! [`clear`] change storage and then announce the change, the way a second
//! tab or process would.
//!
//! [`set_key`]: TestEngine::set_key
//! [`clear`]: TestEngine::clear

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{ChangeEvent, MemoryEvents, MemoryStorage, StorageBackend};
use crate::engine::EngineHandle;
use crate::error::Result;

/// Memory storage plus a memory event backend.
#[derive(Debug, Clone)]
pub struct TestEngine {
    storage: Arc<MemoryStorage>,
    events: Arc<MemoryEvents>,
}

impl TestEngine {
    /// Shared event channel.
    pub fn new() -> Self {
        Self::with_events(MemoryEvents::new())
    }

    /// Per-key event channel.
    pub fn per_key() -> Self {
        Self::with_events(MemoryEvents::per_key())
    }

    fn with_events(events: MemoryEvents) -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            events: Arc::new(events),
        }
    }

    /// A fresh handle over these backends.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.storage.clone(), self.events.clone())
    }

    /// Point `handle` at these backends.
    pub fn install(&self, handle: &EngineHandle) {
        handle.configure(self.storage.clone(), self.events.clone());
    }

    /// Write or remove `key` as another context would.
    pub fn set_key(&self, key: &str, value: Option<&str>) -> Result<()> {
        let event = match value {
            Some(value) => {
                self.storage.set(key, value)?;
                ChangeEvent::changed(key, value)
            }
            None => {
                self.storage.remove(key)?;
                ChangeEvent::removed(key)
            }
        };
        self.events.emit(&event)
    }

    /// Wipe storage and announce a store-wide change.
    pub fn clear(&self) -> Result<()> {
        self.storage.clear()?;
        self.events.emit(&ChangeEvent::cleared())
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.storage.snapshot()
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<MemoryEvents> {
        &self.events
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
