//! In-process backends.
//!
//! [`MemoryStorage`] keeps entries in insertion order. [`MemoryEvents`] never
//! produces events on its own; whoever plays the "other context" calls
//! [`MemoryEvents::emit`].

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;

use super::{same_listener, ChangeEvent, EventBackend, Scope, StorageBackend, StorageListener};
use crate::error::{PersistError, StorageError};

/// String map held in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<IndexMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().shift_remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().clear();
        Ok(())
    }
}

/// Listener table that delivers events handed to [`MemoryEvents::emit`].
///
/// Listeners registered with [`Scope::All`] see every event. Listeners
/// registered for a key see events for that key, plus store-wide events.
pub struct MemoryEvents {
    per_key: bool,
    /// `None` holds the `Scope::All` listeners.
    listeners: DashMap<Option<String>, Vec<Arc<dyn StorageListener>>>,
}

impl MemoryEvents {
    /// A shared-channel backend.
    pub fn new() -> Self {
        Self {
            per_key: false,
            listeners: DashMap::new(),
        }
    }

    /// A per-key backend.
    pub fn per_key() -> Self {
        Self {
            per_key: true,
            listeners: DashMap::new(),
        }
    }

    /// Deliver `event` to every matching listener.
    ///
    /// Stops at, and returns, the first listener error.
    pub fn emit(&self, event: &ChangeEvent) -> Result<(), PersistError> {
        for listener in self.targets(event.key.as_deref()) {
            listener.on_change(event)?;
        }
        Ok(())
    }

    /// Ask every listener to re-read storage.
    pub fn emit_restore(&self) -> Result<(), PersistError> {
        let all: Vec<Arc<dyn StorageListener>> = self
            .listeners
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        for listener in all {
            listener.on_restore()?;
        }
        Ok(())
    }

    /// Total number of registrations.
    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }

    /// Keys with at least one per-key registration, sorted.
    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .listeners
            .iter()
            .filter_map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn targets(&self, key: Option<&str>) -> Vec<Arc<dyn StorageListener>> {
        let mut targets = Vec::new();
        if let Some(all) = self.listeners.get(&None) {
            targets.extend(all.iter().cloned());
        }
        match key {
            Some(key) => {
                if let Some(scoped) = self.listeners.get(&Some(key.to_string())) {
                    targets.extend(scoped.iter().cloned());
                }
            }
            None => {
                for entry in self.listeners.iter() {
                    if entry.key().is_some() {
                        targets.extend(entry.value().iter().cloned());
                    }
                }
            }
        }
        targets
    }
}

impl Default for MemoryEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEvents")
            .field("per_key", &self.per_key)
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

fn scope_key(scope: Scope<'_>) -> Option<String> {
    match scope {
        Scope::All => None,
        Scope::Key(key) => Some(key.to_string()),
    }
}

impl EventBackend for MemoryEvents {
    fn per_key(&self) -> bool {
        self.per_key
    }

    fn add_listener(&self, scope: Scope<'_>, listener: Arc<dyn StorageListener>) {
        self.listeners
            .entry(scope_key(scope))
            .or_default()
            .push(listener);
    }

    fn remove_listener(&self, scope: Scope<'_>, listener: &Arc<dyn StorageListener>) {
        let key = scope_key(scope);
        if let Some(mut registered) = self.listeners.get_mut(&key) {
            registered.retain(|existing| !same_listener(existing, listener));
        }
        self.listeners.remove_if(&key, |_, registered| registered.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl StorageListener for Recorder {
        fn on_change(&self, event: &ChangeEvent) -> Result<(), PersistError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn storage_distinguishes_empty_from_missing() {
        let storage = MemoryStorage::new();
        storage.set("empty", "").unwrap();

        assert_eq!(storage.get("empty").unwrap(), Some(String::new()));
        assert_eq!(storage.get("missing").unwrap(), None);
    }

    #[test]
    fn storage_clear_and_keys() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").unwrap();
        storage.set("b", "2").unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["a", "b"]);

        storage.remove("a").unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["b"]);

        storage.clear().unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn shared_listener_sees_every_event() {
        let events = MemoryEvents::new();
        let recorder = Arc::new(Recorder::default());
        events.add_listener(Scope::All, recorder.clone());

        events.emit(&ChangeEvent::changed("a", "1")).unwrap();
        events.emit(&ChangeEvent::cleared()).unwrap();

        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn keyed_listener_only_sees_its_key_and_clears() {
        let events = MemoryEvents::per_key();
        let recorder = Arc::new(Recorder::default());
        events.add_listener(Scope::Key("lang"), recorder.clone());

        events.emit(&ChangeEvent::changed("other", "1")).unwrap();
        events.emit(&ChangeEvent::changed("lang", "fr")).unwrap();
        events.emit(&ChangeEvent::cleared()).unwrap();

        let seen = recorder.events.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ChangeEvent::changed("lang", "fr"));
        assert!(seen[1].is_store_wide());
    }

    #[test]
    fn remove_listener_by_identity() {
        let events = MemoryEvents::per_key();
        let a: Arc<dyn StorageListener> = Arc::new(Recorder::default());
        let b: Arc<dyn StorageListener> = Arc::new(Recorder::default());
        events.add_listener(Scope::Key("lang"), a.clone());
        events.add_listener(Scope::Key("lang"), b.clone());
        assert_eq!(events.registered_keys(), vec!["lang"]);

        events.remove_listener(Scope::Key("lang"), &a);
        assert_eq!(events.listener_count(), 1);

        events.remove_listener(Scope::Key("lang"), &b);
        assert_eq!(events.listener_count(), 0);
        assert!(events.registered_keys().is_empty());
    }
}
