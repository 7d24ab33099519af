//! Map store: an atom whose value is a set of named entries.
//!
//! Entries are kept in a `BTreeMap` so the aggregate compares and iterates
//! deterministically. A missing entry is simply absent from the map; there
//! is no placeholder value.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::atom::Atom;
use super::listener::{Lifecycle, Unsubscribe};

/// Aggregate value held by a [`MapStore`].
pub type MapValue<V> = BTreeMap<String, V>;

/// A reactive store of string-keyed entries.
///
/// ```rust,ignore
/// let settings = MapStore::new(BTreeMap::from([("theme".into(), "dark".into())]));
/// settings.set_key("lang", Some("en".into()));
/// assert_eq!(settings.get_key("lang").as_deref(), Some("en"));
/// ```
pub struct MapStore<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    atom: Atom<MapValue<V>>,
}

impl<V> MapStore<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a map store with the given entries.
    pub fn new(initial: MapValue<V>) -> Self {
        Self {
            atom: Atom::new(initial),
        }
    }

    /// Create a map store whose first/last listener is reported to `lifecycle`.
    pub fn with_lifecycle(initial: MapValue<V>, lifecycle: Arc<dyn Lifecycle>) -> Self {
        Self {
            atom: Atom::with_lifecycle(initial, lifecycle),
        }
    }

    /// Snapshot of all entries.
    pub fn get(&self) -> MapValue<V> {
        self.atom.get()
    }

    /// Current value of a single entry.
    pub fn get_key(&self, key: &str) -> Option<V> {
        self.atom.get().get(key).cloned()
    }

    /// Replace every entry at once.
    pub fn set(&self, value: MapValue<V>) {
        self.atom.set(value);
    }

    /// Insert (`Some`) or delete (`None`) one entry, leaving the rest alone.
    pub fn set_key(&self, key: &str, value: Option<V>) {
        self.atom.update(|current| {
            let mut next = current.clone();
            match value {
                Some(value) => {
                    next.insert(key.to_string(), value);
                }
                None => {
                    next.remove(key);
                }
            }
            next
        });
    }

    /// Register a callback invoked with the whole map after every change.
    pub fn listen<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&MapValue<V>) + Send + Sync + 'static,
    {
        self.atom.listen(listener)
    }

    /// Like [`MapStore::listen`], but also calls `listener` right away.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&MapValue<V>) + Send + Sync + 'static,
    {
        self.atom.subscribe(listener)
    }

    /// Get the number of listeners.
    pub fn listener_count(&self) -> usize {
        self.atom.listener_count()
    }
}

impl<V> Clone for MapStore<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            atom: self.atom.clone(),
        }
    }
}

impl<V> std::fmt::Debug for MapStore<V>
where
    V: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapStore")
            .field("entries", &self.get())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}
