//! Persistent map: each entry stored under `prefix + name`.
//!
//! Entries are independent keys in storage. Writing one entry never
//! rewrites its siblings, and removing one externally reverts only that
//! entry to its slice of the initial map (or drops it, if the initial map
//! has no such entry).
//!
//! On a shared event backend the map listens through a single prefix
//! interest. On a per-key backend it also registers every entry key it
//! holds, since such backends only deliver events for registered keys.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{BindingState, PersistentOptions};
use crate::backend::{ChangeEvent, StorageListener};
use crate::codec::{Codec, Identity};
use crate::engine::Engine;
use crate::error::{PersistError, Result};
use crate::mux::{BindingId, Interest};
use crate::reactive::{Lifecycle, MapStore, MapValue, Unsubscribe};

/// A reactive map whose entries are persisted under a common prefix.
///
/// ```rust,ignore
/// let settings = PersistentMap::new("settings:", BTreeMap::from([
///     ("theme".to_string(), "light".to_string()),
/// ]))?;
///
/// settings.set_key("lang", Some("fr".to_string()))?; // writes "settings:lang"
/// ```
pub struct PersistentMap<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    binding: Arc<MapBinding<V>>,
}

struct MapBinding<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    id: BindingId,
    this: Weak<MapBinding<V>>,
    prefix: String,
    initial: MapValue<V>,
    codec: Arc<dyn Codec<V>>,
    listen: bool,
    engine: Arc<Engine>,
    store: MapStore<V>,
    state: Mutex<MapState>,
}

struct MapState {
    phase: BindingState,
    /// Entry keys registered individually (per-key backends only).
    entry_interests: BTreeSet<String>,
}

impl<V> PersistentMap<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Bind `prefix` on the global engine with the identity codec.
    pub fn new(prefix: impl Into<String>, initial: MapValue<V>) -> Result<Self>
    where
        Identity: Codec<V>,
    {
        Self::with_options(prefix, initial, PersistentOptions::new())
    }

    /// Bind `prefix` with explicit options.
    ///
    /// Starts from `initial` and overlays every stored key under `prefix`.
    pub fn with_options(
        prefix: impl Into<String>,
        initial: MapValue<V>,
        options: PersistentOptions<V>,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let engine = options.resolve_engine();
        let start = read_entries(&engine, &prefix, &initial, options.codec.as_ref())?;

        let binding = Arc::new_cyclic(|weak: &Weak<MapBinding<V>>| {
            let hook: Arc<dyn Lifecycle> = Arc::new(MapHook {
                binding: weak.clone(),
            });
            MapBinding {
                id: BindingId::new(),
                this: weak.clone(),
                prefix,
                initial,
                codec: options.codec,
                listen: options.listen,
                engine,
                store: MapStore::with_lifecycle(start, hook),
                state: Mutex::new(MapState {
                    phase: BindingState::Init,
                    entry_interests: BTreeSet::new(),
                }),
            }
        });

        debug!(prefix = %binding.prefix, listen = binding.listen, "created persistent map");
        Ok(Self { binding })
    }

    pub fn prefix(&self) -> &str {
        &self.binding.prefix
    }

    /// All entries.
    pub fn get(&self) -> MapValue<V> {
        self.binding.store.get()
    }

    pub fn get_key(&self, name: &str) -> Option<V> {
        self.binding.store.get_key(name)
    }

    /// Persist and publish one entry. `None` deletes it.
    pub fn set_key(&self, name: &str, value: Option<V>) -> Result<()> {
        self.binding.write_entry(name, value.as_ref())?;
        self.binding.store.set_key(name, value);
        Ok(())
    }

    /// Replace every entry, deleting the ones missing from `value`.
    pub fn set(&self, value: MapValue<V>) -> Result<()> {
        let current = self.binding.store.get();
        for (name, entry) in &value {
            self.binding.write_entry(name, Some(entry))?;
        }
        for name in current.keys().filter(|name| !value.contains_key(*name)) {
            self.binding.write_entry(name, None)?;
        }
        self.binding.store.set(value);
        Ok(())
    }

    pub fn listen<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&MapValue<V>) + Send + Sync + 'static,
    {
        self.binding.store.listen(listener)
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&MapValue<V>) + Send + Sync + 'static,
    {
        self.binding.store.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.binding.store.listener_count()
    }

    pub fn state(&self) -> BindingState {
        self.binding.state.lock().phase
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.binding.engine
    }

    /// Rebuild the map from the initial entries and storage.
    pub fn restore(&self) -> Result<()> {
        self.binding.restore()
    }

    /// Stop hearing other contexts, right away and for good.
    pub fn dispose(&self) {
        let binding = &self.binding;
        let entries = {
            let mut state = binding.state.lock();
            let previous = std::mem::replace(&mut state.phase, BindingState::Terminal);
            if previous == BindingState::Terminal {
                return;
            }
            std::mem::take(&mut state.entry_interests)
        };

        if binding.listen {
            let mux = binding.engine.mux();
            mux.detach_now(&binding.prefix_interest(), binding.id);
            for name in entries {
                mux.detach_now(&Interest::Key(binding.storage_key(&name)), binding.id);
            }
        }
        debug!(prefix = %binding.prefix, "disposed persistent map");
    }
}

fn read_entries<V>(
    engine: &Engine,
    prefix: &str,
    initial: &MapValue<V>,
    codec: &dyn Codec<V>,
) -> Result<MapValue<V>>
where
    V: Clone,
{
    let storage = engine.storage();
    let mut entries = initial.clone();
    for key in storage.keys()? {
        let Some(name) = key.strip_prefix(prefix) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        if let Some(raw) = storage.get(&key)? {
            let value = codec
                .decode(&raw)
                .map_err(|source| PersistError::decode(&key, source))?;
            entries.insert(name.to_string(), value);
        }
    }
    Ok(entries)
}

impl<V> MapBinding<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn prefix_interest(&self) -> Interest {
        Interest::Prefix(self.prefix.clone())
    }

    fn storage_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn tracks_entries(&self) -> bool {
        self.listen && self.engine.mux().per_key()
    }

    fn write_entry(self: &Arc<Self>, name: &str, value: Option<&V>) -> Result<()> {
        let key = self.storage_key(name);
        let encoded = match value {
            Some(value) => self
                .codec
                .encode(value)
                .map_err(|source| PersistError::encode(&key, source))?,
            None => None,
        };

        let storage = self.engine.storage();
        match encoded {
            Some(raw) => {
                trace!(key = %key, "writing entry");
                storage.set(&key, &raw)?;
                self.track_entry(name);
            }
            None => {
                // An entry encoded to nothing lives in memory only.
                trace!(key = %key, "removing entry");
                storage.remove(&key)?;
                self.untrack_entry(name);
            }
        }
        Ok(())
    }

    /// Register an entry key on per-key backends while listening.
    fn track_entry(self: &Arc<Self>, name: &str) {
        if !self.tracks_entries() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.phase != BindingState::Listening || !state.entry_interests.insert(name.to_string()) {
                return;
            }
        }
        let subscriber: Arc<dyn StorageListener> = self.clone();
        self.engine
            .mux()
            .attach(Interest::Key(self.storage_key(name)), self.id, subscriber);
    }

    fn untrack_entry(&self, name: &str) {
        if !self.tracks_entries() {
            return;
        }
        if !self.state.lock().entry_interests.remove(name) {
            return;
        }
        self.engine
            .mux()
            .detach(&Interest::Key(self.storage_key(name)), self.id);
    }

    fn restore(self: &Arc<Self>) -> Result<()> {
        let entries = read_entries(&self.engine, &self.prefix, &self.initial, self.codec.as_ref())?;
        self.store.set(entries);
        self.sync_entry_interests();
        Ok(())
    }

    /// Match per-entry registrations to the entries currently held.
    fn sync_entry_interests(self: &Arc<Self>) {
        if !self.tracks_entries() {
            return;
        }
        let current = self.store.get();
        let stale: Vec<String> = self
            .state
            .lock()
            .entry_interests
            .iter()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();

        for name in &stale {
            self.untrack_entry(name);
        }
        for name in current.keys() {
            self.track_entry(name);
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.lock().phase == BindingState::Terminal
    }

    fn mount(self: &Arc<Self>) {
        if self.is_terminal() {
            return;
        }
        if let Err(error) = self.restore() {
            warn!(prefix = %self.prefix, %error, "could not restore from storage on mount");
        }
        if !self.listen {
            return;
        }

        let subscriber: Arc<dyn StorageListener> = self.clone();
        self.engine
            .mux()
            .attach(self.prefix_interest(), self.id, subscriber);
        self.state.lock().phase = BindingState::Listening;
        self.sync_entry_interests();
        debug!(prefix = %self.prefix, "persistent map listening");
    }

    fn unmount(&self) {
        let entries = {
            let mut state = self.state.lock();
            if state.phase != BindingState::Listening {
                return;
            }
            state.phase = BindingState::Idle;
            std::mem::take(&mut state.entry_interests)
        };

        let mux = self.engine.mux();
        mux.detach(&self.prefix_interest(), self.id);
        for name in entries {
            mux.detach(&Interest::Key(self.storage_key(&name)), self.id);
        }
        debug!(prefix = %self.prefix, "persistent map idle");
    }

    fn apply_external(self: &Arc<Self>, event: &ChangeEvent) -> Result<()> {
        let Some(key) = event.key.as_deref() else {
            trace!(prefix = %self.prefix, "store-wide change; rebuilding");
            return self.restore();
        };
        let Some(name) = key.strip_prefix(self.prefix.as_str()) else {
            return Ok(());
        };
        if name.is_empty() {
            return Ok(());
        }

        match &event.new_value {
            Some(raw) => {
                let value = self
                    .codec
                    .decode(raw)
                    .map_err(|source| PersistError::decode(key, source))?;
                self.store.set_key(name, Some(value));
                self.track_entry(name);
            }
            None => {
                let fallback = self.initial.get(name).cloned();
                if fallback.is_none() {
                    self.untrack_entry(name);
                }
                self.store.set_key(name, fallback);
            }
        }
        Ok(())
    }
}

impl<V> StorageListener for MapBinding<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), PersistError> {
        if self.is_terminal() {
            return Ok(());
        }
        // Registering new entry keys needs the owning `Arc`.
        match self.this.upgrade() {
            Some(binding) => binding.apply_external(event),
            None => Ok(()),
        }
    }

    fn on_restore(&self) -> Result<(), PersistError> {
        if self.is_terminal() {
            return Ok(());
        }
        match self.this.upgrade() {
            Some(binding) => binding.restore(),
            None => Ok(()),
        }
    }
}

struct MapHook<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    binding: Weak<MapBinding<V>>,
}

impl<V> Lifecycle for MapHook<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_mount(&self) {
        if let Some(binding) = self.binding.upgrade() {
            binding.mount();
        }
    }

    fn on_unmount(&self) {
        if let Some(binding) = self.binding.upgrade() {
            binding.unmount();
        }
    }
}

impl<V> Clone for PersistentMap<V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
        }
    }
}

impl<V> std::fmt::Debug for PersistentMap<V>
where
    V: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMap")
            .field("prefix", &self.binding.prefix)
            .field("entries", &self.get())
            .field("state", &self.state())
            .finish()
    }
}
