//! Persistent atom: one reactive value bound to one storage key.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{BindingState, PersistentOptions};
use crate::backend::{ChangeEvent, StorageListener};
use crate::codec::{Codec, Identity};
use crate::engine::Engine;
use crate::error::{PersistError, Result};
use crate::mux::{BindingId, Interest};
use crate::reactive::{Atom, Lifecycle, Unsubscribe};

/// A reactive value persisted under a single key.
///
/// # Example
///
/// ```rust,ignore
/// let theme = PersistentAtom::new("theme", "light".to_string())?;
///
/// let handle = theme.listen(|value| println!("theme: {value}"));
/// theme.set("dark".to_string())?; // stored under "theme", then printed
/// handle.unsubscribe();
/// ```
///
/// Clones share the same binding.
pub struct PersistentAtom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    binding: Arc<AtomBinding<T>>,
}

struct AtomBinding<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    id: BindingId,
    key: String,
    initial: T,
    codec: Arc<dyn Codec<T>>,
    listen: bool,
    engine: Arc<Engine>,
    atom: Atom<T>,
    state: Mutex<BindingState>,
}

impl<T> PersistentAtom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Bind `key` on the global engine with the identity codec.
    pub fn new(key: impl Into<String>, initial: T) -> Result<Self>
    where
        Identity: Codec<T>,
    {
        Self::with_options(key, initial, PersistentOptions::new())
    }

    /// Bind `key` with explicit options.
    ///
    /// Reads the stored value right away. Fails if it does not decode.
    pub fn with_options(
        key: impl Into<String>,
        initial: T,
        options: PersistentOptions<T>,
    ) -> Result<Self> {
        let key = key.into();
        let engine = options.resolve_engine();

        let start = match engine.storage().get(&key)? {
            Some(raw) => options
                .codec
                .decode(&raw)
                .map_err(|source| PersistError::decode(&key, source))?,
            None => initial.clone(),
        };

        let binding = Arc::new_cyclic(|weak: &Weak<AtomBinding<T>>| {
            let hook: Arc<dyn Lifecycle> = Arc::new(AtomHook {
                binding: weak.clone(),
            });
            AtomBinding {
                id: BindingId::new(),
                key,
                initial,
                codec: options.codec,
                listen: options.listen,
                engine,
                atom: Atom::with_lifecycle(start, hook),
                state: Mutex::new(BindingState::Init),
            }
        });

        debug!(key = %binding.key, listen = binding.listen, "created persistent atom");
        Ok(Self { binding })
    }

    pub fn key(&self) -> &str {
        &self.binding.key
    }

    /// The value this atom reverts to when its key is removed.
    pub fn initial(&self) -> &T {
        &self.binding.initial
    }

    pub fn get(&self) -> T {
        self.binding.atom.get()
    }

    /// Persist `value`, then publish it.
    ///
    /// The storage write has completed when this returns. Encoding to
    /// `None` removes the key.
    pub fn set(&self, value: T) -> Result<()> {
        self.binding.write(&value)?;
        self.binding.atom.set(value);
        Ok(())
    }

    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let next = f(&self.get());
        self.set(next)
    }

    /// Register a callback for every new value.
    ///
    /// The first listener starts listening for other contexts.
    pub fn listen<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.binding.atom.listen(listener)
    }

    /// Like [`PersistentAtom::listen`], but also calls `listener` right away.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.binding.atom.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.binding.atom.listener_count()
    }

    pub fn state(&self) -> BindingState {
        *self.binding.state.lock()
    }

    /// The engine this atom was bound to at construction.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.binding.engine
    }

    /// Re-read storage into the atom.
    pub fn restore(&self) -> Result<()> {
        self.binding.restore()
    }

    /// Stop hearing other contexts, right away and for good.
    ///
    /// Local `set` keeps writing to storage.
    pub fn dispose(&self) {
        let binding = &self.binding;
        let previous = std::mem::replace(&mut *binding.state.lock(), BindingState::Terminal);
        if binding.listen && previous != BindingState::Terminal {
            binding.engine.mux().detach_now(&binding.interest(), binding.id);
        }
        debug!(key = %binding.key, "disposed persistent atom");
    }
}

impl<T> AtomBinding<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn interest(&self) -> Interest {
        Interest::Key(self.key.clone())
    }

    fn decode(&self, raw: &str) -> Result<T> {
        self.codec
            .decode(raw)
            .map_err(|source| PersistError::decode(&self.key, source))
    }

    fn write(&self, value: &T) -> Result<()> {
        let storage = self.engine.storage();
        let encoded = self
            .codec
            .encode(value)
            .map_err(|source| PersistError::encode(&self.key, source))?;

        match encoded {
            Some(raw) => {
                trace!(key = %self.key, "writing to storage");
                storage.set(&self.key, &raw)?;
            }
            None => {
                trace!(key = %self.key, "removing from storage");
                storage.remove(&self.key)?;
            }
        }
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        let value = match self.engine.storage().get(&self.key)? {
            Some(raw) => self.decode(&raw)?,
            None => self.initial.clone(),
        };
        self.atom.set(value);
        Ok(())
    }

    fn is_terminal(&self) -> bool {
        *self.state.lock() == BindingState::Terminal
    }

    fn mount(self: &Arc<Self>) {
        if self.is_terminal() {
            return;
        }
        if let Err(error) = self.restore() {
            warn!(key = %self.key, %error, "could not restore from storage on mount");
        }
        if !self.listen {
            return;
        }

        let subscriber: Arc<dyn StorageListener> = self.clone();
        self.engine.mux().attach(self.interest(), self.id, subscriber);
        *self.state.lock() = BindingState::Listening;
        debug!(key = %self.key, "persistent atom listening");
    }

    fn unmount(&self) {
        let mut state = self.state.lock();
        if *state != BindingState::Listening {
            return;
        }
        *state = BindingState::Idle;
        drop(state);

        self.engine.mux().detach(&self.interest(), self.id);
        debug!(key = %self.key, "persistent atom idle");
    }
}

impl<T> StorageListener for AtomBinding<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<(), PersistError> {
        if self.is_terminal() {
            return Ok(());
        }

        match event.key.as_deref() {
            Some(key) if key == self.key => {
                let next = match &event.new_value {
                    Some(raw) => self.decode(raw)?,
                    None => self.initial.clone(),
                };
                trace!(key = %self.key, removed = event.new_value.is_none(), "applying external change");
                self.atom.set(next);
            }
            Some(_) => {}
            None => {
                // Store-wide event: only a key that is really gone reverts.
                if self.engine.storage().get(&self.key)?.is_none() {
                    trace!(key = %self.key, "key cleared externally");
                    self.atom.set(self.initial.clone());
                }
            }
        }
        Ok(())
    }

    fn on_restore(&self) -> Result<(), PersistError> {
        if self.is_terminal() {
            return Ok(());
        }
        self.restore()
    }
}

struct AtomHook<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    binding: Weak<AtomBinding<T>>,
}

impl<T> Lifecycle for AtomHook<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
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

impl<T> Clone for PersistentAtom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            binding: Arc::clone(&self.binding),
        }
    }
}

impl<T> std::fmt::Debug for PersistentAtom<T>
where
    T: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentAtom")
            .field("key", &self.binding.key)
            .field("value", &self.get())
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryEvents, MemoryStorage, StorageBackend};
    use crate::codec::{FnCodec, JsonCodec};
    use crate::engine::EngineHandle;
    use crate::error::CodecError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        events: Arc<MemoryEvents>,
        handle: EngineHandle,
    }

    fn fixture(events: MemoryEvents) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let events = Arc::new(events);
        let handle = EngineHandle::new(storage.clone(), events.clone());
        Fixture {
            storage,
            events,
            handle,
        }
    }

    impl Fixture {
        fn options<T: 'static>(&self) -> PersistentOptions<T>
        where
            Identity: Codec<T>,
        {
            PersistentOptions::new().engine(&self.handle)
        }

        /// Simulate another context writing `key`.
        fn external(&self, key: &str, value: Option<&str>) -> Result<()> {
            match value {
                Some(value) => {
                    self.storage.set(key, value)?;
                    self.events.emit(&ChangeEvent::changed(key, value))
                }
                None => {
                    self.storage.remove(key)?;
                    self.events.emit(&ChangeEvent::removed(key))
                }
            }
        }
    }

    fn record<T>(atom: &PersistentAtom<T>) -> (Arc<Mutex<Vec<T>>>, Unsubscribe)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = atom.listen(move |value: &T| seen_clone.lock().push(value.clone()));
        (seen, handle)
    }

    #[test]
    fn loads_stored_value() {
        let fx = fixture(MemoryEvents::new());
        fx.storage.set("a", "1").unwrap();

        let atom = PersistentAtom::with_options("a", "2".to_string(), fx.options()).unwrap();
        assert_eq!(atom.get(), "1");
    }

    #[test]
    fn missing_key_uses_initial_without_writing() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("a", "2".to_string(), fx.options()).unwrap();

        assert_eq!(atom.get(), "2");
        assert!(fx.storage.is_empty());
    }

    #[test]
    fn set_writes_then_removes_on_absent_encoding() {
        let fx = fixture(MemoryEvents::new());
        let atom: PersistentAtom<Option<String>> =
            PersistentAtom::with_options("b", None, fx.options()).unwrap();
        let (seen, _handle) = record(&atom);

        atom.set(Some("1".into())).unwrap();
        assert_eq!(fx.storage.get("b").unwrap().as_deref(), Some("1"));

        atom.set(None).unwrap();
        assert_eq!(fx.storage.get("b").unwrap(), None);
        assert_eq!(*seen.lock(), vec![Some("1".to_string()), None]);
    }

    #[test]
    fn writes_without_listeners() {
        let fx = fixture(MemoryEvents::new());
        let atom: PersistentAtom<Option<String>> =
            PersistentAtom::with_options("d", None, fx.options()).unwrap();

        atom.set(Some("1".into())).unwrap();
        assert_eq!(fx.storage.get("d").unwrap().as_deref(), Some("1"));
        assert_eq!(atom.state(), BindingState::Init);
    }

    #[test]
    fn applies_external_changes_once() {
        let fx = fixture(MemoryEvents::new());
        let atom: PersistentAtom<Option<String>> =
            PersistentAtom::with_options("c", None, fx.options()).unwrap();
        let (seen, _handle) = record(&atom);
        assert_eq!(atom.state(), BindingState::Listening);

        fx.external("c", Some("1")).unwrap();
        assert_eq!(*seen.lock(), vec![Some("1".to_string())]);
        assert_eq!(atom.get().as_deref(), Some("1"));

        fx.external("c", None).unwrap();
        assert_eq!(atom.get(), None);
    }

    #[test]
    fn removal_reverts_to_initial() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("key", "initial".to_string(), fx.options()).unwrap();
        atom.set("1".into()).unwrap();
        let (seen, _handle) = record(&atom);

        fx.external("key", None).unwrap();
        assert_eq!(*seen.lock(), vec!["initial".to_string()]);
        assert_eq!(atom.get(), "initial");
    }

    #[test]
    fn store_wide_clear_reverts_missing_key() {
        let fx = fixture(MemoryEvents::new());
        let atom: PersistentAtom<Option<String>> =
            PersistentAtom::with_options("c", None, fx.options()).unwrap();
        let (seen, _handle) = record(&atom);
        atom.set(Some("init".into())).unwrap();

        fx.storage.clear().unwrap();
        fx.events.emit(&ChangeEvent::cleared()).unwrap();

        assert_eq!(*seen.lock(), vec![Some("init".to_string()), None]);
    }

    #[test]
    fn store_wide_event_ignored_while_key_present() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("c", "x".to_string(), fx.options()).unwrap();
        let (seen, _handle) = record(&atom);
        atom.set("kept".into()).unwrap();

        fx.events.emit(&ChangeEvent::cleared()).unwrap();
        assert_eq!(atom.get(), "kept");
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn listen_false_ignores_other_contexts() {
        let fx = fixture(MemoryEvents::new());
        let atom: PersistentAtom<Option<String>> =
            PersistentAtom::with_options("c2", None, fx.options().listen(false)).unwrap();
        let (seen, _handle) = record(&atom);

        fx.external("c2", Some("1")).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(atom.get(), None);
        assert_eq!(fx.events.listener_count(), 0);
    }

    #[test]
    fn json_codec_round_trips_through_storage() {
        let fx = fixture(MemoryEvents::new());
        let locale = PersistentAtom::with_options(
            "locale",
            vec!["en".to_string(), "US".to_string()],
            PersistentOptions::with_codec(JsonCodec::new()).engine(&fx.handle),
        )
        .unwrap();
        let _handle = locale.listen(|_| {});

        locale.set(vec!["ru".into(), "RU".into()]).unwrap();
        assert_eq!(fx.storage.get("locale").unwrap().as_deref(), Some(r#"["ru","RU"]"#));

        fx.external("locale", Some(r#"["fr","CA"]"#)).unwrap();
        assert_eq!(locale.get(), vec!["fr", "CA"]);
    }

    #[test]
    fn custom_codec_reverts_on_removal() {
        let fx = fixture(MemoryEvents::new());
        let flag = PersistentAtom::with_options(
            "bool",
            false,
            PersistentOptions::with_codec(FnCodec::new(
                |on: &bool| Ok(on.then(|| "yes".to_string())),
                |raw: &str| Ok(!raw.is_empty()),
            ))
            .engine(&fx.handle),
        )
        .unwrap();
        assert!(!flag.get());
        assert_eq!(fx.storage.get("bool").unwrap(), None);

        flag.set(true).unwrap();
        assert_eq!(fx.storage.get("bool").unwrap().as_deref(), Some("yes"));

        let _handle = flag.listen(|_| {});
        fx.external("bool", None).unwrap();
        assert!(!flag.get());
    }

    #[test]
    fn decode_failure_surfaces_from_constructor_and_events() {
        let fx = fixture(MemoryEvents::new());
        fx.storage.set("n", "not a number").unwrap();
        let failed = PersistentAtom::with_options(
            "n",
            0u32,
            PersistentOptions::json().engine(&fx.handle),
        );
        assert!(matches!(failed, Err(PersistError::Decode { .. })));

        fx.storage.set("n", "1").unwrap();
        let atom = PersistentAtom::with_options(
            "n",
            0u32,
            PersistentOptions::json().engine(&fx.handle),
        )
        .unwrap();
        let _handle = atom.listen(|_| {});

        let err = fx.external("n", Some("oops")).unwrap_err();
        assert!(matches!(err, PersistError::Decode { ref key, .. } if key == "n"));
        assert_eq!(atom.get(), 1);
    }

    #[test]
    fn encode_failure_leaves_value_untouched() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options(
            "e",
            1i32,
            PersistentOptions::with_codec(FnCodec::new(
                |v: &i32| {
                    if *v < 0 {
                        Err(CodecError::invalid("negative"))
                    } else {
                        Ok(Some(v.to_string()))
                    }
                },
                |raw: &str| raw.parse().map_err(|_| CodecError::invalid(raw)),
            ))
            .engine(&fx.handle),
        )
        .unwrap();

        assert!(matches!(atom.set(-1), Err(PersistError::Encode { .. })));
        assert_eq!(atom.get(), 1);
        assert!(fx.storage.is_empty());
    }

    #[test]
    fn local_set_notifies_exactly_once() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("k", String::new(), fx.options()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _handle = atom.listen(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        atom.set("a".into()).unwrap();
        atom.set("b".into()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_outside_runtime_keeps_registration_during_grace() {
        let fx = fixture(MemoryEvents::per_key());
        let atom: PersistentAtom<Option<String>> =
            PersistentAtom::with_options("lang", None, fx.options()).unwrap();

        atom.listen(|_| {}).unsubscribe();
        assert_eq!(atom.state(), BindingState::Idle);
        assert_eq!(fx.events.registered_keys(), vec!["lang"]);

        // Still hears other contexts while the removal is pending.
        fx.external("lang", Some("de")).unwrap();
        assert_eq!(atom.get().as_deref(), Some("de"));

        let handle = atom.listen(|_| {});
        assert_eq!(atom.engine().mux().pending_count(), 0);
        assert_eq!(fx.events.listener_count(), 1);

        handle.unsubscribe();
        atom.engine().shutdown();
        assert_eq!(fx.events.listener_count(), 0);
    }

    #[test]
    fn mount_rereads_storage() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("m", "init".to_string(), fx.options()).unwrap();

        fx.storage.set("m", "changed while unobserved").unwrap();
        let _handle = atom.listen(|_| {});
        assert_eq!(atom.get(), "changed while unobserved");
    }

    #[test]
    fn restore_event_rereads_storage() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("r", "init".to_string(), fx.options()).unwrap();
        let _handle = atom.listen(|_| {});

        fx.storage.set("r", "missed").unwrap();
        fx.events.emit_restore().unwrap();
        assert_eq!(atom.get(), "missed");
    }

    #[test]
    fn dispose_stops_sync() {
        let fx = fixture(MemoryEvents::new());
        let atom = PersistentAtom::with_options("x", "a".to_string(), fx.options()).unwrap();
        let _handle = atom.listen(|_| {});

        atom.dispose();
        assert_eq!(atom.state(), BindingState::Terminal);
        assert_eq!(fx.events.listener_count(), 0);

        fx.external("x", Some("b")).unwrap();
        assert_eq!(atom.get(), "a");
    }

    #[test]
    fn bindings_keep_engine_from_construction() {
        let fx = fixture(MemoryEvents::new());
        let before = PersistentAtom::with_options("z", "0".to_string(), fx.options()).unwrap();

        let replacement = Arc::new(MemoryStorage::new());
        fx.handle
            .configure(replacement.clone(), Arc::new(MemoryEvents::new()));
        let after = PersistentAtom::with_options("z", "0".to_string(), fx.options()).unwrap();

        before.set("old".into()).unwrap();
        after.set("new".into()).unwrap();
        assert_eq!(fx.storage.get("z").unwrap().as_deref(), Some("old"));
        assert_eq!(replacement.get("z").unwrap().as_deref(), Some("new"));
    }
}
