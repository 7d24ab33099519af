//! Atom Implementation
//!
//! An Atom is the single-value reactive store the persistence layer wraps.
//! It holds a value and a list of listeners.
//!
//! # How Atoms Work
//!
//! 1. `listen` registers a callback that receives every new value.
//!
//! 2. `set` replaces the value and notifies listeners, unless the new value
//!    equals the current one.
//!
//! 3. An optional [`Lifecycle`] hook hears about the first listener
//!    arriving (mount) and the last one leaving (unmount).
//!
//! # Thread Safety
//!
//! The value and the listener list sit behind `parking_lot` locks. Neither
//! lock is held while a listener or lifecycle hook runs, so callbacks may
//! freely read, write or (un)subscribe on the same atom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::fmt::Debug;

use parking_lot::RwLock;

use super::listener::{Lifecycle, ListenerId, Unsubscribe};

/// Counter for generating unique atom IDs.
static ATOM_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique atom ID.
fn next_atom_id() -> u64 {
    ATOM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ListenerList<T> = Arc<RwLock<Vec<(ListenerId, Listener<T>)>>>;

/// A reactive store holding a single value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let count = Atom::new(0);
///
/// let handle = count.listen(|value| println!("count is now {value}"));
/// count.set(5); // prints "count is now 5"
/// count.set(5); // same value, nothing printed
///
/// handle.unsubscribe();
/// ```
pub struct Atom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Unique identifier for this atom.
    id: u64,

    /// The current value.
    value: Arc<RwLock<T>>,

    /// Registered listeners, in registration order.
    listeners: ListenerList<T>,

    /// Mount/unmount hook.
    lifecycle: Option<Arc<dyn Lifecycle>>,
}

impl<T> Atom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new atom with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            id: next_atom_id(),
            value: Arc::new(RwLock::new(value)),
            listeners: Arc::new(RwLock::new(Vec::new())),
            lifecycle: None,
        }
    }

    /// Create a new atom whose first/last listener is reported to `lifecycle`.
    pub fn with_lifecycle(value: T, lifecycle: Arc<dyn Lifecycle>) -> Self {
        Self {
            lifecycle: Some(lifecycle),
            ..Self::new(value)
        }
    }

    /// Get the atom's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Set a new value and notify listeners.
    ///
    /// Setting a value equal to the current one is a no-op.
    pub fn set(&self, value: T) {
        {
            let mut guard = self.value.write();
            if *guard == value {
                return;
            }
            *guard = value.clone();
        }

        self.notify_listeners(&value);
    }

    /// Update the value using a function.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.value.read();
            f(&guard)
        };
        self.set(new_value);
    }

    /// Register a callback invoked with every new value.
    ///
    /// The callback is not called with the current value; see
    /// [`Atom::subscribe`] for that.
    pub fn listen<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId::new();

        if self.listeners.read().is_empty() {
            if let Some(lifecycle) = &self.lifecycle {
                lifecycle.on_mount();
            }
        }

        self.listeners.write().push((id, Arc::new(listener)));

        let listeners = Arc::clone(&self.listeners);
        let lifecycle = self.lifecycle.clone();
        Unsubscribe::new(id, move || {
            let now_empty = {
                let mut guard = listeners.write();
                let before = guard.len();
                guard.retain(|(listener_id, _)| *listener_id != id);
                before != guard.len() && guard.is_empty()
            };

            if now_empty {
                if let Some(lifecycle) = lifecycle {
                    lifecycle.on_unmount();
                }
            }
        })
    }

    /// Like [`Atom::listen`], but also calls `listener` with the current
    /// value right away.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let handle = {
            let listener = Arc::clone(&listener);
            self.listen(move |value| listener(value))
        };
        listener(&self.get());
        handle
    }

    /// Get the number of listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Call every listener with `value`.
    fn notify_listeners(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(value);
        }
    }
}

impl<T> Clone for Atom<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            listeners: Arc::clone(&self.listeners),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<T> Debug for Atom<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.id)
            .field("value", &self.get())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn atom_get_and_set() {
        let atom = Atom::new(0);
        assert_eq!(atom.get(), 0);

        atom.set(42);
        assert_eq!(atom.get(), 42);
    }

    #[test]
    fn atom_update() {
        let atom = Atom::new(10);
        atom.update(|v| v + 5);
        assert_eq!(atom.get(), 15);
    }

    #[test]
    fn atom_notifies_listeners_with_new_value() {
        let atom = Atom::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _handle = atom.listen(move |value| seen_clone.lock().push(*value));

        atom.set(1);
        atom.set(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn atom_skips_equal_values() {
        let atom = Atom::new(String::from("a"));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let _handle = atom.listen(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        atom.set(String::from("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        atom.set(String::from("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn atom_unsubscribe() {
        let atom = Atom::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let handle = atom.listen(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        atom.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.unsubscribe();
        atom.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(atom.listener_count(), 0);
    }

    #[test]
    fn atom_subscribe_calls_immediately() {
        let atom = Atom::new(7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _handle = atom.subscribe(move |value| seen_clone.lock().push(*value));
        atom.set(8);

        assert_eq!(*seen.lock(), vec![7, 8]);
    }

    #[test]
    fn atom_clone_shares_state() {
        let atom1 = Atom::new(0);
        let atom2 = atom1.clone();

        atom1.set(42);
        assert_eq!(atom2.get(), 42);
        assert_eq!(atom1.id(), atom2.id());
    }

    #[derive(Default)]
    struct CountingLifecycle {
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
    }

    impl Lifecycle for CountingLifecycle {
        fn on_mount(&self) {
            self.mounts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unmount(&self) {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn lifecycle_fires_on_first_and_last_listener() {
        let lifecycle = Arc::new(CountingLifecycle::default());
        let atom = Atom::with_lifecycle(0, lifecycle.clone());

        let first = atom.listen(|_| {});
        let second = atom.listen(|_| {});
        assert_eq!(lifecycle.mounts.load(Ordering::SeqCst), 1);

        first.unsubscribe();
        assert_eq!(lifecycle.unmounts.load(Ordering::SeqCst), 0);

        second.unsubscribe();
        assert_eq!(lifecycle.unmounts.load(Ordering::SeqCst), 1);

        let third = atom.listen(|_| {});
        assert_eq!(lifecycle.mounts.load(Ordering::SeqCst), 2);
        third.unsubscribe();
    }

    #[test]
    fn listener_may_unsubscribe_during_notify() {
        let atom = Atom::new(0);
        let slot: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();

        let handle = atom.listen(move |_| {
            if let Some(handle) = slot_clone.lock().take() {
                handle.unsubscribe();
            }
        });
        *slot.lock() = Some(handle);

        atom.set(1);
        assert_eq!(atom.listener_count(), 0);
    }
}
