//! Storage and Event Backends
//!
//! The persistence layer talks to two external collaborators:
//!
//! - a [`StorageBackend`]: a synchronous string key/value store
//! - an [`EventBackend`]: the channel through which *other* execution
//!   contexts announce their writes
//!
//! # Addressing modes
//!
//! An event backend is either shared (`per_key() == false`, the default)
//! or per-key. A shared backend hands every notification to every listener,
//! and listeners filter by key themselves. A per-key backend registers
//! listeners for one key and only delivers notifications for that key.
//!
//! Listeners are identified by pointer identity: `remove_listener` must be
//! passed the same `Arc` that was given to `add_listener`.
//!
//! # Built-in backends
//!
//! - [`MemoryStorage`] / [`MemoryEvents`]: in-process, for tests and
//!   single-context use
//! - [`NoopStorage`] / [`NoopEvents`]: the fallback installed before
//!   anything is configured
//! - [`BroadcastHub`]: several simulated contexts sharing one store, each
//!   hearing the others' writes but never its own

mod broadcast;
mod memory;
mod noop;

pub use broadcast::{BroadcastHub, ContextId, ContextStorage};
pub use memory::{MemoryEvents, MemoryStorage};
pub use noop::{NoopEvents, NoopStorage};

use std::sync::Arc;

use crate::error::{PersistError, StorageError};

/// A synchronous string key/value store.
///
/// A missing key and a key holding the empty string are distinct.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Every key currently stored.
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    fn clear(&self) -> Result<(), StorageError> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}

/// A change made by another execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The key that changed. `None` for store-wide events such as a clear.
    pub key: Option<String>,
    /// The new stored string. `None` when the key was removed.
    pub new_value: Option<String>,
}

impl ChangeEvent {
    /// `key` now holds `value`.
    pub fn changed(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            new_value: Some(value.into()),
        }
    }

    /// `key` was removed.
    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            new_value: None,
        }
    }

    /// The whole store was cleared.
    pub fn cleared() -> Self {
        Self {
            key: None,
            new_value: None,
        }
    }

    pub fn is_store_wide(&self) -> bool {
        self.key.is_none()
    }
}

/// Callback registered with an [`EventBackend`].
pub trait StorageListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), PersistError>;

    /// The context may have missed changes (e.g. it was suspended) and
    /// should re-read storage.
    fn on_restore(&self) -> Result<(), PersistError> {
        Ok(())
    }
}

/// What a listener is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope<'a> {
    /// Every notification (shared backends).
    All,
    /// Notifications for one key (per-key backends).
    Key(&'a str),
}

/// Source of change notifications from other contexts.
pub trait EventBackend: Send + Sync {
    /// Whether listeners are registered per key.
    fn per_key(&self) -> bool {
        false
    }

    fn add_listener(&self, scope: Scope<'_>, listener: Arc<dyn StorageListener>);

    fn remove_listener(&self, scope: Scope<'_>, listener: &Arc<dyn StorageListener>);
}

/// Pointer identity for listeners, ignoring vtables.
pub(crate) fn same_listener(a: &Arc<dyn StorageListener>, b: &Arc<dyn StorageListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl StorageListener for Nop {
        fn on_change(&self, _event: &ChangeEvent) -> Result<(), PersistError> {
            Ok(())
        }
    }

    #[test]
    fn change_event_constructors() {
        assert_eq!(
            ChangeEvent::changed("a", "1"),
            ChangeEvent {
                key: Some("a".into()),
                new_value: Some("1".into())
            }
        );
        assert_eq!(ChangeEvent::removed("a").new_value, None);
        assert!(ChangeEvent::cleared().is_store_wide());
    }

    #[test]
    fn listener_identity_is_by_pointer() {
        let a: Arc<dyn StorageListener> = Arc::new(Nop);
        let b: Arc<dyn StorageListener> = Arc::new(Nop);
        assert!(same_listener(&a, &a.clone()));
        assert!(!same_listener(&a, &b));
    }
}
