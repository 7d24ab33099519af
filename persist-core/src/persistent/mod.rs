//! Persistent Stores
//!
//! [`PersistentAtom`] and [`PersistentMap`] wrap the reactive stores and keep
//! them in sync with an engine's storage:
//!
//! - **construction** reads the stored value (decoded) or falls back to the
//!   initial value. Nothing is written back.
//! - **local writes** (`set`, `set_key`) encode and write to storage
//!   synchronously, before the in-memory value changes. An encoder returning
//!   `None` removes the key.
//! - **external changes** arrive through the engine's multiplexer while the
//!   store has listeners. A removed key reverts to its initial value.
//!
//! # Binding lifecycle
//!
//! ```text
//!  Init ──first listener──▶ Listening ──last listener gone──▶ Idle
//!                              ▲                                │
//!                              └────────next listener───────────┘
//!  any ──dispose()──▶ Terminal
//! ```
//!
//! In `Idle` the event registration survives for the engine's grace delay
//! and is then removed. A listener arriving before that cancels the removal.
//! Bindings created with `listen(false)` never leave `Init`: they read and
//! write storage but never hear other contexts.

mod atom;
mod map;

pub use atom::PersistentAtom;
pub use map::PersistentMap;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, Identity, JsonCodec};
use crate::engine::{Engine, EngineHandle};

/// Where a binding is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Created, never listened to (or created with `listen(false)`).
    Init,
    /// Has listeners and is registered for external changes.
    Listening,
    /// No listeners; registration is waiting out the grace delay.
    Idle,
    /// Disposed; external changes are ignored.
    Terminal,
}

/// Per-binding options.
///
/// ```rust,ignore
/// let locale = PersistentAtom::with_options(
///     "locale",
///     vec!["en".to_string(), "US".to_string()],
///     PersistentOptions::json().listen(false),
/// )?;
/// ```
pub struct PersistentOptions<T> {
    listen: bool,
    codec: Arc<dyn Codec<T>>,
    engine: Option<EngineHandle>,
}

impl<T> PersistentOptions<T>
where
    T: 'static,
{
    /// Identity codec, listening on, global engine.
    pub fn new() -> Self
    where
        Identity: Codec<T>,
    {
        Self::with_codec(Identity)
    }

    /// JSON codec via `serde_json`.
    pub fn json() -> Self
    where
        T: Serialize + DeserializeOwned,
    {
        Self::with_codec(JsonCodec::new())
    }

    pub fn with_codec(codec: impl Codec<T> + 'static) -> Self {
        Self {
            listen: true,
            codec: Arc::new(codec),
            engine: None,
        }
    }

    /// Whether to apply changes made by other contexts. Defaults to `true`.
    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    pub fn codec(mut self, codec: impl Codec<T> + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Resolve backends from `handle` instead of the global one.
    pub fn engine(mut self, handle: &EngineHandle) -> Self {
        self.engine = Some(handle.clone());
        self
    }

    fn resolve_engine(&self) -> Arc<Engine> {
        match &self.engine {
            Some(handle) => handle.current(),
            None => EngineHandle::global().current(),
        }
    }
}

impl<T> Default for PersistentOptions<T>
where
    T: 'static,
    Identity: Codec<T>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PersistentOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentOptions")
            .field("listen", &self.listen)
            .field("engine", &self.engine.is_some())
            .finish()
    }
}
