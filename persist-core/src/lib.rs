//! Persist Core
//!
//! Reactive atoms and maps that stay in sync with a string key/value store,
//! across several execution contexts sharing that store.
//!
//! - Local writes go to storage first, then to listeners.
//! - Writes made by other contexts arrive through an event backend and are
//!   applied while the store is observed.
//! - Removing a key reverts the bound value to its initial value.
//!
//! # Architecture
//!
//! - `reactive`: plain [`Atom`](reactive::Atom) and [`MapStore`](reactive::MapStore)
//!   with mount/unmount hooks
//! - `backend`: storage and event backend traits plus in-memory backends
//! - `mux`: shares event registrations between bindings, with debounced teardown
//! - `engine`: the swappable backend registry
//! - `persistent`: [`PersistentAtom`] and [`PersistentMap`]
//! - `codec`: string encodings for stored values
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use persist_core::{configure, MemoryEvents, MemoryStorage, PersistentAtom};
//!
//! configure(Arc::new(MemoryStorage::new()), Arc::new(MemoryEvents::new()));
//!
//! let theme = PersistentAtom::new("theme", "light".to_string())?;
//! let _listener = theme.listen(|theme| println!("theme is now {theme}"));
//!
//! theme.set("dark".to_string())?;
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod mux;
pub mod persistent;
pub mod reactive;
pub mod testing;

pub use backend::{
    BroadcastHub, ChangeEvent, EventBackend, MemoryEvents, MemoryStorage, NoopEvents, NoopStorage,
    Scope, StorageBackend, StorageListener,
};
pub use codec::{Codec, FnCodec, Identity, JsonCodec};
pub use config::EngineConfig;
pub use engine::{configure, Engine, EngineHandle};
pub use error::{CodecError, PersistError, Result, StorageError};
pub use persistent::{BindingState, PersistentAtom, PersistentMap, PersistentOptions};
pub use reactive::Unsubscribe;
