//! Reactive Stores
//!
//! This module implements the small reactive layer the persistence bindings
//! sit on: a single-value [`Atom`] and a keyed [`MapStore`].
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An Atom is a container for mutable state. Callers read it with `get`,
//! replace it with `set`, and observe it with `listen`. Listeners only fire
//! when the value actually changes.
//!
//! ## Map stores
//!
//! A MapStore is an Atom over a `BTreeMap<String, V>` with per-entry
//! setters. Listeners see the whole map after each change.
//!
//! ## Lifecycle
//!
//! Both stores accept a [`Lifecycle`] hook. It is told when the store gains
//! its first listener ("mount") and loses its last one ("unmount"). The
//! persistence bindings use these two edges to start and stop listening for
//! changes from other contexts.

mod atom;
mod listener;
mod map;

pub use atom::Atom;
pub use listener::{Lifecycle, ListenerId, Unsubscribe};
pub use map::{MapStore, MapValue};
