//! Fallback backends used before anything is configured.
//!
//! Reads always miss and writes are dropped, so bound values behave like
//! plain in-memory stores seeded with their initial value.

use std::sync::Arc;

use super::{EventBackend, Scope, StorageBackend, StorageListener};
use crate::error::StorageError;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl StorageBackend for NoopStorage {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}

/// Accepts registrations and never delivers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventBackend for NoopEvents {
    fn add_listener(&self, _scope: Scope<'_>, _listener: Arc<dyn StorageListener>) {}

    fn remove_listener(&self, _scope: Scope<'_>, _listener: &Arc<dyn StorageListener>) {}
}
