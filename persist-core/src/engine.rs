//! Engine Registry
//!
//! An [`Engine`] bundles the storage backend, the event backend, the
//! multiplexer built on top of that event backend, and the config they were
//! created with. An [`EngineHandle`] is a swappable slot holding the current
//! engine.
//!
//! # Resolution
//!
//! A binding resolves `handle.current()` once, at construction, and keeps that
//! engine for life. Reconfiguring a handle therefore only affects bindings
//! created afterwards. Existing ones keep talking to the old backends until
//! they are recreated.
//!
//! # The global handle
//!
//! [`EngineHandle::global`] is the process-wide slot used when a binding is
//! not given a handle explicitly. It starts out with [`NoopStorage`] and
//! [`NoopEvents`]: reads miss, writes are dropped, and no events arrive.
//! Bound values still work, just without persistence.

use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::backend::{EventBackend, NoopEvents, NoopStorage, StorageBackend};
use crate::config::EngineConfig;
use crate::mux::KeyMultiplexer;

/// One configured set of backends.
pub struct Engine {
    storage: Arc<dyn StorageBackend>,
    events: Arc<dyn EventBackend>,
    mux: KeyMultiplexer,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        events: Arc<dyn EventBackend>,
        config: EngineConfig,
    ) -> Self {
        let mux = KeyMultiplexer::new(Arc::clone(&events), config.grace_delay());
        Self {
            storage,
            events,
            mux,
            config,
        }
    }

    /// The no-op engine installed before anything is configured.
    pub fn fallback() -> Self {
        Self::new(
            Arc::new(NoopStorage),
            Arc::new(NoopEvents),
            EngineConfig::default(),
        )
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn events(&self) -> &Arc<dyn EventBackend> {
        &self.events
    }

    pub fn mux(&self) -> &KeyMultiplexer {
        &self.mux
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Finish every debounced deregistration now.
    pub fn shutdown(&self) {
        debug!("shutting down engine");
        self.mux.flush();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("mux", &self.mux)
            .finish()
    }
}

/// Swappable slot holding the current [`Engine`].
///
/// Clones share the slot.
#[derive(Clone)]
pub struct EngineHandle {
    slot: Arc<ArcSwap<Engine>>,
}

static GLOBAL: OnceLock<EngineHandle> = OnceLock::new();

impl EngineHandle {
    /// A new, independent handle.
    pub fn new(storage: Arc<dyn StorageBackend>, events: Arc<dyn EventBackend>) -> Self {
        Self::with_config(storage, events, EngineConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn StorageBackend>,
        events: Arc<dyn EventBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(Engine::new(storage, events, config))),
        }
    }

    /// The process-wide handle.
    pub fn global() -> &'static EngineHandle {
        GLOBAL.get_or_init(|| Self {
            slot: Arc::new(ArcSwap::from_pointee(Engine::fallback())),
        })
    }

    /// The engine new bindings will use.
    pub fn current(&self) -> Arc<Engine> {
        self.slot.load_full()
    }

    /// Replace both backends, keeping the current config.
    pub fn configure(&self, storage: Arc<dyn StorageBackend>, events: Arc<dyn EventBackend>) {
        let config = self.slot.load().config().clone();
        self.configure_with(storage, events, config);
    }

    /// Replace both backends and the config.
    pub fn configure_with(
        &self,
        storage: Arc<dyn StorageBackend>,
        events: Arc<dyn EventBackend>,
        config: EngineConfig,
    ) {
        debug!(per_key = events.per_key(), grace_ms = config.grace_delay_ms, "swapping persistence engine");
        self.slot
            .store(Arc::new(Engine::new(storage, events, config)));
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("current", &self.current())
            .finish()
    }
}

/// Reconfigure the process-wide engine.
pub fn configure(storage: Arc<dyn StorageBackend>, events: Arc<dyn EventBackend>) {
    EngineHandle::global().configure(storage, events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryEvents, MemoryStorage};
    use std::time::Duration;

    #[test]
    fn swap_replaces_both_backends() {
        let first = Arc::new(MemoryStorage::new());
        let handle = EngineHandle::new(first.clone(), Arc::new(MemoryEvents::new()));
        let before = handle.current();

        let second = Arc::new(MemoryStorage::new());
        handle.configure(second.clone(), Arc::new(MemoryEvents::per_key()));
        let after = handle.current();

        assert!(!Arc::ptr_eq(&before, &after));
        after.storage().set("k", "v").unwrap();
        assert_eq!(second.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(first.get("k").unwrap(), None);
        assert!(after.events().per_key());
    }

    #[test]
    fn configure_keeps_config() {
        let config = EngineConfig::default().with_grace_delay(Duration::from_millis(5));
        let handle = EngineHandle::with_config(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryEvents::new()),
            config.clone(),
        );
        handle.configure(Arc::new(MemoryStorage::new()), Arc::new(MemoryEvents::new()));

        assert_eq!(handle.current().config(), &config);
        assert_eq!(handle.current().mux().grace_delay(), Duration::from_millis(5));
    }

    #[test]
    fn clones_share_the_slot() {
        let handle = EngineHandle::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryEvents::new()));
        let clone = handle.clone();
        clone.configure(Arc::new(MemoryStorage::new()), Arc::new(MemoryEvents::new()));

        assert!(Arc::ptr_eq(&handle.current(), &clone.current()));
    }

    #[test]
    fn fallback_engine_reads_nothing() {
        let engine = Engine::fallback();
        engine.storage().set("k", "v").unwrap();
        assert_eq!(engine.storage().get("k").unwrap(), None);
    }
}
