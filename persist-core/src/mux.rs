//! Key Listener Multiplexer
//!
//! Bindings do not talk to the [`EventBackend`] directly. They attach to a
//! [`KeyMultiplexer`], declaring an [`Interest`] in one key or in a key
//! prefix. The multiplexer decides what to register with the backend:
//!
//! - **shared backends** get a single dispatcher for the whole multiplexer.
//!   It looks each event's key up among the tracked interests.
//! - **per-key backends** get one dispatcher per interest, registered under
//!   that interest's key.
//!
//! # Debounced teardown
//!
//! A binding that loses its last listener calls [`KeyMultiplexer::detach`].
//! The subscription is not removed right away. Instead a deferred removal
//! is scheduled for the configured grace delay. An [`KeyMultiplexer::attach`]
//! for the same interest and binding within that window cancels the removal
//! synchronously, so remount churn never reaches the backend. While the
//! removal is pending the binding keeps receiving events.
//!
//! The deferred removal is a spawned tokio task. It runs on the caller's
//! runtime when there is one, and otherwise on a small background runtime
//! owned by this module. With a zero grace delay, removal happens
//! immediately.
//!
//! # Locking
//!
//! The internal state sits behind one mutex. It is never held while calling
//! the backend or a subscriber, so subscribers may attach and detach from
//! inside event delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backend::{ChangeEvent, EventBackend, Scope, StorageListener};
use crate::error::PersistError;

/// Identifies one binding across all of its subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

impl BindingId {
    /// Generate a new unique binding ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which event keys a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Exactly this key.
    Key(String),
    /// Every key starting with this prefix.
    Prefix(String),
}

impl Interest {
    /// The key this interest registers under on a per-key backend.
    pub fn key(&self) -> &str {
        match self {
            Interest::Key(key) | Interest::Prefix(key) => key,
        }
    }

    /// Whether an event for `key` concerns this interest.
    ///
    /// Store-wide events (`None`) concern everyone.
    pub fn matches(&self, key: Option<&str>) -> bool {
        match (self, key) {
            (_, None) => true,
            (Interest::Key(own), Some(key)) => own == key,
            (Interest::Prefix(prefix), Some(key)) => key.starts_with(prefix.as_str()),
        }
    }
}

type Subscriber = (BindingId, Arc<dyn StorageListener>);

#[derive(Default)]
struct Channel {
    subscribers: SmallVec<[Subscriber; 2]>,
    /// Per-key dispatcher registered with the backend for this interest.
    registration: Option<Arc<dyn StorageListener>>,
}

struct PendingDetach {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct MuxState {
    channels: HashMap<Interest, Channel>,
    pending: HashMap<(Interest, BindingId), PendingDetach>,
    /// Dispatcher installed on a shared backend.
    shared: Option<Arc<dyn StorageListener>>,
    generation: u64,
}

enum BackendOp {
    Add(Option<String>, Arc<dyn StorageListener>),
    Remove(Option<String>, Arc<dyn StorageListener>),
}

fn scope(key: &Option<String>) -> Scope<'_> {
    match key {
        Some(key) => Scope::Key(key),
        None => Scope::All,
    }
}

struct MuxInner {
    events: Arc<dyn EventBackend>,
    grace: Duration,
    state: Mutex<MuxState>,
}

impl MuxInner {
    fn apply(&self, ops: impl IntoIterator<Item = BackendOp>) {
        for op in ops {
            match op {
                BackendOp::Add(key, listener) => {
                    debug!(key = ?key, "registering storage listener");
                    self.events.add_listener(scope(&key), listener);
                }
                BackendOp::Remove(key, listener) => {
                    debug!(key = ?key, "removing storage listener");
                    self.events.remove_listener(scope(&key), &listener);
                }
            }
        }
    }

    /// Subscribers that should see an event for `key`, one per binding.
    fn targets(&self, key: Option<&str>, only: Option<&Interest>) -> Vec<Arc<dyn StorageListener>> {
        let state = self.state.lock();
        let mut seen: SmallVec<[BindingId; 8]> = SmallVec::new();
        let mut targets = Vec::new();

        for (interest, channel) in &state.channels {
            if only.is_some_and(|only| only != interest) || !interest.matches(key) {
                continue;
            }
            for (id, subscriber) in &channel.subscribers {
                if !seen.contains(id) {
                    seen.push(*id);
                    targets.push(Arc::clone(subscriber));
                }
            }
        }
        targets
    }

    fn deliver(&self, event: &ChangeEvent, only: Option<&Interest>) -> Result<(), PersistError> {
        let targets = self.targets(event.key.as_deref(), only);
        trace!(key = ?event.key, targets = targets.len(), "dispatching change");
        for target in targets {
            target.on_change(event)?;
        }
        Ok(())
    }

    fn restore(&self, only: Option<&Interest>) -> Result<(), PersistError> {
        for target in self.targets(None, only) {
            target.on_restore()?;
        }
        Ok(())
    }

    fn remove_subscriber(state: &mut MuxState, interest: &Interest, id: BindingId) -> Vec<BackendOp> {
        let mut ops = Vec::new();
        let Some(channel) = state.channels.get_mut(interest) else {
            return ops;
        };

        channel.subscribers.retain(|(existing, _)| *existing != id);
        if !channel.subscribers.is_empty() {
            return ops;
        }

        if let Some(channel) = state.channels.remove(interest) {
            if let Some(registration) = channel.registration {
                ops.push(BackendOp::Remove(
                    Some(interest.key().to_string()),
                    registration,
                ));
            }
        }
        if state.channels.is_empty() {
            if let Some(shared) = state.shared.take() {
                ops.push(BackendOp::Remove(None, shared));
            }
        }
        ops
    }
}

/// Installed once on a shared backend; routes by comparing event keys.
struct SharedDispatcher {
    mux: Weak<MuxInner>,
}

impl StorageListener for SharedDispatcher {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), PersistError> {
        match self.mux.upgrade() {
            Some(mux) => mux.deliver(event, None),
            None => Ok(()),
        }
    }

    fn on_restore(&self) -> Result<(), PersistError> {
        match self.mux.upgrade() {
            Some(mux) => mux.restore(None),
            None => Ok(()),
        }
    }
}

/// Registered under one key on a per-key backend.
struct KeyDispatcher {
    mux: Weak<MuxInner>,
    interest: Interest,
}

impl StorageListener for KeyDispatcher {
    fn on_change(&self, event: &ChangeEvent) -> Result<(), PersistError> {
        match self.mux.upgrade() {
            Some(mux) => mux.deliver(event, Some(&self.interest)),
            None => Ok(()),
        }
    }

    fn on_restore(&self) -> Result<(), PersistError> {
        match self.mux.upgrade() {
            Some(mux) => mux.restore(Some(&self.interest)),
            None => Ok(()),
        }
    }
}

/// Runtime driving deferred detaches for callers outside any tokio runtime.
///
/// Built on first use and kept for the life of the process.
fn timer_runtime() -> Option<&'static Handle> {
    static TIMERS: OnceLock<Option<Runtime>> = OnceLock::new();
    TIMERS
        .get_or_init(|| {
            match Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("persist-detach")
                .enable_time()
                .build()
            {
                Ok(runtime) => Some(runtime),
                Err(error) => {
                    warn!(%error, "could not start detach timer runtime; detaching eagerly");
                    None
                }
            }
        })
        .as_ref()
        .map(Runtime::handle)
}

/// Routes backend events to bindings and owns their backend registrations.
#[derive(Clone)]
pub struct KeyMultiplexer {
    inner: Arc<MuxInner>,
}

impl KeyMultiplexer {
    pub fn new(events: Arc<dyn EventBackend>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                events,
                grace,
                state: Mutex::new(MuxState::default()),
            }),
        }
    }

    /// Whether the backend addresses listeners per key.
    pub fn per_key(&self) -> bool {
        self.inner.events.per_key()
    }

    pub fn grace_delay(&self) -> Duration {
        self.inner.grace
    }

    /// Start delivering events matching `interest` to `subscriber`.
    ///
    /// Cancels a pending detach for the same interest and binding. A
    /// binding is subscribed to an interest at most once.
    pub fn attach(&self, interest: Interest, id: BindingId, subscriber: Arc<dyn StorageListener>) {
        let op = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if let Some(pending) = state.pending.remove(&(interest.clone(), id)) {
                pending.task.abort();
                trace!(key = interest.key(), ?id, "cancelled pending detach");
                return;
            }

            let per_key = self.inner.events.per_key();
            let channel = state.channels.entry(interest.clone()).or_default();
            if channel.subscribers.iter().any(|(existing, _)| *existing == id) {
                return;
            }
            channel.subscribers.push((id, subscriber));
            trace!(key = interest.key(), ?id, "attached");

            if per_key {
                match channel.registration {
                    Some(_) => None,
                    None => {
                        let dispatcher: Arc<dyn StorageListener> = Arc::new(KeyDispatcher {
                            mux: Arc::downgrade(&self.inner),
                            interest: interest.clone(),
                        });
                        channel.registration = Some(Arc::clone(&dispatcher));
                        Some(BackendOp::Add(Some(interest.key().to_string()), dispatcher))
                    }
                }
            } else if state.shared.is_none() {
                let dispatcher: Arc<dyn StorageListener> = Arc::new(SharedDispatcher {
                    mux: Arc::downgrade(&self.inner),
                });
                state.shared = Some(Arc::clone(&dispatcher));
                Some(BackendOp::Add(None, dispatcher))
            } else {
                None
            }
        };

        self.inner.apply(op);
    }

    /// Stop delivering `interest` to binding `id` once the grace delay passes.
    pub fn detach(&self, interest: &Interest, id: BindingId) {
        let grace = self.inner.grace;
        if grace.is_zero() {
            return self.detach_now(interest, id);
        }
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => match timer_runtime() {
                Some(runtime) => runtime.clone(),
                None => return self.detach_now(interest, id),
            },
        };

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let subscribed = state
            .channels
            .get(interest)
            .is_some_and(|channel| channel.subscribers.iter().any(|(existing, _)| *existing == id));
        let slot = (interest.clone(), id);
        if !subscribed || state.pending.contains_key(&slot) {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let mux = Arc::downgrade(&self.inner);
        let task_interest = interest.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = mux.upgrade() {
                KeyMultiplexer { inner }.complete_detach(&task_interest, id, generation);
            }
        });

        trace!(key = interest.key(), ?id, ?grace, "scheduled detach");
        state.pending.insert(slot, PendingDetach { generation, task });
    }

    /// Remove the subscription right away, cancelling any pending detach.
    pub fn detach_now(&self, interest: &Interest, id: BindingId) {
        let ops = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(pending) = state.pending.remove(&(interest.clone(), id)) {
                pending.task.abort();
            }
            MuxInner::remove_subscriber(state, interest, id)
        };
        self.inner.apply(ops);
    }

    /// Complete every pending detach now.
    pub fn flush(&self) {
        let ops = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let pending: Vec<_> = state.pending.drain().collect();
            let mut ops = Vec::new();
            for ((interest, id), detach) in pending {
                detach.task.abort();
                ops.extend(MuxInner::remove_subscriber(state, &interest, id));
            }
            ops
        };
        self.inner.apply(ops);
    }

    fn complete_detach(&self, interest: &Interest, id: BindingId, generation: u64) {
        let ops = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let slot = (interest.clone(), id);
            match state.pending.get(&slot) {
                Some(pending) if pending.generation == generation => {}
                _ => return,
            }
            state.pending.remove(&slot);
            MuxInner::remove_subscriber(state, interest, id)
        };
        self.inner.apply(ops);
    }

    /// Number of bindings subscribed to `interest`, pending detaches included.
    pub fn subscriber_count(&self, interest: &Interest) -> usize {
        self.inner
            .state
            .lock()
            .channels
            .get(interest)
            .map_or(0, |channel| channel.subscribers.len())
    }

    /// Whether events for `interest` currently reach the multiplexer.
    pub fn is_registered(&self, interest: &Interest) -> bool {
        let state = self.inner.state.lock();
        match state.channels.get(interest) {
            Some(channel) if self.per_key() => channel.registration.is_some(),
            Some(_) => state.shared.is_some(),
            None => false,
        }
    }

    /// Number of detaches waiting for their grace delay.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of interests with at least one subscriber.
    pub fn interest_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }
}

impl std::fmt::Debug for KeyMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMultiplexer")
            .field("per_key", &self.per_key())
            .field("grace", &self.inner.grace)
            .field("interests", &self.interest_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
