//! Routing directory between transports and response consumers.
//!
//! `CallbackRegistry` stores non-owning weak references to
//! [`ResponseSink`]s keyed by an opaque [`RegistrationId`]. Transports only
//! ever see the id; they route messages through the registry without knowing
//! which consumer sits behind it. Dropped consumers are pruned lazily at
//! lookup time, and a message routed to an unknown id is a harmless no-op.
use std::sync::{
    Arc,
    Weak,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use log::debug;

use crate::message::BrokerMessage;

/// Opaque identifier handed out by [`CallbackRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl From<u64> for RegistrationId {
    fn from(value: u64) -> Self { Self(value) }
}

impl RegistrationId {
    /// Create a [`RegistrationId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegistrationId({})", self.0)
    }
}

/// Capability interface exposed to transports by every response consumer.
///
/// Implementations must return promptly: they run on transport delivery
/// tasks and timer tasks.
pub trait ResponseSink: Send + Sync + 'static {
    /// Deliver one inbound message.
    fn on_response(&self, message: BrokerMessage);

    /// The broker (or its node) became unreachable.
    fn on_broker_down(&self, node_down: bool);

    /// Stop accepting deliveries and release resources.
    fn close(&self);
}

/// Concurrent registry of response sinks keyed by [`RegistrationId`].
#[derive(Default)]
pub struct CallbackRegistry {
    sinks: DashMap<RegistrationId, Weak<dyn ResponseSink>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("registered", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl CallbackRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `sink` and return the id transports use to reach it.
    ///
    /// Only a weak reference is stored; the caller keeps the sink alive.
    pub fn register<S: ResponseSink>(&self, sink: &Arc<S>) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let weak: Weak<S> = Arc::downgrade(sink);
        self.sinks.insert(id, weak);
        debug!("response sink registered: id={id}");
        id
    }

    /// Remove a registration. Returns `true` if it was present.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let removed = self.sinks.remove(&id).is_some();
        if removed {
            debug!("response sink unregistered: id={id}");
        }
        removed
    }

    /// Retrieve the sink for `id` if it is still alive.
    pub fn get(&self, id: RegistrationId) -> Option<Arc<dyn ResponseSink>> {
        let guard = self.sinks.get(&id);
        let sink = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if sink.is_none() {
            self.sinks.remove_if(&id, |_, weak| weak.strong_count() == 0);
        }
        sink
    }

    /// Deliver `message` to the sink registered under `id`.
    ///
    /// The map guard is released before the sink runs. Returns `false` when
    /// no live sink is registered; late deliveries after unregistration land
    /// here and are dropped.
    pub fn route(&self, id: RegistrationId, message: BrokerMessage) -> bool {
        match self.get(id) {
            Some(sink) => {
                sink.on_response(message);
                true
            }
            None => {
                debug!("dropping message for unregistered sink: id={id}");
                false
            }
        }
    }

    /// Notify every live sink that the broker went down.
    pub fn broadcast_broker_down(&self, node_down: bool) {
        for (_, sink) in self.active_sinks() {
            sink.on_broker_down(node_down);
        }
    }

    /// Close every live sink.
    pub fn close_all(&self) {
        for (_, sink) in self.active_sinks() {
            sink.close();
        }
    }

    /// Remove all stale weak references.
    ///
    /// `DashMap::retain` acquires per-bucket write locks, so other operations
    /// may contend briefly while the registry is pruned.
    pub fn prune(&self) { self.sinks.retain(|_, weak| weak.strong_count() > 0); }

    /// Prune stale weak references, then return the ids of live sinks.
    #[must_use]
    pub fn active_ids(&self) -> Vec<RegistrationId> {
        let mut ids = Vec::with_capacity(self.sinks.len());
        self.sinks.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids
    }

    /// Snapshot live sinks so callbacks run without holding map locks.
    fn active_sinks(&self) -> Vec<(RegistrationId, Arc<dyn ResponseSink>)> {
        let mut sinks = Vec::with_capacity(self.sinks.len());
        self.sinks.retain(|id, weak| {
            if let Some(sink) = weak.upgrade() {
                sinks.push((*id, sink));
                true
            } else {
                false
            }
        });
        sinks
    }
}
