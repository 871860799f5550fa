//! Per-session state shared by every response consumer.
//!
//! A [`SessionContext`] ties together the routing registry, the heartbeat
//! reset handle and the "broker lost" flag. Consumers report live traffic
//! through it, and when the heartbeat declares the broker down it fans the
//! notification out to every registered sink.

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicBool, Ordering},
};

use tracing::warn;

use crate::{
    heartbeat::{BrokerDownEvent, BrokerDownListener, HeartbeatHandle, HeartbeatMonitor},
    registry::CallbackRegistry,
};

struct SessionInner {
    session_id: String,
    registry: Arc<CallbackRegistry>,
    broker_lost: AtomicBool,
    node_down: AtomicBool,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

/// Cheaply cloneable handle to a session's shared state.
///
/// # Examples
///
/// ```
/// use brokerframe::session::SessionContext;
///
/// let session = SessionContext::new("session-1");
/// assert!(!session.is_broker_lost());
/// assert!(session.registry().active_ids().is_empty());
/// ```
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.inner.session_id)
            .field("broker_lost", &self.is_broker_lost())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Create a session with a fresh registry.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self::with_registry(session_id, Arc::new(CallbackRegistry::new()))
    }

    /// Create a session routing through an existing registry.
    #[must_use]
    pub fn with_registry(session_id: impl Into<String>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                session_id: session_id.into(),
                registry,
                broker_lost: AtomicBool::new(false),
                node_down: AtomicBool::new(false),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str { &self.inner.session_id }

    /// Registry transports route through.
    #[must_use]
    pub fn registry(&self) -> &Arc<CallbackRegistry> { &self.inner.registry }

    /// Subscribe to `monitor` and keep its reset handle.
    ///
    /// Once attached, broker-down events mark the session lost and are
    /// broadcast to every registered sink.
    pub fn attach_heartbeat(&self, monitor: &HeartbeatMonitor) {
        *self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(monitor.handle());
        monitor.subscribe(Arc::new(self.clone()));
    }

    /// Report live traffic to the heartbeat, if one is attached.
    pub fn reset_heartbeat(&self) {
        let guard = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = guard.as_ref() {
            handle.reset();
        }
    }

    /// Returns `true` once the heartbeat has declared the broker down.
    #[must_use]
    pub fn is_broker_lost(&self) -> bool { self.inner.broker_lost.load(Ordering::Acquire) }

    /// Whether the recorded loss was node-level. Meaningless until
    /// [`is_broker_lost`](Self::is_broker_lost) returns `true`.
    #[must_use]
    pub fn is_node_down(&self) -> bool { self.inner.node_down.load(Ordering::Acquire) }

    /// Mark the broker lost and notify every registered sink.
    pub fn broker_down(&self, node_down: bool) {
        self.inner.node_down.store(node_down, Ordering::Release);
        if self.inner.broker_lost.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            session = %self.inner.session_id,
            node_down,
            "session lost its broker"
        );
        self.inner.registry.broadcast_broker_down(node_down);
    }
}

impl BrokerDownListener for SessionContext {
    fn on_broker_down(&self, event: BrokerDownEvent) { self.broker_down(event.node_down); }
}
