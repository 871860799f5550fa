//! Broker liveness supervision.
//!
//! [`HeartbeatMonitor`] probes the broker on a fixed interval, independently
//! of request traffic. Consecutive probe failures are counted; once the
//! configured retry count is reached, or once a probe shows the broker no
//! longer serves the session, every subscribed [`BrokerDownListener`] is
//! notified and the monitor stops for good.
//!
//! Successful traffic observed elsewhere calls [`HeartbeatHandle::reset`],
//! which clears the failure count and skips the next scheduled probe.

mod probe;

use std::sync::{
    Arc,
    Mutex,
    PoisonError,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

pub use probe::{BrokerIdentity, BrokerProbe, ProbeClientFactory, ProbeError};
use tokio::{
    runtime::Handle,
    sync::Notify,
    task::JoinHandle,
    time::{Duration, Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{config::HeartbeatConfig, panic::guarded};

/// Notification raised when the broker is considered down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerDownEvent {
    /// `true` when probes kept failing (the node is unreachable), `false`
    /// when a probe succeeded but showed the broker no longer serves the
    /// session.
    pub node_down: bool,
}

/// Observer of [`BrokerDownEvent`]s.
///
/// Any `Fn(BrokerDownEvent)` closure is a listener.
pub trait BrokerDownListener: Send + Sync + 'static {
    /// Called once when the monitor trips.
    fn on_broker_down(&self, event: BrokerDownEvent);
}

impl<F> BrokerDownListener for F
where
    F: Fn(BrokerDownEvent) + Send + Sync + 'static,
{
    fn on_broker_down(&self, event: BrokerDownEvent) { self(event); }
}

/// State shared between the monitor, its handles and the probe task.
struct HeartbeatShared {
    config: HeartbeatConfig,
    missed: AtomicU32,
    stopped: AtomicBool,
    tripped: AtomicBool,
    ignore_next_tick: AtomicBool,
    resume: Notify,
    listeners: Mutex<Vec<Arc<dyn BrokerDownListener>>>,
    runtime: Handle,
}

impl HeartbeatShared {
    fn reset(&self) {
        self.missed.store(0, Ordering::Release);
        if !self.tripped.load(Ordering::Acquire) && self.stopped.swap(false, Ordering::AcqRel) {
            // The resumed ticker already waits a full interval.
            self.ignore_next_tick.store(false, Ordering::Release);
            debug!(session = self.config.session_id(), "heartbeat resumed");
            self.resume.notify_one();
        } else {
            self.ignore_next_tick.store(true, Ordering::Release);
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(session = self.config.session_id(), "heartbeat stopped");
        }
    }

    fn is_running(&self) -> bool { !self.stopped.load(Ordering::Acquire) }

    /// Stop permanently and notify listeners. Only the first call has any
    /// effect.
    fn trip(&self, node_down: bool) {
        if self.tripped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        error!(
            session = self.config.session_id(),
            node_down,
            missed = self.missed.load(Ordering::Acquire),
            "broker is down"
        );
        crate::metrics::inc_broker_down();

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let event = BrokerDownEvent { node_down };
        // Dispatched off the probe task so a slow listener cannot stall it.
        self.runtime.spawn(async move {
            for listener in listeners {
                guarded("broker_down_listener", || listener.on_broker_down(event));
            }
        });
    }
}

/// Outcome of a probe that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Alive,
    NotServing,
}

/// Probe client state, owned by the probe task.
struct Prober {
    factory: Arc<dyn ProbeClientFactory>,
    client: Box<dyn BrokerProbe>,
    expected: Option<String>,
    legacy: bool,
}

impl Prober {
    async fn tick(&mut self, shared: &HeartbeatShared) {
        if shared.ignore_next_tick.swap(false, Ordering::AcqRel) {
            trace!(
                session = shared.config.session_id(),
                "skipping probe after recent traffic"
            );
            return;
        }

        match self
            .probe(shared.config.session_id(), shared.config.probe_timeout())
            .await
        {
            Ok(Verdict::Alive) => shared.missed.store(0, Ordering::Release),
            Ok(Verdict::NotServing) => shared.trip(false),
            Err(error) => {
                let missed = shared.missed.fetch_add(1, Ordering::AcqRel) + 1;
                crate::metrics::inc_heartbeat_misses();
                warn!(
                    session = shared.config.session_id(),
                    missed,
                    retry_count = shared.config.retry_count(),
                    %error,
                    "heartbeat probe failed"
                );
                if missed >= shared.config.retry_count() {
                    shared.trip(true);
                } else {
                    self.client = self.factory.create();
                }
            }
        }
    }

    async fn probe(&mut self, session_id: &str, timeout: Duration) -> Result<Verdict, ProbeError> {
        if !self.legacy {
            match bounded(timeout, self.client.probe(session_id)).await {
                Ok(identity) => return Ok(self.check_identity(identity)),
                Err(ProbeError::NotSupported) if self.expected.is_none() => {
                    info!(
                        session = session_id,
                        "extended probe unsupported; using legacy probe"
                    );
                    self.legacy = true;
                }
                Err(error) => return Err(error),
            }
        }
        let serving = bounded(timeout, self.client.probe_legacy(session_id)).await?;
        Ok(if serving {
            Verdict::Alive
        } else {
            Verdict::NotServing
        })
    }

    /// The first token seen pins the broker instance; any later change
    /// means the broker was recycled.
    fn check_identity(&mut self, identity: BrokerIdentity) -> Verdict {
        match identity {
            BrokerIdentity::NotFound => Verdict::NotServing,
            BrokerIdentity::Token(token) => match &self.expected {
                None => {
                    self.expected = Some(token);
                    Verdict::Alive
                }
                Some(expected) if *expected == token => Verdict::Alive,
                Some(expected) => {
                    warn!(%expected, actual = %token, "broker identity changed");
                    Verdict::NotServing
                }
            },
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ProbeError>>,
) -> Result<T, ProbeError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ProbeError::TimedOut(timeout))?
}

async fn run(shared: Arc<HeartbeatShared>, mut prober: Prober, shutdown: CancellationToken) {
    probe_until_done(&shared, &mut prober, &shutdown).await;
    prober.factory.close();
    debug!(session = shared.config.session_id(), "heartbeat task finished");
}

async fn probe_until_done(
    shared: &HeartbeatShared,
    prober: &mut Prober,
    shutdown: &CancellationToken,
) {
    let period = shared.config.interval();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if !shared.is_running() {
            if shared.tripped.load(Ordering::Acquire) {
                return;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                () = shared.resume.notified() => {
                    ticker.reset();
                    continue;
                }
            }
        }
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if shared.is_running() {
            prober.tick(shared).await;
        }
    }
}

/// Cheap handle for signalling traffic to a [`HeartbeatMonitor`].
#[derive(Clone)]
pub struct HeartbeatHandle {
    shared: Arc<HeartbeatShared>,
}

impl std::fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("session", &self.shared.config.session_id())
            .finish_non_exhaustive()
    }
}

impl HeartbeatHandle {
    /// Record evidence of broker liveness.
    ///
    /// Clears the failure count, skips the next scheduled probe and resumes
    /// a stopped (but not tripped) monitor.
    pub fn reset(&self) { self.shared.reset(); }

    /// Returns `true` while probes are scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool { self.shared.is_running() }

    /// Consecutive failed probes since the last success or reset.
    #[must_use]
    pub fn missed_count(&self) -> u32 { self.shared.missed.load(Ordering::Acquire) }
}

/// Periodic broker probe with failure threshold.
///
/// The probe task closes the factory when it ends: after a trip, after
/// [`shutdown`](Self::shutdown), or once the monitor is dropped.
///
/// # Examples
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use brokerframe::{
///     config::HeartbeatConfig,
///     heartbeat::{BrokerDownEvent, HeartbeatMonitor, ProbeClientFactory},
/// };
///
/// # async fn demo(factory: Arc<dyn ProbeClientFactory>) {
/// let config = HeartbeatConfig::builder("session-1")
///     .interval(Duration::from_secs(1))
///     .retry_count(3)
///     .build()
///     .expect("valid heartbeat configuration");
/// let monitor = HeartbeatMonitor::start(config, factory);
/// monitor.subscribe(Arc::new(|event: BrokerDownEvent| {
///     eprintln!("broker down, node_down={}", event.node_down);
/// }));
/// monitor.shutdown().await;
/// # }
/// ```
pub struct HeartbeatMonitor {
    shared: Arc<HeartbeatShared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("config", &self.shared.config)
            .field("running", &self.shared.is_running())
            .finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    /// Start probing. The first probe runs one interval from now.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn start(config: HeartbeatConfig, factory: Arc<dyn ProbeClientFactory>) -> Self {
        let runtime = Handle::current();
        let shared = Arc::new(HeartbeatShared {
            config,
            missed: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
            ignore_next_tick: AtomicBool::new(false),
            resume: Notify::new(),
            listeners: Mutex::new(Vec::new()),
            runtime: runtime.clone(),
        });
        let prober = Prober {
            client: factory.create(),
            factory,
            expected: None,
            legacy: false,
        };
        let shutdown = CancellationToken::new();
        let task = runtime.spawn(run(Arc::clone(&shared), prober, shutdown.clone()));
        debug!(
            session = shared.config.session_id(),
            interval = ?shared.config.interval(),
            retry_count = shared.config.retry_count(),
            "heartbeat started"
        );
        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Register a listener for broker-down notifications.
    pub fn subscribe(&self, listener: Arc<dyn BrokerDownListener>) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Handle used to report traffic without owning the monitor.
    #[must_use]
    pub fn handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`HeartbeatHandle::reset`].
    pub fn reset(&self) { self.shared.reset(); }

    /// Pause probing until the next [`reset`](Self::reset).
    pub fn stop(&self) { self.shared.stop(); }

    /// Returns `true` while probes are scheduled.
    #[must_use]
    pub fn is_running(&self) -> bool { self.shared.is_running() }

    /// Returns `true` once the monitor has declared the broker down.
    #[must_use]
    pub fn is_tripped(&self) -> bool { self.shared.tripped.load(Ordering::Acquire) }

    /// Consecutive failed probes since the last success or reset.
    #[must_use]
    pub fn missed_count(&self) -> u32 { self.shared.missed.load(Ordering::Acquire) }

    /// Stop probing and wait for the probe task to finish, which closes
    /// the factory. No probe runs after this returns. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.stop();
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) { self.shutdown.cancel(); }
}
