//! Probe clients replaying scripted outcomes.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use brokerframe::heartbeat::{BrokerIdentity, BrokerProbe, ProbeClientFactory, ProbeError};

/// Result of one extended probe.
pub type ProbeOutcome = Result<BrokerIdentity, ProbeError>;

struct Shared {
    outcomes: VecDeque<ProbeOutcome>,
    fallback: ProbeOutcome,
    created: usize,
    probes: usize,
    closed: bool,
}

/// Factory whose clients share one queue of probe outcomes.
///
/// Once the queue is empty every probe returns the fallback outcome, which
/// starts as a healthy broker identified by `"broker-1"`.
#[derive(Clone)]
pub struct ScriptedProbeFactory {
    shared: Arc<Mutex<Shared>>,
}

impl Default for ScriptedProbeFactory {
    fn default() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                outcomes: VecDeque::new(),
                fallback: Ok(BrokerIdentity::Token("broker-1".into())),
                created: 0,
                probes: 0,
                closed: false,
            })),
        }
    }
}

impl ScriptedProbeFactory {
    /// Create a factory reporting a healthy broker.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Queue `outcome` for the next probe.
    pub fn push(&self, outcome: ProbeOutcome) { self.lock().outcomes.push_back(outcome); }

    /// Outcome returned once the queue is empty.
    pub fn set_fallback(&self, outcome: ProbeOutcome) { self.lock().fallback = outcome; }

    /// Number of clients created.
    #[must_use]
    pub fn created(&self) -> usize { self.lock().created }

    /// Number of probes answered.
    #[must_use]
    pub fn probes(&self) -> usize { self.lock().probes }

    /// Whether the heartbeat released the factory.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.lock().closed }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> ProbeOutcome {
        let mut shared = self.lock();
        shared.probes += 1;
        match shared.outcomes.pop_front() {
            Some(outcome) => outcome,
            None => shared.fallback.clone(),
        }
    }
}

impl ProbeClientFactory for ScriptedProbeFactory {
    fn create(&self) -> Box<dyn BrokerProbe> {
        self.lock().created += 1;
        Box::new(ScriptedProbe {
            factory: self.clone(),
        })
    }

    fn close(&self) { self.lock().closed = true; }
}

struct ScriptedProbe {
    factory: ScriptedProbeFactory,
}

#[async_trait]
impl BrokerProbe for ScriptedProbe {
    async fn probe(&self, _session_id: &str) -> Result<BrokerIdentity, ProbeError> {
        self.factory.next()
    }

    async fn probe_legacy(&self, _session_id: &str) -> Result<bool, ProbeError> {
        match self.factory.next() {
            Ok(BrokerIdentity::Token(_)) => Ok(true),
            Ok(BrokerIdentity::NotFound) => Ok(false),
            Err(ProbeError::NotSupported) => Err(ProbeError::Failed("legacy probe rejected".into())),
            Err(error) => Err(error),
        }
    }
}
