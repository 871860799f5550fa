//! Probe surface used by the heartbeat.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Identity reported by the extended probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerIdentity {
    /// Opaque token identifying the broker instance serving the session.
    Token(String),
    /// The broker has no record of the session.
    NotFound,
}

/// Errors raised by a probe call.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The broker does not implement the extended probe.
    #[error("extended probe is not supported by the broker")]
    NotSupported,
    /// The probe call failed.
    #[error("probe failed: {0}")]
    Failed(String),
    /// The probe call did not complete in time.
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),
}

/// Client used to probe the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerProbe: Send + Sync {
    /// Extended probe returning the identity of the serving broker.
    async fn probe(&self, session_id: &str) -> Result<BrokerIdentity, ProbeError>;

    /// Legacy probe reporting only whether the broker serves the session.
    async fn probe_legacy(&self, session_id: &str) -> Result<bool, ProbeError>;
}

/// Creates probe clients.
///
/// The heartbeat discards its client after every failed probe, since a
/// failed channel may be unusable, and asks the factory for a new one.
///
/// Any `Fn() -> Box<dyn BrokerProbe>` closure is a factory.
pub trait ProbeClientFactory: Send + Sync + 'static {
    /// Create a fresh probe client.
    fn create(&self) -> Box<dyn BrokerProbe>;

    /// Release factory resources. Called once when the heartbeat is shut
    /// down.
    fn close(&self) {}
}

impl<F> ProbeClientFactory for F
where
    F: Fn() -> Box<dyn BrokerProbe> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn BrokerProbe> { self() }
}
