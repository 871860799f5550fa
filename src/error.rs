//! Canonical error and result types for the crate.
//!
//! [`BrokerError`] is the single error surface observed by consumers of the
//! response pipeline. It is `Clone` because the same failure is frequently
//! stored once and raised many times: carried inside a response item, or
//! captured when the broker goes down and re-raised to every waiting
//! consumer.

use std::time::Duration;

use thiserror::Error;

/// Fault code reported when the caller could not be authenticated.
pub const FAULT_AUTHENTICATION_FAILURE: i32 = 0x0001_0001;
/// Fault code reported when the broker exhausted its retries for a request.
pub const FAULT_RETRY_LIMIT_EXCEEDED: i32 = 0x0001_0002;
/// Fault code reported when the broker purged the client's requests.
pub const FAULT_CLIENT_PURGED: i32 = 0x0001_0003;
/// Fault code reported when the client timed out on the broker side.
pub const FAULT_CLIENT_TIMED_OUT: i32 = 0x0001_0004;

/// Raw fault returned by a broker or session-launcher call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionFault {
    /// Numeric fault code.
    pub code: i32,
    /// Human-readable reason supplied by the broker.
    pub reason: String,
}

impl SessionFault {
    /// Create a fault with the given code and reason.
    #[must_use]
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SessionFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fault {:#x}: {}", self.code, self.reason)
    }
}

/// Top-level error type exposed by `brokerframe`.
///
/// Variants fall into four groups: translated transport/session faults,
/// protocol-sequence faults ([`ClientPurged`](Self::ClientPurged),
/// [`ClientTimedOut`](Self::ClientTimedOut)), local decode faults, and
/// liveness faults ([`HeartbeatFailure`](Self::HeartbeatFailure),
/// [`ResponseTimeout`](Self::ResponseTimeout)).
#[non_exhaustive]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// A session fault that has no more specific mapping.
    #[error("session fault: {0}")]
    SessionFault(SessionFault),
    /// The broker rejected the caller's credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The broker gave up on a request after its retry limit.
    #[error("retry limit exceeded: {0}")]
    RetryLimitExceeded(String),
    /// The broker purged this client's request set.
    #[error("client was purged by the broker: {0}")]
    ClientPurged(String),
    /// The client's request set timed out on the broker.
    #[error("client timed out on the broker: {0}")]
    ClientTimedOut(String),
    /// No response arrived within the configured response timeout.
    #[error("no response received within {0:?}")]
    ResponseTimeout(Duration),
    /// The heartbeat lost contact with the broker.
    #[error("{}", heartbeat_message(*node_down))]
    HeartbeatFailure {
        /// `true` when the broker node is unreachable, `false` when the
        /// broker process is reachable but no longer serves this session.
        node_down: bool,
    },
    /// A message could not be decoded on the client.
    #[error("failed to decode message: {0}")]
    Decode(String),
    /// The transport failed outside of a broker fault.
    #[error("transport error: {0}")]
    Transport(String),
    /// An operation required an active listener or enumerator.
    #[error("response listener is not active")]
    NotListening,
}

fn heartbeat_message(node_down: bool) -> &'static str {
    if node_down {
        "broker node is unreachable"
    } else {
        "broker is no longer serving the session"
    }
}

impl BrokerError {
    /// Build the liveness failure raised when the heartbeat trips.
    #[must_use]
    pub fn heartbeat_failure(node_down: bool) -> Self { Self::HeartbeatFailure { node_down } }

    /// Wrap a decode error from any source.
    #[must_use]
    pub fn decode(error: impl std::fmt::Display) -> Self { Self::Decode(error.to_string()) }

    /// Wrap a transport error from any source.
    #[must_use]
    pub fn transport(error: impl std::fmt::Display) -> Self { Self::Transport(error.to_string()) }

    /// Returns true for failures caused by loss of the broker.
    #[must_use]
    pub fn is_liveness_failure(&self) -> bool { matches!(self, Self::HeartbeatFailure { .. }) }
}

impl From<SessionFault> for BrokerError {
    fn from(fault: SessionFault) -> Self { Self::SessionFault(fault) }
}

impl From<bincode::error::DecodeError> for BrokerError {
    fn from(error: bincode::error::DecodeError) -> Self { Self::decode(error) }
}

/// Maps raw session faults onto typed errors.
///
/// All components route faults through the same translator so callers see
/// a consistent error surface regardless of which path observed the fault.
pub trait FaultTranslator: Send + Sync + 'static {
    /// Translate a raw fault.
    fn translate(&self, fault: SessionFault) -> BrokerError;

    /// Translate `error` if it wraps a raw fault, otherwise return it as is.
    fn translate_error(&self, error: BrokerError) -> BrokerError {
        match error {
            BrokerError::SessionFault(fault) => self.translate(fault),
            other => other,
        }
    }
}

/// Translator covering the well-known broker fault codes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFaultTranslator;

impl FaultTranslator for DefaultFaultTranslator {
    fn translate(&self, fault: SessionFault) -> BrokerError {
        match fault.code {
            FAULT_AUTHENTICATION_FAILURE => BrokerError::Authentication(fault.reason),
            FAULT_RETRY_LIMIT_EXCEEDED => BrokerError::RetryLimitExceeded(fault.reason),
            FAULT_CLIENT_PURGED => BrokerError::ClientPurged(fault.reason),
            FAULT_CLIENT_TIMED_OUT => BrokerError::ClientTimedOut(fault.reason),
            _ => BrokerError::SessionFault(fault),
        }
    }
}

/// Canonical result alias used by `brokerframe` public APIs.
pub type Result<T> = std::result::Result<T, BrokerError>;
