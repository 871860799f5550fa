//! Metric helpers for `brokerframe`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. Without the
//! `metrics` feature the helpers compile to no-ops.

#[cfg(feature = "metrics")]
use metrics::counter;

/// Name of the counter tracking responses received from transports.
pub const RESPONSES_RECEIVED: &str = "brokerframe_responses_received_total";
/// Name of the counter tracking responses handed to consumers.
pub const RESPONSES_DELIVERED: &str = "brokerframe_responses_delivered_total";
/// Name of the counter tracking failed heartbeat probes.
pub const HEARTBEAT_MISSES: &str = "brokerframe_heartbeat_misses_total";
/// Name of the counter tracking broker-down notifications.
pub const BROKER_DOWN: &str = "brokerframe_broker_down_total";
/// Name of the counter tracking panics caught in user callbacks.
pub const CALLBACK_PANICS: &str = "brokerframe_callback_panics_total";

/// Consumption model a response flows through.
#[derive(Clone, Copy, Debug)]
pub enum Mode {
    /// Responses pushed into a registered handler.
    Push,
    /// Responses pulled through an enumerator.
    Pull,
}

impl Mode {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "label only used by metrics"))]
    fn as_str(self) -> &'static str {
        match self {
            Mode::Push => "push",
            Mode::Pull => "pull",
        }
    }
}

/// Record a response received from a transport.
pub fn inc_received(mode: Mode) {
    #[cfg(feature = "metrics")]
    counter!(RESPONSES_RECEIVED, "mode" => mode.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = mode;
}

/// Record a response handed to a consumer.
pub fn inc_delivered(mode: Mode) {
    #[cfg(feature = "metrics")]
    counter!(RESPONSES_DELIVERED, "mode" => mode.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = mode;
}

/// Record a failed heartbeat probe.
pub fn inc_heartbeat_misses() {
    #[cfg(feature = "metrics")]
    counter!(HEARTBEAT_MISSES).increment(1);
}

/// Record a broker-down notification.
pub fn inc_broker_down() {
    #[cfg(feature = "metrics")]
    counter!(BROKER_DOWN).increment(1);
}

/// Record a panic caught in a user callback.
pub fn inc_callback_panics() {
    #[cfg(feature = "metrics")]
    counter!(CALLBACK_PANICS).increment(1);
}
