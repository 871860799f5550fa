//! Shared utilities for integration tests.
//!
//! Provides session and configuration fixtures plus sources that never
//! answer, so tests can focus on one component at a time.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use brokerframe::{
    HeartbeatConfig,
    ResponseConfig,
    SessionContext,
    WindowSize,
    transport::{GetResponsesRequest, ResponseSource},
};
use brokerframe_testing::{FakeBroker, responses};
use rstest::fixture;

pub const SESSION_ID: &str = "session-1";

/// Fresh session with its own registry.
#[fixture]
pub fn session() -> SessionContext { SessionContext::new(SESSION_ID) }

/// Configuration with a window small enough to cross boundaries quickly.
#[expect(
    clippy::expect_used,
    reason = "a rejected fixture configuration must abort the test immediately"
)]
pub fn windowed(window: usize) -> ResponseConfig {
    ResponseConfig::builder()
        .window_size(WindowSize::bounded(window).expect("non-zero window"))
        .build()
        .expect("valid configuration")
}

/// Heartbeat probing every second, tripping after `retry_count` misses.
#[expect(
    clippy::expect_used,
    reason = "a rejected fixture configuration must abort the test immediately"
)]
pub fn heartbeat_config(retry_count: u32) -> HeartbeatConfig {
    HeartbeatConfig::builder(SESSION_ID)
        .interval(Duration::from_secs(1))
        .retry_count(retry_count)
        .build()
        .expect("valid heartbeat configuration")
}

/// Broker holding `count` responses for `session`.
pub fn broker(session: &SessionContext, count: u32) -> Arc<FakeBroker> {
    Arc::new(FakeBroker::new(
        Arc::clone(session.registry()),
        responses(count),
    ))
}

/// Source that accepts every pull and never delivers anything.
pub struct SilentBroker;

#[async_trait]
impl ResponseSource for SilentBroker {
    async fn get_responses(&self, _request: GetResponsesRequest) -> brokerframe::Result<()> {
        Ok(())
    }
}
