//! Utilities for exercising `brokerframe` response consumers in tests.
//!
//! The helpers stand in for the collaborators a real deployment provides:
//! [`FakeBroker`] answers "get responses" calls by routing scripted
//! responses through the registry, [`ScriptedProbeFactory`] replays probe
//! outcomes for the heartbeat, and [`CollectingHandler`] records what a
//! push callback delivers.
//!
//! ```rust
//! use brokerframe_testing::{number, response};
//! use brokerframe::{BrokerMessage, ResponseItem};
//!
//! let BrokerMessage::Response(message) = response(7) else {
//!     unreachable!()
//! };
//! assert_eq!(number(&ResponseItem::from_message(message)), 7);
//! ```

mod broker;
mod handler;
mod logging;
mod messages;
mod probe;

pub use broker::FakeBroker;
pub use handler::CollectingHandler;
pub use logging::{LoggerHandle, logger};
pub use messages::{Reply, eom, eom_with, number, response, responses};
pub use probe::{ProbeOutcome, ScriptedProbeFactory};

/// Result type used by fallible tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;
