#![doc(html_root_url = "https://docs.rs/brokerframe/latest")]
//! Public API for the `brokerframe` library.
//!
//! This crate provides the client side of a request/response broker's
//! response pipeline: windowed response buffering, push-style delivery to
//! a handler, pull-style enumeration, and heartbeat-based detection of a
//! lost broker.

pub mod callback;
pub mod config;
pub mod enumerator;
pub mod error;
/// Result type alias re-exported for convenience.
pub use error::Result;
pub mod heartbeat;
pub mod message;
pub mod metrics;
pub mod panic;
pub mod registry;
pub mod response;
pub mod session;
#[cfg(test)]
mod test_support;
pub mod transport;
mod window;

pub use callback::{PushResponseCallback, ResponseHandler};
pub use config::{ConfigError, HeartbeatConfig, ResponseConfig, WindowSize};
pub use enumerator::ResponseEnumerator;
pub use error::{BrokerError, DefaultFaultTranslator, FaultTranslator, SessionFault};
pub use heartbeat::{BrokerDownEvent, BrokerDownListener, HeartbeatMonitor};
pub use message::{BrokerMessage, EndOfMessage, EndReason, Message, ResponseMessage};
pub use registry::{CallbackRegistry, RegistrationId, ResponseSink};
pub use response::ResponseItem;
pub use session::SessionContext;
pub use transport::ResponseSource;
