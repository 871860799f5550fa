//! Messages delivered from a transport into the response pipeline.
//!
//! Transports classify every inbound message into one of the
//! [`BrokerMessage`] variants before handing it to a
//! [`ResponseSink`](crate::registry::ResponseSink). Payloads stay encoded
//! until the consumer asks for them; [`Message`] provides the decoding side.

use bincode::error::{DecodeError, EncodeError};
use bincode::{BorrowDecode, Encode, borrow_decode_from_slice, config, encode_to_vec};
use bytes::Bytes;

use crate::error::BrokerError;

/// Wrapper trait for application payload types.
///
/// Any type deriving [`Encode`] and [`BorrowDecode`] automatically implements
/// this trait via a blanket implementation. The default methods serialize
/// and deserialize using bincode's standard configuration.
pub trait Message: Encode + for<'de> BorrowDecode<'de, ()> {
    /// Serialize the message into a byte vector.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if serialization fails.
    fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> { encode_to_vec(self, config::standard()) }

    /// Deserialize a message from a byte slice, returning the message and
    /// the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if deserialization fails.
    fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), DecodeError>
    where
        Self: Sized,
    {
        borrow_decode_from_slice(bytes, config::standard())
    }
}

impl<T> Message for T where for<'de> T: Encode + BorrowDecode<'de, ()> {}

/// Why the broker ended a client's response stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndReason {
    /// Every request produced its response.
    Success,
    /// The broker purged the client's outstanding requests.
    ClientPurged,
    /// The client's request set timed out on the broker.
    ClientTimedOut,
}

impl EndReason {
    /// Error raised to consumers for an abnormal end, `None` on success.
    #[must_use]
    pub fn error(self) -> Option<BrokerError> {
        match self {
            Self::Success => None,
            Self::ClientPurged => Some(BrokerError::ClientPurged(
                "the broker purged the client's requests".into(),
            )),
            Self::ClientTimedOut => Some(BrokerError::ClientTimedOut(
                "the client's requests timed out on the broker".into(),
            )),
        }
    }
}

/// An ordinary response as delivered by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseMessage {
    /// Action of the request that produced this response.
    pub action: String,
    /// Reply action stamped by the service.
    pub reply_action: String,
    /// Correlation identifier linking back to the original request.
    pub correlation_id: Option<u64>,
    /// Encoded response body.
    pub payload: Bytes,
}

impl ResponseMessage {
    /// Create a response for `action` with the given payload.
    #[must_use]
    pub fn new(action: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let action = action.into();
        Self {
            reply_action: format!("{action}Response"),
            action,
            correlation_id: None,
            payload: payload.into(),
        }
    }

    /// Attach the correlation identifier of the originating request.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: u64) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Override the reply action.
    #[must_use]
    pub fn with_reply_action(mut self, reply_action: impl Into<String>) -> Self {
        self.reply_action = reply_action.into();
        self
    }
}

/// Terminal metadata for a client's response stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndOfMessage {
    /// Total number of responses the broker produced for the client.
    pub count: u64,
    /// Why the stream ended.
    pub reason: EndReason,
}

impl EndOfMessage {
    /// End-of-stream marker for a successfully completed request set.
    #[must_use]
    pub fn success(count: u64) -> Self {
        Self {
            count,
            reason: EndReason::Success,
        }
    }
}

/// Classified inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerMessage {
    /// An ordinary response.
    Response(ResponseMessage),
    /// The end-of-stream marker.
    EndOfMessage(EndOfMessage),
    /// A client-side failure surfaced as if it were a response.
    ClientFault(BrokerError),
}

impl From<ResponseMessage> for BrokerMessage {
    fn from(message: ResponseMessage) -> Self { Self::Response(message) }
}

impl From<EndOfMessage> for BrokerMessage {
    fn from(eom: EndOfMessage) -> Self { Self::EndOfMessage(eom) }
}
