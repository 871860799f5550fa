//! Binary framing for adapters that receive raw bytes.
//!
//! Polling and queue backends hand over opaque byte buffers rather than
//! classified messages. [`decode_frame`] turns such a buffer into a
//! [`BrokerMessage`]; a buffer that cannot be decoded becomes a
//! [`BrokerMessage::ClientFault`] so one bad message never aborts the
//! stream.

use bincode::{Decode, Encode};

use crate::{
    error::{BrokerError, SessionFault},
    message::{BrokerMessage, EndOfMessage, EndReason, Message, ResponseMessage},
};

const REASON_SUCCESS: u8 = 0;
const REASON_CLIENT_PURGED: u8 = 1;
const REASON_CLIENT_TIMED_OUT: u8 = 2;

/// Encoded representation of a [`BrokerMessage`].
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// An ordinary response.
    Response {
        /// Action of the originating request.
        action: String,
        /// Reply action stamped by the service.
        reply_action: String,
        /// Correlation identifier of the originating request.
        correlation_id: Option<u64>,
        /// Encoded response body.
        payload: Vec<u8>,
    },
    /// End-of-stream marker.
    EndOfMessage {
        /// Total number of responses.
        count: u64,
        /// Encoded [`EndReason`].
        reason: u8,
    },
    /// A broker fault delivered in place of a response.
    Fault {
        /// Fault code.
        code: i32,
        /// Fault reason.
        reason: String,
    },
}

fn reason_code(reason: EndReason) -> u8 {
    match reason {
        EndReason::Success => REASON_SUCCESS,
        EndReason::ClientPurged => REASON_CLIENT_PURGED,
        EndReason::ClientTimedOut => REASON_CLIENT_TIMED_OUT,
    }
}

fn reason_from_code(code: u8) -> Option<EndReason> {
    match code {
        REASON_SUCCESS => Some(EndReason::Success),
        REASON_CLIENT_PURGED => Some(EndReason::ClientPurged),
        REASON_CLIENT_TIMED_OUT => Some(EndReason::ClientTimedOut),
        _ => None,
    }
}

impl WireFrame {
    /// Classify the frame.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Decode`] for an unknown end reason.
    pub fn into_message(self) -> Result<BrokerMessage, BrokerError> {
        match self {
            Self::Response {
                action,
                reply_action,
                correlation_id,
                payload,
            } => Ok(BrokerMessage::Response(ResponseMessage {
                action,
                reply_action,
                correlation_id,
                payload: payload.into(),
            })),
            Self::EndOfMessage { count, reason } => {
                let reason = reason_from_code(reason).ok_or_else(|| {
                    BrokerError::decode(format!("unknown end-of-stream reason {reason}"))
                })?;
                Ok(BrokerMessage::EndOfMessage(EndOfMessage { count, reason }))
            }
            Self::Fault { code, reason } => Ok(BrokerMessage::ClientFault(
                BrokerError::SessionFault(SessionFault::new(code, reason)),
            )),
        }
    }
}

/// Decode a raw buffer into a classified message.
///
/// Decoding never fails outright: undecodable input is reported in-band.
#[must_use]
pub fn decode_frame(bytes: &[u8]) -> BrokerMessage {
    WireFrame::from_bytes(bytes)
        .map_err(BrokerError::from)
        .and_then(|(frame, _)| frame.into_message())
        .unwrap_or_else(|error| {
            tracing::warn!(%error, frame.bytes = bytes.len(), "undecodable frame");
            BrokerMessage::ClientFault(error)
        })
}

/// Encode a message as a frame.
///
/// # Errors
///
/// Returns [`BrokerError::Decode`] when `message` is a client-side fault
/// other than a session fault; such faults never cross the wire.
pub fn encode_frame(message: &BrokerMessage) -> Result<Vec<u8>, BrokerError> {
    let frame = match message {
        BrokerMessage::Response(response) => WireFrame::Response {
            action: response.action.clone(),
            reply_action: response.reply_action.clone(),
            correlation_id: response.correlation_id,
            payload: response.payload.to_vec(),
        },
        BrokerMessage::EndOfMessage(eom) => WireFrame::EndOfMessage {
            count: eom.count,
            reason: reason_code(eom.reason),
        },
        BrokerMessage::ClientFault(BrokerError::SessionFault(fault)) => WireFrame::Fault {
            code: fault.code,
            reason: fault.reason.clone(),
        },
        BrokerMessage::ClientFault(other) => {
            return Err(BrokerError::decode(format!(
                "client-side fault cannot be framed: {other}"
            )));
        }
    };
    frame.to_bytes().map_err(BrokerError::decode)
}
