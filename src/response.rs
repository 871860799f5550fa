//! Response items handed to consumers.

use bytes::Bytes;

use crate::{
    error::{BrokerError, Result},
    message::{Message, ResponseMessage},
};

/// One response as seen by a consumer.
///
/// Items own their payload buffer; the buffer is released when the item is
/// dropped. The payload can be decoded any number of times with
/// [`decode`](Self::decode).
///
/// An item may instead carry a client-side error. This happens when a
/// transport or decoding failure has to be surfaced in-band so the rest of
/// the stream keeps flowing.
///
/// # Examples
///
/// ```
/// use brokerframe::{message::ResponseMessage, response::ResponseItem};
///
/// let message = ResponseMessage::new("Echo", 7u32.to_le_bytes().to_vec());
/// let item = ResponseItem::from_message(message);
/// assert_eq!(item.action(), "Echo");
/// assert!(!item.is_last());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseItem {
    action: String,
    reply_action: String,
    correlation_id: Option<u64>,
    payload: Bytes,
    error: Option<BrokerError>,
    is_last: bool,
}

impl ResponseItem {
    /// Wrap a response message received from a transport.
    #[must_use]
    pub fn from_message(message: ResponseMessage) -> Self {
        let ResponseMessage {
            action,
            reply_action,
            correlation_id,
            payload,
        } = message;
        Self {
            action,
            reply_action,
            correlation_id,
            payload,
            error: None,
            is_last: false,
        }
    }

    /// Build an item carrying a client-side error.
    #[must_use]
    pub fn from_error(error: BrokerError) -> Self {
        Self {
            action: String::new(),
            reply_action: String::new(),
            correlation_id: None,
            payload: Bytes::new(),
            error: Some(error),
            is_last: false,
        }
    }

    /// Action of the originating request.
    #[must_use]
    pub fn action(&self) -> &str { &self.action }

    /// Reply action stamped by the service.
    #[must_use]
    pub fn reply_action(&self) -> &str { &self.reply_action }

    /// Correlation identifier of the originating request.
    #[must_use]
    pub fn correlation_id(&self) -> Option<u64> { self.correlation_id }

    /// Raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Error carried in place of a response, if any.
    #[must_use]
    pub fn error(&self) -> Option<&BrokerError> { self.error.as_ref() }

    /// Returns `true` on the single final item of a completed request set.
    #[must_use]
    pub fn is_last(&self) -> bool { self.is_last }

    /// Decode the payload.
    ///
    /// # Errors
    ///
    /// Returns the carried error if this item represents a failure, or
    /// [`BrokerError::Decode`] if the payload does not decode as `M`.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let (message, _) = M::from_bytes(&self.payload)?;
        Ok(message)
    }

    /// Convert into a result, surfacing a carried error.
    ///
    /// # Errors
    ///
    /// Returns the carried error if this item represents a failure.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<BrokerError> { self.error.take() }

    pub(crate) fn mark_last(&mut self) { self.is_last = true; }
}
