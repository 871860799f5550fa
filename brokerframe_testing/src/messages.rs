//! Builders for scripted broker messages.

use brokerframe::{
    BrokerMessage,
    EndOfMessage,
    EndReason,
    Message,
    ResponseItem,
    ResponseMessage,
};

/// Payload carried by every scripted response.
#[derive(bincode::Encode, bincode::BorrowDecode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Sequence number of the response, starting at 1.
    pub n: u32,
}

/// Response number `n` for the `Echo` action, correlated with request `n`.
///
/// # Panics
///
/// Panics if the payload cannot be encoded.
#[must_use]
pub fn response(n: u32) -> BrokerMessage {
    let payload = Reply { n }.to_bytes().expect("encode reply");
    ResponseMessage::new("Echo", payload)
        .with_correlation_id(u64::from(n))
        .into()
}

/// Responses `1..=count` as plain messages.
#[must_use]
pub fn responses(count: u32) -> Vec<ResponseMessage> {
    (1..=count)
        .filter_map(|n| match response(n) {
            BrokerMessage::Response(message) => Some(message),
            _ => None,
        })
        .collect()
}

/// Successful end-of-stream marker announcing `count` responses.
#[must_use]
pub fn eom(count: u64) -> BrokerMessage { EndOfMessage::success(count).into() }

/// End-of-stream marker with an explicit reason.
#[must_use]
pub fn eom_with(count: u64, reason: EndReason) -> BrokerMessage {
    EndOfMessage { count, reason }.into()
}

/// Sequence number of a response built by [`response`].
///
/// # Panics
///
/// Panics if the item carries an error or a foreign payload.
#[must_use]
pub fn number(item: &ResponseItem) -> u32 {
    item.decode::<Reply>().expect("scripted reply payload").n
}
