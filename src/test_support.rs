//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    error::{BrokerError, Result},
    message::{BrokerMessage, EndOfMessage, EndReason, ResponseMessage},
    response::ResponseItem,
    transport::{GetResponsesRequest, PullStrategy, ResponseSource},
};

/// Source that records every request and optionally fails them.
#[derive(Default)]
pub(crate) struct RecordingSource {
    requests: Mutex<Vec<GetResponsesRequest>>,
    failure: Mutex<Option<BrokerError>>,
    strategy: Option<PullStrategy>,
}

impl RecordingSource {
    pub(crate) fn with_strategy(strategy: PullStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    pub(crate) fn fail_with(&self, error: BrokerError) {
        *self.failure.lock().expect("lock") = Some(error);
    }

    pub(crate) fn recover(&self) { *self.failure.lock().expect("lock") = None; }

    pub(crate) fn requests(&self) -> Vec<GetResponsesRequest> {
        self.requests.lock().expect("lock").clone()
    }

    pub(crate) fn counts(&self) -> Vec<Option<usize>> {
        self.requests().into_iter().map(|request| request.count).collect()
    }
}

#[async_trait]
impl ResponseSource for RecordingSource {
    fn pull_strategy(&self) -> PullStrategy { self.strategy.unwrap_or(PullStrategy::Prefetch) }

    async fn get_responses(&self, request: GetResponsesRequest) -> Result<()> {
        self.requests.lock().expect("lock").push(request);
        match self.failure.lock().expect("lock").clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Response `n` carrying `n` as its payload and correlation id.
pub(crate) fn response(n: u32) -> BrokerMessage {
    ResponseMessage::new("Echo", n.to_le_bytes().to_vec())
        .with_correlation_id(u64::from(n))
        .into()
}

pub(crate) fn eom(count: u64) -> BrokerMessage { EndOfMessage::success(count).into() }

pub(crate) fn eom_with(count: u64, reason: EndReason) -> BrokerMessage {
    EndOfMessage { count, reason }.into()
}

/// Payload number of an item built by [`response`].
pub(crate) fn number(item: &ResponseItem) -> u32 {
    let bytes: [u8; 4] = item.payload().try_into().expect("four byte payload");
    u32::from_le_bytes(bytes)
}

/// Handler storing every item it receives.
pub(crate) fn collector() -> (
    Arc<Mutex<Vec<ResponseItem>>>,
    impl Fn(ResponseItem) + Send + Sync + 'static,
) {
    let items = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&items);
    (items, move |item| sink.lock().expect("lock").push(item))
}
