//! In-memory broker answering "get responses" calls.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use brokerframe::{
    BrokerError,
    BrokerMessage,
    CallbackRegistry,
    EndOfMessage,
    EndReason,
    RegistrationId,
    ResponseMessage,
    Result,
    transport::{GetResponsesRequest, Position, PullStrategy, ResponseSource},
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Script {
    responses: Vec<ResponseMessage>,
    cursor: usize,
    reason: Option<EndReason>,
    failure: Option<BrokerError>,
    requests: Vec<GetResponsesRequest>,
}

/// Broker holding a fixed list of responses for one client.
///
/// Every pull is answered on a single delivery task, in request order,
/// through the shared [`CallbackRegistry`]. Once the cursor passes the last
/// response the broker sends an end-of-stream marker carrying the total.
pub struct FakeBroker {
    script: Mutex<Script>,
    strategy: PullStrategy,
    deliveries: mpsc::UnboundedSender<(RegistrationId, BrokerMessage)>,
}

impl FakeBroker {
    /// Create a broker serving `responses` to consumers registered in
    /// `registry`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(registry: Arc<CallbackRegistry>, responses: Vec<ResponseMessage>) -> Self {
        let (deliveries, mut rx) = mpsc::unbounded_channel::<(RegistrationId, BrokerMessage)>();
        tokio::spawn(async move {
            while let Some((id, message)) = rx.recv().await {
                registry.route(id, message);
            }
        });
        Self {
            script: Mutex::new(Script {
                responses,
                ..Script::default()
            }),
            strategy: PullStrategy::Prefetch,
            deliveries,
        }
    }

    /// Advertise `strategy` for first pulls.
    #[must_use]
    pub fn with_strategy(mut self, strategy: PullStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// End the stream with `reason` once the responses run out.
    #[must_use]
    pub fn ending_with(self, reason: EndReason) -> Self {
        self.script().reason = Some(reason);
        self
    }

    /// Fail every subsequent pull with `error`.
    pub fn fail_with(&self, error: BrokerError) { self.script().failure = Some(error); }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<GetResponsesRequest> { self.script().requests.clone() }

    /// Push `message` to `id` outside of any pull.
    pub fn send(&self, id: RegistrationId, message: BrokerMessage) {
        let _ = self.deliveries.send((id, message));
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResponseSource for FakeBroker {
    fn pull_strategy(&self) -> PullStrategy { self.strategy }

    async fn get_responses(&self, request: GetResponsesRequest) -> Result<()> {
        let mut script = self.script();
        script.requests.push(request.clone());
        if let Some(error) = script.failure.clone() {
            return Err(error);
        }
        if request.position == Position::Begin {
            script.cursor = 0;
        }
        let total = script.responses.len();
        let start = script.cursor.min(total);
        let end = request
            .count
            .map_or(total, |count| start.saturating_add(count).min(total));
        script.cursor = end;

        let id = request.registration;
        for message in &script.responses[start..end] {
            let _ = self.deliveries.send((id, message.clone().into()));
        }
        if end == total {
            let marker = EndOfMessage {
                count: total as u64,
                reason: script.reason.unwrap_or(EndReason::Success),
            };
            let _ = self.deliveries.send((id, marker.into()));
        }
        Ok(())
    }
}
