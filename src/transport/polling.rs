//! Adapter for backends that can only be polled.
//!
//! REST-style brokers cannot push responses. [`PollingTransport`]
//! implements [`ResponseSource`] on top of a [`PollingSource`]: every
//! `get_responses` call starts a worker task that repeatedly pulls batches
//! and routes them into the registry, exactly as a push transport would,
//! until the requested count or the end-of-stream marker has been seen.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use leaky_bucket::RateLimiter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GetResponsesRequest, Position, PullStrategy, ResponseSource};
use crate::{
    error::Result,
    message::BrokerMessage,
    registry::{CallbackRegistry, RegistrationId},
};

/// Default number of responses pulled per poll.
pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Default maximum polls per second across all workers of a transport.
pub const DEFAULT_POLL_RATE: usize = 20;
/// Default pause after a poll that returned nothing.
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(200);

/// One batch returned by a poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PulledBatch {
    /// Messages in arrival order. The end-of-stream marker, when present, is
    /// included here.
    pub messages: Vec<BrokerMessage>,
    /// No further responses will be produced.
    pub end_of_stream: bool,
}

/// Synchronous-style pull API of a polling backend.
#[async_trait]
pub trait PollingSource: Send + Sync + 'static {
    /// Pull at most `max` messages for `request`.
    ///
    /// # Errors
    ///
    /// Returns the broker fault or transport error that prevented the poll.
    async fn pull_responses(&self, request: &GetResponsesRequest, max: usize)
    -> Result<PulledBatch>;
}

/// [`ResponseSource`] that feeds a registry by polling.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use brokerframe::{
///     registry::CallbackRegistry,
///     transport::polling::{PollingSource, PollingTransport},
/// };
///
/// # fn demo(source: Arc<dyn PollingSource>, registry: Arc<CallbackRegistry>) {
/// let transport = PollingTransport::new(source, registry).with_batch_size(32);
/// # drop(transport);
/// # }
/// ```
pub struct PollingTransport {
    source: Arc<dyn PollingSource>,
    registry: Arc<CallbackRegistry>,
    limiter: Arc<RateLimiter>,
    batch_size: usize,
    idle_delay: Duration,
    shutdown: CancellationToken,
}

fn limiter(rate: usize) -> RateLimiter {
    let rate = rate.max(1);
    RateLimiter::builder()
        .initial(rate)
        .refill(rate)
        .interval(Duration::from_secs(1))
        .max(rate)
        .build()
}

impl PollingTransport {
    /// Create a transport polling `source` and routing into `registry`.
    #[must_use]
    pub fn new(source: Arc<dyn PollingSource>, registry: Arc<CallbackRegistry>) -> Self {
        Self {
            source,
            registry,
            limiter: Arc::new(limiter(DEFAULT_POLL_RATE)),
            batch_size: DEFAULT_BATCH_SIZE,
            idle_delay: DEFAULT_IDLE_DELAY,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the maximum number of responses pulled per poll.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Limit polls per second shared by every worker of this transport.
    #[must_use]
    pub fn with_poll_rate(mut self, rate: usize) -> Self {
        self.limiter = Arc::new(limiter(rate));
        self
    }

    /// Set the pause after a poll that returned no messages.
    #[must_use]
    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Stop every running worker.
    pub fn shutdown(&self) { self.shutdown.cancel(); }
}

impl Drop for PollingTransport {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

struct PollWorker {
    source: Arc<dyn PollingSource>,
    registry: Arc<CallbackRegistry>,
    limiter: Arc<RateLimiter>,
    batch_size: usize,
    idle_delay: Duration,
    shutdown: CancellationToken,
}

impl PollWorker {
    async fn run(self, mut request: GetResponsesRequest) {
        let registration = request.registration;
        let mut remaining = request.count;
        loop {
            let max = remaining.map_or(self.batch_size, |left| left.min(self.batch_size));
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                () = self.limiter.acquire_one() => {}
            }
            let batch = match self.source.pull_responses(&request, max).await {
                Ok(batch) => batch,
                Err(error) => {
                    warn!(%registration, %error, "poll failed");
                    self.registry
                        .route(registration, BrokerMessage::ClientFault(error));
                    return;
                }
            };
            request.position = Position::Current;

            let pulled = batch
                .messages
                .iter()
                .filter(|message| matches!(message, BrokerMessage::Response(_)))
                .count();
            if !self.deliver(registration, batch.messages) {
                return;
            }
            if batch.end_of_stream {
                debug!(%registration, "poll reached end of stream");
                return;
            }
            if let Some(left) = remaining.as_mut() {
                *left = left.saturating_sub(pulled);
                if *left == 0 {
                    return;
                }
            }
            if pulled == 0 {
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => return,
                    () = tokio::time::sleep(self.idle_delay) => {}
                }
            }
        }
    }

    /// Route messages in order; stops once the sink is gone.
    fn deliver(&self, registration: RegistrationId, messages: Vec<BrokerMessage>) -> bool {
        for message in messages {
            if !self.registry.route(registration, message) {
                debug!(%registration, "sink gone; stopping poll worker");
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl ResponseSource for PollingTransport {
    fn pull_strategy(&self) -> PullStrategy { PullStrategy::SingleWindow }

    async fn get_responses(&self, request: GetResponsesRequest) -> Result<()> {
        let worker = PollWorker {
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            limiter: Arc::clone(&self.limiter),
            batch_size: self.batch_size,
            idle_delay: self.idle_delay,
            shutdown: self.shutdown.child_token(),
        };
        tokio::spawn(worker.run(request));
        Ok(())
    }
}
