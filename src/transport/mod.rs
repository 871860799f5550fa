//! Outbound "get responses" calls and transport adapters.
//!
//! The response consumers never talk to a wire protocol directly. They ask
//! a [`ResponseSource`] for the next window of responses, and the transport
//! later delivers those responses through the
//! [`CallbackRegistry`](crate::registry::CallbackRegistry).
//!
//! Two adapters are provided for backends without server push:
//! [`polling::PollingTransport`] for REST-style pull APIs and
//! [`queue::QueueReceiver`] for queue-based backends.

pub mod frame;
pub mod polling;
pub mod queue;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::{
    config::ResponseConfig,
    error::{BrokerError, FaultTranslator, Result},
    registry::RegistrationId,
};

/// Where the broker should resume reading a client's responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Position {
    /// Restart from the first response.
    Begin,
    /// Continue after the last response handed out.
    Current,
}

/// Request for the next window of responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetResponsesRequest {
    /// Action filter; empty means every action.
    pub action: String,
    /// Registration the responses must be routed to.
    pub registration: RegistrationId,
    /// Read position.
    pub position: Position,
    /// Number of responses requested, `None` for all of them.
    pub count: Option<usize>,
    /// Client whose responses are requested.
    pub client_id: String,
}

impl GetResponsesRequest {
    pub(crate) fn new(
        config: &ResponseConfig,
        registration: RegistrationId,
        position: Position,
        count: Option<usize>,
    ) -> Self {
        Self {
            action: config.action().to_owned(),
            registration,
            position,
            count,
            client_id: config.client_id().to_owned(),
        }
    }
}

/// How a source wants its outbound calls issued.
///
/// Resolved once when a consumer is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceCapability {
    /// Only [`ResponseSource::get_responses_blocking`] is implemented; calls
    /// run on the blocking thread pool.
    SyncOnly,
    /// [`ResponseSource::get_responses`] is implemented.
    AsyncCapable,
}

/// Size of the first pull issued by an enumerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullStrategy {
    /// Ask for every response at once.
    Unbounded,
    /// Ask for two windows so the next one is in flight while the first is
    /// consumed.
    Prefetch,
    /// Ask for exactly one window at a time. Used by backends that would
    /// block other clients while serving a large pull.
    SingleWindow,
}

/// Outbound surface of a broker transport.
///
/// Implement [`get_responses`](Self::get_responses) for asynchronous
/// transports, or [`get_responses_blocking`](Self::get_responses_blocking)
/// together with [`SourceCapability::SyncOnly`] for blocking ones.
#[async_trait]
pub trait ResponseSource: Send + Sync + 'static {
    /// Which of the two call styles this source implements.
    fn capability(&self) -> SourceCapability { SourceCapability::AsyncCapable }

    /// First-pull sizing preferred by this backend.
    fn pull_strategy(&self) -> PullStrategy { PullStrategy::Prefetch }

    /// Ask the broker to send responses for `request`.
    ///
    /// # Errors
    ///
    /// Returns the broker fault or transport error that prevented the call.
    async fn get_responses(&self, request: GetResponsesRequest) -> Result<()> {
        Err(BrokerError::transport(format!(
            "asynchronous get_responses is not implemented (registration {})",
            request.registration
        )))
    }

    /// Blocking variant of [`get_responses`](Self::get_responses).
    ///
    /// # Errors
    ///
    /// Returns the broker fault or transport error that prevented the call.
    fn get_responses_blocking(&self, request: GetResponsesRequest) -> Result<()> {
        Err(BrokerError::transport(format!(
            "blocking get_responses is not implemented (registration {})",
            request.registration
        )))
    }
}

/// Issues outbound pulls on behalf of a consumer.
///
/// Detached pulls never run on the caller's task: delivery callbacks must
/// not wait on the transport they are being called from.
#[derive(Clone)]
pub(crate) struct Puller {
    source: Arc<dyn ResponseSource>,
    capability: SourceCapability,
    translator: Arc<dyn FaultTranslator>,
    runtime: Handle,
}

impl Puller {
    /// Capture the source capability and the current runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(source: Arc<dyn ResponseSource>, translator: Arc<dyn FaultTranslator>) -> Self {
        Self {
            capability: source.capability(),
            source,
            translator,
            runtime: Handle::current(),
        }
    }

    pub(crate) fn pull_strategy(&self) -> PullStrategy { self.source.pull_strategy() }

    pub(crate) fn translator(&self) -> &dyn FaultTranslator { self.translator.as_ref() }

    pub(crate) fn runtime(&self) -> &Handle { &self.runtime }

    /// Issue `request` and wait for the call to complete.
    pub(crate) async fn pull(&self, request: GetResponsesRequest) -> Result<()> {
        let result = match self.capability {
            SourceCapability::AsyncCapable => self.source.get_responses(request).await,
            SourceCapability::SyncOnly => {
                let source = Arc::clone(&self.source);
                self.runtime
                    .spawn_blocking(move || source.get_responses_blocking(request))
                    .await
                    .map_err(BrokerError::transport)
                    .and_then(|result| result)
            }
        };
        result.map_err(|error| self.translator.translate_error(error))
    }

    /// Issue `request` on a background task, reporting failure to `on_error`.
    pub(crate) fn pull_detached<F>(&self, request: GetResponsesRequest, on_error: F)
    where
        F: FnOnce(BrokerError) + Send + 'static,
    {
        let puller = self.clone();
        self.runtime.spawn(async move {
            let registration = request.registration;
            if let Err(error) = puller.pull(request).await {
                tracing::warn!(%registration, %error, "get responses call failed");
                on_error(error);
            }
        });
    }
}
