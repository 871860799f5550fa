//! Receive loop for queue-based backends.
//!
//! Queue backends deliver every response for a client on a dedicated queue.
//! [`QueueReceiver`] drains that queue on its own task, decodes each frame
//! and routes it to a single registration.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::frame::decode_frame;
use crate::{
    error::Result,
    message::BrokerMessage,
    registry::{CallbackRegistry, RegistrationId},
};

/// Receive side of a response queue.
#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    /// Wait for the next raw frame addressed to `client_correlation`.
    ///
    /// Returns `Ok(None)` once the queue has been closed.
    ///
    /// # Errors
    ///
    /// Returns the transport error that interrupted the receive.
    async fn receive_one(&self, client_correlation: &str) -> Result<Option<Vec<u8>>>;
}

/// Background task moving frames from a [`MessageQueue`] into a registry.
#[derive(Debug)]
pub struct QueueReceiver {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl QueueReceiver {
    /// Start receiving frames for `client_correlation` and routing them to
    /// `registration`.
    ///
    /// The loop ends when the queue closes, the registration disappears, a
    /// receive fails, or [`stop`](Self::stop) is called. A failed receive
    /// is routed as a client fault before the loop ends.
    #[must_use]
    pub fn spawn(
        queue: Arc<dyn MessageQueue>,
        client_correlation: impl Into<String>,
        registry: Arc<CallbackRegistry>,
        registration: RegistrationId,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let client_correlation = client_correlation.into();
        let task = tokio::spawn(async move {
            receive_loop(queue, client_correlation, registry, registration, token).await;
        });
        Self { shutdown, task }
    }

    /// Returns `true` once the loop has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.task.is_finished() }

    /// Stop receiving and wait for the loop to end.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(error) = self.task.await {
            warn!(%error, "queue receiver task ended abnormally");
        }
    }
}

async fn receive_loop(
    queue: Arc<dyn MessageQueue>,
    client_correlation: String,
    registry: Arc<CallbackRegistry>,
    registration: RegistrationId,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            received = queue.receive_one(&client_correlation) => received,
        };
        let message = match received {
            Ok(Some(bytes)) => decode_frame(&bytes),
            Ok(None) => {
                debug!(%registration, "response queue closed");
                return;
            }
            Err(error) => {
                warn!(%registration, %error, "queue receive failed");
                registry.route(registration, BrokerMessage::ClientFault(error));
                return;
            }
        };
        if !registry.route(registration, message) {
            debug!(%registration, "sink gone; stopping queue receiver");
            return;
        }
    }
}
