//! Push-model response consumption.
//!
//! [`PushResponseCallback`] turns the responses a transport pushes for one
//! registration into one [`ResponseHandler`] call per response. With
//! last-response reporting enabled, delivery runs one item behind the wire:
//! the newest response is held back until the next one arrives or the
//! end-of-stream marker confirms it was the final one, so the terminal flag
//! can be set on the right item.


use std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::ResponseConfig,
    error::{BrokerError, DefaultFaultTranslator, FaultTranslator, Result},
    message::{BrokerMessage, EndOfMessage, ResponseMessage},
    metrics::{self, Mode},
    panic::guarded,
    registry::{RegistrationId, ResponseSink},
    response::ResponseItem,
    session::SessionContext,
    transport::{GetResponsesRequest, Position, Puller, ResponseSource},
};

/// Receives responses from a [`PushResponseCallback`].
///
/// Any `Fn(ResponseItem)` closure is a handler. Handlers run on transport
/// and timer tasks and should return promptly. Panics are caught and
/// logged.
pub trait ResponseHandler: Send + Sync + 'static {
    /// Handle one response, or one error delivered in place of a response.
    fn on_response(&self, item: ResponseItem);
}

impl<F> ResponseHandler for F
where
    F: Fn(ResponseItem) + Send + Sync + 'static,
{
    fn on_response(&self, item: ResponseItem) { self(item); }
}

#[derive(Debug, Default)]
struct DeliveryState {
    /// Newest response, held until it is known whether it is the last.
    pending_last: Option<ResponseItem>,
    /// Responses received; drives window re-requests.
    received: u64,
    /// Responses handed to the handler, the held item excluded.
    delivered: u64,
    /// Count preceding the final response, once the end marker arrived.
    expected: Option<u64>,
    /// Total announced by a successful end marker.
    announced: Option<u64>,
    terminal_delivered: bool,
}

impl DeliveryState {
    /// Move the held item out with the terminal flag once everything
    /// before it has been delivered. Fires at most once.
    fn take_terminal(&mut self) -> Option<ResponseItem> {
        if self.terminal_delivered || self.expected != Some(self.delivered) {
            return None;
        }
        let mut item = self.pending_last.take()?;
        item.mark_last();
        self.terminal_delivered = true;
        Some(item)
    }

    /// Nothing more will reach the handler for this stream.
    fn is_finished(&self) -> bool {
        self.terminal_delivered || self.announced.is_some_and(|count| self.delivered >= count)
    }
}

struct TimeoutTimer {
    reset: Arc<Notify>,
    cancel: CancellationToken,
}

struct PushInner {
    me: Weak<PushInner>,
    session: SessionContext,
    config: ResponseConfig,
    handler: Arc<dyn ResponseHandler>,
    puller: Puller,
    state: Mutex<DeliveryState>,
    /// Held while calling the handler so items reach it in order.
    dispatch: Mutex<()>,
    closing: AtomicBool,
    registration: Mutex<Option<RegistrationId>>,
    timer: Mutex<Option<TimeoutTimer>>,
}

impl PushInner {
    fn registration(&self) -> Option<RegistrationId> {
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closing(&self) -> bool { self.closing.load(Ordering::Acquire) }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `items` to the handler in order.
    ///
    /// The dispatch lock is taken while `state` is still held so batches
    /// from concurrent deliveries cannot overtake each other.
    fn dispatch(&self, state: std::sync::MutexGuard<'_, DeliveryState>, items: Vec<ResponseItem>) {
        if items.is_empty() {
            return;
        }
        let _order = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        drop(state);
        for item in items {
            if item.error().is_none() {
                metrics::inc_delivered(Mode::Push);
            }
            let handler = &self.handler;
            guarded("response_handler", || handler.on_response(item));
        }
    }

    fn deliver_error(&self, error: BrokerError) {
        let state = self.lock_state();
        self.dispatch(state, vec![ResponseItem::from_error(error)]);
    }

    fn on_data(&self, response: ResponseMessage) {
        self.session.reset_heartbeat();
        self.reset_timer();
        // Deliveries racing with shutdown may still slip past this check.
        if self.is_closing() {
            debug!("dropping response received after shutdown");
            return;
        }
        metrics::inc_received(Mode::Push);

        let item = ResponseItem::from_message(response);
        let mut state = self.lock_state();
        state.received += 1;
        let boundary = self
            .config
            .window_size()
            .capacity()
            .is_some_and(|window| state.received % window as u64 == 0);

        let mut due = Vec::with_capacity(2);
        if self.config.report_last_response() {
            if let Some(previous) = state.pending_last.replace(item) {
                state.delivered += 1;
                due.push(previous);
            }
            due.extend(state.take_terminal());
        } else {
            state.delivered += 1;
            due.push(item);
        }
        let finished = state.is_finished();
        self.dispatch(state, due);
        if finished {
            self.disarm_timer();
        }

        if boundary {
            self.request_next_window();
        }
    }

    fn on_end(&self, eom: EndOfMessage) {
        debug!(count = eom.count, reason = ?eom.reason, "end of responses");
        let mut state = self.lock_state();
        let error = eom.reason.error();
        let mut due = Vec::with_capacity(2);
        if let Some(error) = error {
            // Completion can no longer be confirmed; release the held item
            // unflagged ahead of the error.
            due.extend(state.pending_last.take());
            state.terminal_delivered = true;
            due.push(ResponseItem::from_error(error));
        } else {
            state.expected = eom.count.checked_sub(1);
            state.announced = Some(eom.count);
            if self.config.report_last_response() {
                due.extend(state.take_terminal());
            }
        }
        let finished = state.is_finished();
        self.dispatch(state, due);
        if finished {
            debug!("response stream finished; timeout disarmed");
            self.disarm_timer();
        }
    }

    fn request_next_window(&self) {
        let Some(registration) = self.registration() else {
            return;
        };
        let request = GetResponsesRequest::new(
            &self.config,
            registration,
            Position::Current,
            self.config.window_size().capacity(),
        );
        let weak = self.me.clone();
        self.puller.pull_detached(request, move |error| {
            if let Some(inner) = weak.upgrade() {
                if !inner.is_closing() {
                    inner.deliver_error(error);
                }
            }
        });
    }

    fn arm_timer(&self, timeout: Duration) {
        let reset = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let weak = self.me.clone();
        let (task_reset, task_cancel) = (Arc::clone(&reset), cancel.clone());
        self.puller
            .runtime()
            .spawn(run_timeout(weak, timeout, task_reset, task_cancel));
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(TimeoutTimer { reset, cancel });
    }

    fn reset_timer(&self) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timer.as_ref() {
            timer.reset.notify_one();
        }
    }

    /// Claim the transition to closed. Returns `false` if another path
    /// already claimed it.
    fn begin_close(&self) -> bool { !self.closing.swap(true, Ordering::AcqRel) }

    fn on_timeout(&self, timeout: Duration) {
        if self.lock_state().is_finished() || !self.begin_close() {
            return;
        }
        warn!(?timeout, "no response received before timeout");
        let mut state = self.lock_state();
        state.terminal_delivered = true;
        let mut due: Vec<_> = state.pending_last.take().into_iter().collect();
        due.push(ResponseItem::from_error(BrokerError::ResponseTimeout(timeout)));
        self.dispatch(state, due);
        self.release();
    }

    fn shutdown(&self) {
        self.begin_close();
        self.release();
    }

    /// Unregister and stop the timer. Safe to call repeatedly.
    fn release(&self) {
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(registration) = registration {
            self.session.registry().unregister(registration);
        }
        self.disarm_timer();
    }

    fn disarm_timer(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.cancel.cancel();
        }
    }
}

async fn run_timeout(
    inner: Weak<PushInner>,
    timeout: Duration,
    reset: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = reset.notified() => {}
            () = tokio::time::sleep(timeout) => {
                if let Some(inner) = inner.upgrade() {
                    inner.on_timeout(timeout);
                }
                return;
            }
        }
    }
}

impl ResponseSink for PushInner {
    fn on_response(&self, message: BrokerMessage) {
        match message {
            BrokerMessage::ClientFault(error) => {
                if self.is_closing() {
                    return;
                }
                let error = self.puller.translator().translate_error(error);
                debug!(%error, "client fault delivered as a response");
                self.deliver_error(error);
            }
            BrokerMessage::Response(response) => self.on_data(response),
            BrokerMessage::EndOfMessage(eom) => {
                if !self.is_closing() {
                    self.on_end(eom);
                }
            }
        }
    }

    fn on_broker_down(&self, node_down: bool) {
        if !self.begin_close() {
            return;
        }
        let state = self.lock_state();
        self.dispatch(
            state,
            vec![ResponseItem::from_error(BrokerError::heartbeat_failure(
                node_down,
            ))],
        );
        self.release();
    }

    fn close(&self) { self.shutdown(); }
}

/// Delivers pushed responses to a [`ResponseHandler`].
///
/// Created → listening after [`start_listening`](Self::start_listening) →
/// closed. Closing happens on [`close`](Self::close), on drop, after a
/// response timeout, or when the broker goes down; nothing is delivered
/// once closed.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use brokerframe::{
///     callback::PushResponseCallback,
///     config::ResponseConfig,
///     response::ResponseItem,
///     session::SessionContext,
///     transport::ResponseSource,
/// };
///
/// # async fn demo(source: Arc<dyn ResponseSource>) -> brokerframe::Result<()> {
/// let session = SessionContext::new("session-1");
/// let callback = PushResponseCallback::new(
///     session,
///     source,
///     ResponseConfig::default(),
///     |item: ResponseItem| println!("{} last={}", item.action(), item.is_last()),
/// );
/// callback.start_listening().await?;
/// # Ok(())
/// # }
/// ```
pub struct PushResponseCallback {
    inner: Arc<PushInner>,
}

impl std::fmt::Debug for PushResponseCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushResponseCallback")
            .field("registration", &self.inner.registration())
            .field("closed", &self.inner.is_closing())
            .finish_non_exhaustive()
    }
}

impl PushResponseCallback {
    /// Create a callback translating faults with [`DefaultFaultTranslator`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn new(
        session: SessionContext,
        source: Arc<dyn ResponseSource>,
        config: ResponseConfig,
        handler: impl ResponseHandler,
    ) -> Self {
        Self::with_translator(
            session,
            source,
            Arc::new(DefaultFaultTranslator),
            config,
            handler,
        )
    }

    /// Create a callback using a custom fault translator.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn with_translator(
        session: SessionContext,
        source: Arc<dyn ResponseSource>,
        translator: Arc<dyn FaultTranslator>,
        config: ResponseConfig,
        handler: impl ResponseHandler,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| PushInner {
            me: me.clone(),
            session,
            config,
            handler: Arc::new(handler),
            puller: Puller::new(source, translator),
            state: Mutex::new(DeliveryState::default()),
            dispatch: Mutex::new(()),
            closing: AtomicBool::new(false),
            registration: Mutex::new(None),
            timer: Mutex::new(None),
        });
        Self { inner }
    }

    /// Register for pushed responses and request the first window.
    ///
    /// Arms the response timeout when one is configured; it is disarmed
    /// once the stream has ended. Calling this again while listening has no
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns the translated fault when the first request fails; the
    /// callback is closed in that case. Returns
    /// [`BrokerError::NotListening`] if the callback was already closed.
    pub async fn start_listening(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closing() {
            return Err(BrokerError::NotListening);
        }
        let registration = {
            let mut slot = inner
                .registration
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Ok(());
            }
            let registration = inner.session.registry().register(inner);
            *slot = Some(registration);
            registration
        };

        let request = GetResponsesRequest::new(
            &inner.config,
            registration,
            Position::Begin,
            inner.config.window_size().capacity(),
        );
        if let Err(error) = inner.puller.pull(request).await {
            warn!(%registration, %error, "initial get responses call failed");
            inner.shutdown();
            return Err(error);
        }
        if let Some(timeout) = inner.config.response_timeout() {
            if !inner.lock_state().is_finished() {
                inner.arm_timer(timeout);
            }
        }
        debug!(%registration, "listening for pushed responses");
        Ok(())
    }

    /// Registration transports use to route to this callback.
    #[must_use]
    pub fn registration_id(&self) -> Option<RegistrationId> { self.inner.registration() }

    /// Returns `true` once the callback no longer delivers responses.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.is_closing() }

    /// Stop delivering, unregister and disarm the timeout. Idempotent.
    pub fn close(&self) { self.inner.shutdown(); }
}

impl Drop for PushResponseCallback {
    fn drop(&mut self) { self.inner.shutdown(); }
}
