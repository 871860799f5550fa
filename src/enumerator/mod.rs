//! Pull-model response consumption.
//!
//! [`ResponseEnumerator`] exposes a client's responses as a forward-only,
//! restartable sequence. Deliveries from the transport fill a receiving
//! window; sealed windows queue up as ready, and the consumer drains one
//! window at a time without holding the delivery lock. New pulls are
//! driven by the receive side: whenever every outstanding pull has been
//! answered, one more window is requested.
//!
//! Waiting for data always races against the broker-down signal and the
//! configured response timeout, so a consumer never hangs on a dead broker.

#[cfg(test)]
mod tests;

use std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{Stream, stream};
use tokio::{
    sync::Notify,
    time::{Instant, interval_at, sleep_until, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::ResponseConfig,
    error::{BrokerError, DefaultFaultTranslator, FaultTranslator, Result},
    message::{BrokerMessage, EndOfMessage, EndReason},
    metrics::{self, Mode},
    registry::{RegistrationId, ResponseSink},
    response::ResponseItem,
    session::SessionContext,
    transport::{GetResponsesRequest, Position, PullStrategy, Puller, ResponseSource},
    window::{EndRecord, Window, WindowBuffer},
};

#[derive(Debug)]
struct PullState {
    buffer: WindowBuffer,
    /// Windows requested but not yet fully received.
    outstanding: u32,
}

/// Failure that wakes waiting consumers for good.
#[derive(Default)]
struct Abort {
    /// Cancelled when the broker is lost or a pull fails.
    token: CancellationToken,
    cause: Option<BrokerError>,
}

struct EnumInner {
    me: Weak<EnumInner>,
    session: SessionContext,
    config: ResponseConfig,
    puller: Puller,
    state: Mutex<PullState>,
    /// Signalled when a window is sealed or the stream state changes.
    window_ready: Notify,
    /// Signalled when the outstanding pull count drops to zero.
    settled: Notify,
    abort: Mutex<Abort>,
    closed: AtomicBool,
    registration: Mutex<Option<RegistrationId>>,
    ticker: CancellationToken,
}

impl EnumInner {
    fn lock_state(&self) -> MutexGuard<'_, PullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registration(&self) -> Option<RegistrationId> {
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Whether pulls are sized per window and therefore refilled.
    fn refills(&self) -> bool {
        self.config.window_size().capacity().is_some()
            && self.puller.pull_strategy() != PullStrategy::Unbounded
    }

    /// Issue the first pull of a sequence and wait for the call.
    async fn initial_pull(&self) -> Result<()> {
        let registration = self.registration().ok_or(BrokerError::NotListening)?;
        let (count, outstanding) = match self.config.window_size().capacity() {
            Some(window) => match self.puller.pull_strategy() {
                PullStrategy::Unbounded => (None, 1),
                PullStrategy::Prefetch => (Some(window.saturating_mul(2)), 2),
                PullStrategy::SingleWindow => (Some(window), 1),
            },
            None => (None, 1),
        };
        self.lock_state().outstanding = outstanding;
        let request = GetResponsesRequest::new(&self.config, registration, Position::Begin, count);
        self.puller.pull(request).await
    }

    /// Account for one answered window.
    ///
    /// Returns the follow-up request when nothing else is in flight and
    /// the stream is not finished.
    fn complete_pull(&self, state: &mut PullState) -> Option<GetResponsesRequest> {
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding > 0 {
            return None;
        }
        self.settled.notify_waiters();
        let completion = state.buffer.completion();
        let finished = completion.is_complete()
            || completion
                .end_reason
                .is_some_and(|reason| reason.error().is_some());
        if finished || self.is_closed() || !self.refills() {
            return None;
        }
        let window = self.config.window_size().capacity()?;
        let registration = self.registration()?;
        state.outstanding = 1;
        Some(GetResponsesRequest::new(
            &self.config,
            registration,
            Position::Current,
            Some(window),
        ))
    }

    fn issue(&self, request: GetResponsesRequest) {
        trace!(registration = %request.registration, count = ?request.count, "requesting next window");
        let weak = self.me.clone();
        self.puller.pull_detached(request, move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.pull_failed(error);
            }
        });
    }

    fn lock_abort(&self) -> MutexGuard<'_, Abort> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the first failure and wake the consumer.
    fn abort(&self, error: BrokerError) {
        let mut abort = self.lock_abort();
        abort.cause.get_or_insert(error);
        abort.token.cancel();
    }

    /// A failed pull will never be answered; stop waiting for it.
    fn pull_failed(&self, error: BrokerError) {
        {
            let mut state = self.lock_state();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outstanding == 0 {
                self.settled.notify_waiters();
            }
        }
        self.abort(error);
    }

    fn abort_token(&self) -> CancellationToken { self.lock_abort().token.clone() }

    fn abort_error(&self) -> BrokerError {
        self.lock_abort()
            .cause
            .clone()
            .unwrap_or_else(|| BrokerError::heartbeat_failure(self.session.is_node_down()))
    }

    /// The failure recorded when the broker was lost, if it was.
    fn lost_broker(&self) -> Option<BrokerError> {
        let recorded = self
            .lock_abort()
            .cause
            .clone()
            .filter(BrokerError::is_liveness_failure);
        recorded.or_else(|| {
            self.session
                .is_broker_lost()
                .then(|| BrokerError::heartbeat_failure(self.session.is_node_down()))
        })
    }

    /// Forget a failed pull so a restarted sequence can wait again.
    fn clear_pull_fault(&self) {
        let mut abort = self.lock_abort();
        match abort.cause.as_ref() {
            Some(cause) if !cause.is_liveness_failure() => {
                debug!(%cause, "clearing failed pull before restart");
                *abort = Abort::default();
            }
            _ => {}
        }
    }

    fn on_data(&self, item: ResponseItem) {
        metrics::inc_received(Mode::Pull);
        let mut state = self.lock_state();
        let sealed = state.buffer.push_response(item);
        let received = state.buffer.completion().received;
        let boundary = self.refills()
            && self
                .config
                .window_size()
                .capacity()
                .is_some_and(|window| received % window as u64 == 0);
        let next = if boundary {
            self.complete_pull(&mut state)
        } else {
            None
        };
        drop(state);
        if sealed {
            self.window_ready.notify_one();
        }
        if let Some(request) = next {
            self.issue(request);
        }
    }

    fn on_end(&self, eom: EndOfMessage) {
        let mut state = self.lock_state();
        let record = state.buffer.record_end(eom);
        if matches!(record, EndRecord::Recorded { complete: true, .. }) {
            state.outstanding = 1;
        }
        let next = self.complete_pull(&mut state);
        drop(state);
        match record {
            EndRecord::Duplicate => debug!(count = eom.count, "ignoring repeated end of responses"),
            EndRecord::Recorded { complete, sealed } => {
                debug!(count = eom.count, reason = ?eom.reason, complete, sealed, "end of responses");
                self.window_ready.notify_one();
            }
        }
        if let Some(request) = next {
            self.issue(request);
        }
    }

    /// Seal a partially filled receiving window. Returns `true` if one was
    /// sealed.
    fn flush(&self) -> bool {
        let sealed = self.lock_state().buffer.seal();
        if sealed {
            trace!("flushed partial response window");
            self.window_ready.notify_one();
        }
        sealed
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(registration) = registration {
            self.session.registry().unregister(registration);
        }
        self.ticker.cancel();
        self.window_ready.notify_one();
        self.settled.notify_waiters();
        debug!("response enumerator closed");
    }
}

impl ResponseSink for EnumInner {
    fn on_response(&self, message: BrokerMessage) {
        match message {
            BrokerMessage::Response(response) => {
                self.session.reset_heartbeat();
                if self.is_closed() {
                    return;
                }
                self.on_data(ResponseItem::from_message(response));
            }
            BrokerMessage::EndOfMessage(eom) => {
                if !self.is_closed() {
                    self.on_end(eom);
                }
            }
            BrokerMessage::ClientFault(error) => {
                if self.is_closed() {
                    return;
                }
                let error = self.puller.translator().translate_error(error);
                debug!(%error, "client fault queued in place of a response");
                if self.lock_state().buffer.push_fault(ResponseItem::from_error(error)) {
                    self.window_ready.notify_one();
                }
            }
        }
    }

    fn on_broker_down(&self, node_down: bool) {
        debug!(node_down, "broker down; waking enumerator");
        self.abort(BrokerError::heartbeat_failure(node_down));
    }

    fn close(&self) { self.shutdown(); }
}

async fn run_flush(inner: Weak<EnumInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.flush();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Aborted,
    Signalled,
    TimedOut,
}

/// Forward-only, restartable sequence of responses.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use brokerframe::{
///     config::ResponseConfig,
///     enumerator::ResponseEnumerator,
///     session::SessionContext,
///     transport::ResponseSource,
/// };
///
/// # async fn demo(source: Arc<dyn ResponseSource>) -> brokerframe::Result<()> {
/// let session = SessionContext::new("session-1");
/// let mut responses =
///     ResponseEnumerator::open(session, source, ResponseConfig::default()).await?;
/// while responses.move_next().await? {
///     if let Some(item) = responses.current() {
///         println!("{}", item.action());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct ResponseEnumerator {
    inner: Arc<EnumInner>,
    enum_window: Option<Window>,
    current: Option<ResponseItem>,
}

impl std::fmt::Debug for ResponseEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEnumerator")
            .field("registration", &self.inner.registration())
            .field("closed", &self.inner.is_closed())
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl ResponseEnumerator {
    /// Register with the session and issue the first pull.
    ///
    /// # Errors
    ///
    /// Returns the translated fault if the first pull fails.
    pub async fn open(
        session: SessionContext,
        source: Arc<dyn ResponseSource>,
        config: ResponseConfig,
    ) -> Result<Self> {
        Self::open_with_translator(session, source, Arc::new(DefaultFaultTranslator), config).await
    }

    /// Like [`open`](Self::open), translating faults with `translator`.
    ///
    /// # Errors
    ///
    /// Returns the translated fault if the first pull fails.
    pub async fn open_with_translator(
        session: SessionContext,
        source: Arc<dyn ResponseSource>,
        translator: Arc<dyn FaultTranslator>,
        config: ResponseConfig,
    ) -> Result<Self> {
        let flush_interval = config.flush_interval();
        let buffer = WindowBuffer::new(config.window_size());
        let inner = Arc::new_cyclic(|me| EnumInner {
            me: me.clone(),
            session,
            config,
            puller: Puller::new(source, translator),
            state: Mutex::new(PullState {
                buffer,
                outstanding: 0,
            }),
            window_ready: Notify::new(),
            settled: Notify::new(),
            abort: Mutex::new(Abort::default()),
            closed: AtomicBool::new(false),
            registration: Mutex::new(None),
            ticker: CancellationToken::new(),
        });
        let registration = inner.session.registry().register(&inner);
        *inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);
        inner.puller.runtime().spawn(run_flush(
            Arc::downgrade(&inner),
            flush_interval,
            inner.ticker.clone(),
        ));

        let enumerator = Self {
            inner,
            enum_window: None,
            current: None,
        };
        if let Err(error) = enumerator.inner.initial_pull().await {
            warn!(%registration, %error, "initial get responses call failed");
            enumerator.inner.shutdown();
            return Err(error);
        }
        debug!(%registration, "response enumerator opened");
        Ok(enumerator)
    }

    /// Advance to the next response.
    ///
    /// Returns `Ok(false)` once every announced response has been consumed,
    /// or when the enumerator has been closed.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::ClientPurged`] / [`BrokerError::ClientTimedOut`] when
    ///   the broker ended the stream abnormally.
    /// - [`BrokerError::ResponseTimeout`] when nothing arrived in time and
    ///   the stream is not known to be complete.
    /// - [`BrokerError::HeartbeatFailure`], or the fault of a failed pull,
    ///   when the broker is lost.
    /// - The error carried by a response delivered as a client fault.
    pub async fn move_next(&mut self) -> Result<bool> {
        self.current = None;
        let inner = Arc::clone(&self.inner);
        let timeout = inner.config.response_timeout();
        let mut deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if inner.is_closed() {
                if inner.session.is_broker_lost() {
                    return Err(inner.abort_error());
                }
                return Ok(false);
            }
            let notified = {
                let mut state = inner.lock_state();
                if let Some(error) = state
                    .buffer
                    .completion()
                    .end_reason
                    .and_then(EndReason::error)
                {
                    return Err(error);
                }
                if let Some(item) = self.enum_window.as_mut().and_then(Window::pop_front) {
                    drop(state);
                    return self.accept(item);
                }
                if let Some(window) = state.buffer.pop_ready() {
                    self.enum_window = Some(window);
                    continue;
                }
                if state.buffer.is_complete() {
                    return Ok(false);
                }
                inner.window_ready.notified()
            };

            let aborted = inner.abort_token();
            let wake = tokio::select! {
                biased;
                () = aborted.cancelled() => Wake::Aborted,
                () = notified => Wake::Signalled,
                () = sleep_until_opt(deadline) => Wake::TimedOut,
            };
            match wake {
                Wake::Signalled => {}
                Wake::Aborted => return Err(inner.abort_error()),
                Wake::TimedOut => {
                    if inner.flush() {
                        debug!("promoting partial window after response timeout");
                        deadline = timeout.map(|timeout| Instant::now() + timeout);
                        continue;
                    }
                    if inner.lock_state().buffer.has_ready() {
                        continue;
                    }
                    let timeout = timeout.unwrap_or_default();
                    warn!(?timeout, "no response received before timeout");
                    return Err(BrokerError::ResponseTimeout(timeout));
                }
            }
        }
    }

    fn accept(&mut self, mut item: ResponseItem) -> Result<bool> {
        if let Some(error) = item.take_error() {
            return Err(error);
        }
        metrics::inc_delivered(Mode::Pull);
        self.current = Some(item);
        Ok(true)
    }

    /// Response produced by the last successful
    /// [`move_next`](Self::move_next).
    #[must_use]
    pub fn current(&self) -> Option<&ResponseItem> { self.current.as_ref() }

    /// Advance and take the next response, `None` at the end.
    ///
    /// # Errors
    ///
    /// See [`move_next`](Self::move_next).
    pub async fn next_response(&mut self) -> Result<Option<ResponseItem>> {
        if self.move_next().await? {
            Ok(self.current.take())
        } else {
            Ok(None)
        }
    }

    /// Restart the sequence from the first response.
    ///
    /// Waits, bounded by the response timeout (or the flush interval when
    /// no timeout is set), for outstanding pulls to settle, then discards
    /// everything buffered and pulls again from the beginning. If the wait
    /// runs out the reset proceeds anyway; responses still in flight from
    /// the earlier pulls may then appear twice. A failed pull from the
    /// earlier sequence is forgotten. Does nothing once closed.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::HeartbeatFailure`] when the broker was lost; nothing
    ///   can be restarted then.
    /// - The translated fault if the new first pull fails.
    pub async fn reset(&mut self) -> Result<()> {
        if self.inner.is_closed() {
            return Ok(());
        }
        if let Some(error) = self.inner.lost_broker() {
            return Err(error);
        }
        self.wait_settled().await;
        self.inner.clear_pull_fault();
        {
            let mut state = self.inner.lock_state();
            state.buffer.clear();
            state.outstanding = 0;
        }
        self.enum_window = None;
        self.current = None;
        debug!(registration = ?self.inner.registration(), "response enumerator reset");
        self.inner.initial_pull().await
    }

    async fn wait_settled(&self) {
        let inner = &self.inner;
        let bound = inner
            .config
            .response_timeout()
            .unwrap_or_else(|| inner.config.flush_interval());
        let deadline = Instant::now() + bound;
        loop {
            let notified = inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let outstanding = inner.lock_state().outstanding;
            if outstanding == 0 || inner.is_closed() {
                return;
            }
            if timeout_at(deadline, notified).await.is_err() {
                warn!(outstanding, "reset proceeding with pulls still outstanding");
                return;
            }
        }
    }

    /// Registration transports use to route to this enumerator.
    #[must_use]
    pub fn registration_id(&self) -> Option<RegistrationId> { self.inner.registration() }

    /// Returns `true` once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.is_closed() }

    /// Unregister and stop the flush ticker. Idempotent.
    pub fn close(&self) { self.inner.shutdown(); }

    /// Adapt into a stream of responses.
    ///
    /// The stream ends after the last response or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ResponseItem>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut enumerator = state?;
            match enumerator.next_response().await {
                Ok(Some(item)) => Some((Ok(item), Some(enumerator))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl Drop for ResponseEnumerator {
    fn drop(&mut self) { self.inner.shutdown(); }
}
