//! Windowed buffering shared by both response consumers.
//!
//! Responses are appended to a *receiving* window. A window is sealed and
//! moved to the ready queue when it reaches capacity, when the total
//! expected count is reached, or when a flush is forced by a timer. Sealed
//! windows are immutable to the receive path and are drained in FIFO order
//! by the consumer, so arrival order is preserved end to end.

use std::collections::VecDeque;

use crate::{
    config::WindowSize,
    message::{EndOfMessage, EndReason},
    response::ResponseItem,
};

/// An ordered batch of response items.
#[derive(Debug, Default)]
pub(crate) struct Window {
    items: VecDeque<ResponseItem>,
}

impl Window {
    pub(crate) fn len(&self) -> usize { self.items.len() }

    pub(crate) fn is_empty(&self) -> bool { self.items.is_empty() }

    pub(crate) fn pop_front(&mut self) -> Option<ResponseItem> { self.items.pop_front() }

    fn push_back(&mut self, item: ResponseItem) { self.items.push_back(item); }
}

/// Progress of a client's response stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletionState {
    /// Total announced by the end-of-stream marker; `None` until it arrives.
    pub(crate) total_expected: Option<u64>,
    /// Responses received so far.
    pub(crate) received: u64,
    /// Reason recorded from the end-of-stream marker.
    pub(crate) end_reason: Option<EndReason>,
}

impl CompletionState {
    /// All announced responses have arrived.
    ///
    /// Never true while the total is unknown.
    pub(crate) fn is_complete(&self) -> bool {
        // Late duplicates after a lenient reset may push `received` past the
        // total; that still counts as complete.
        matches!(self.total_expected, Some(total) if self.received >= total)
    }
}

/// Outcome of recording an end-of-stream marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndRecord {
    /// A marker had already been recorded; this one was ignored.
    Duplicate,
    /// The marker was recorded.
    Recorded {
        /// Every announced response has already arrived.
        complete: bool,
        /// A non-empty receiving window was sealed as a result.
        sealed: bool,
    },
}

/// Receiving window, ready queue and completion counters.
#[derive(Debug)]
pub(crate) struct WindowBuffer {
    capacity: Option<usize>,
    receiving: Window,
    ready: VecDeque<Window>,
    completion: CompletionState,
}

impl WindowBuffer {
    pub(crate) fn new(window_size: WindowSize) -> Self {
        Self {
            capacity: window_size.capacity(),
            receiving: Window::default(),
            ready: VecDeque::new(),
            completion: CompletionState::default(),
        }
    }

    /// Append a response and count it.
    ///
    /// Returns `true` if the receiving window was sealed because it filled
    /// up or because the announced total has now been reached.
    pub(crate) fn push_response(&mut self, item: ResponseItem) -> bool {
        self.receiving.push_back(item);
        self.completion.received += 1;
        let full = self
            .capacity
            .is_some_and(|capacity| self.receiving.len() >= capacity);
        if full || self.completion.is_complete() {
            self.seal()
        } else {
            false
        }
    }

    /// Append an item carrying a client-side error and seal immediately.
    ///
    /// Fault items are not responses and do not count towards completion.
    pub(crate) fn push_fault(&mut self, item: ResponseItem) -> bool {
        self.receiving.push_back(item);
        self.seal()
    }

    /// Record the end-of-stream marker.
    pub(crate) fn record_end(&mut self, eom: EndOfMessage) -> EndRecord {
        if self.completion.total_expected.is_some() {
            return EndRecord::Duplicate;
        }
        self.completion.total_expected = Some(eom.count);
        self.completion.end_reason = Some(eom.reason);
        let complete = self.completion.is_complete();
        let sealed = complete && self.seal();
        EndRecord::Recorded { complete, sealed }
    }

    /// Move a non-empty receiving window to the ready queue.
    ///
    /// Returns `false`, and does nothing, when the receiving window is empty.
    pub(crate) fn seal(&mut self) -> bool {
        if self.receiving.is_empty() {
            return false;
        }
        let window = std::mem::take(&mut self.receiving);
        tracing::trace!(window.len = window.len(), "response window sealed");
        self.ready.push_back(window);
        true
    }

    pub(crate) fn pop_ready(&mut self) -> Option<Window> { self.ready.pop_front() }

    pub(crate) fn has_ready(&self) -> bool { !self.ready.is_empty() }

    pub(crate) fn receiving_len(&self) -> usize { self.receiving.len() }

    pub(crate) fn completion(&self) -> CompletionState { self.completion }

    pub(crate) fn is_complete(&self) -> bool { self.completion.is_complete() }

    /// Drop every buffered item and reset the counters.
    pub(crate) fn clear(&mut self) {
        self.receiving = Window::default();
        self.ready.clear();
        self.completion = CompletionState::default();
    }
}
