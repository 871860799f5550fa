//! Serialised access to captured `log` records.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use logtest::{Logger, Record};
use rstest::fixture;

/// Exclusive handle to the process-wide log capture.
///
/// Tests holding a handle never see records emitted under another test's
/// handle, as long as every log-asserting test goes through [`logger`].
pub struct LoggerHandle {
    guard: MutexGuard<'static, Logger>,
}

impl LoggerHandle {
    /// Acquire the capture and discard records left by earlier tests.
    #[must_use]
    pub fn new() -> Self {
        static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

        let logger = LOGGER.get_or_init(|| Mutex::new(Logger::start()));
        let mut guard = logger.lock().unwrap_or_else(PoisonError::into_inner);
        while guard.pop().is_some() {}

        Self { guard }
    }

    /// Drain every captured record, oldest first.
    pub fn drain(&mut self) -> Vec<Record> { std::iter::from_fn(|| self.guard.pop()).collect() }

    /// Whether any captured record's message contains `needle`.
    ///
    /// Consumes the captured records.
    pub fn contains(&mut self, needle: &str) -> bool {
        self.drain()
            .iter()
            .any(|record| record.args().contains(needle))
    }
}

impl Default for LoggerHandle {
    fn default() -> Self { Self::new() }
}

impl std::ops::Deref for LoggerHandle {
    type Target = Logger;

    fn deref(&self) -> &Self::Target { &self.guard }
}

impl std::ops::DerefMut for LoggerHandle {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.guard }
}

#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn logger() -> LoggerHandle { LoggerHandle::new() }
