//! Configuration for response consumption and broker heartbeats.
//!
//! Both configuration types are assembled through consuming builders in the
//! same style as the rest of the crate. Validation happens in `build()` so
//! the runtime components can rely on non-zero windows and intervals.

use std::{num::NonZeroUsize, time::Duration};

use thiserror::Error;

/// Default number of responses per window.
pub const DEFAULT_WINDOW_SIZE: usize = 256;
/// Default interval after which a partially filled window is flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
/// Default interval between heartbeat probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Default number of consecutive probe failures tolerated.
pub const DEFAULT_HEARTBEAT_RETRIES: u32 = 3;

/// Errors returned when validating configuration.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A bounded window must hold at least one response.
    #[error("window size must be at least 1")]
    ZeroWindow,
    /// The flush interval must be non-zero.
    #[error("flush interval must be non-zero")]
    ZeroFlushInterval,
    /// The heartbeat interval must be non-zero.
    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,
    /// At least one probe failure must be allowed before tripping.
    #[error("heartbeat retry count must be at least 1")]
    ZeroRetryCount,
}

/// Capacity of a response window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowSize {
    /// Windows hold at most this many responses.
    Bounded(NonZeroUsize),
    /// All responses are requested at once and windows never fill.
    Unbounded,
}

impl WindowSize {
    /// Build a bounded window size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroWindow`] when `size` is zero.
    pub fn bounded(size: usize) -> Result<Self, ConfigError> {
        NonZeroUsize::new(size)
            .map(Self::Bounded)
            .ok_or(ConfigError::ZeroWindow)
    }

    /// Capacity of one window, or `None` when unbounded.
    #[must_use]
    pub fn capacity(self) -> Option<usize> {
        match self {
            Self::Bounded(size) => Some(size.get()),
            Self::Unbounded => None,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        NonZeroUsize::new(DEFAULT_WINDOW_SIZE).map_or(Self::Unbounded, Self::Bounded)
    }
}

/// Settings shared by [`PushResponseCallback`](crate::callback::PushResponseCallback)
/// and [`ResponseEnumerator`](crate::enumerator::ResponseEnumerator).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use brokerframe::config::{ResponseConfig, WindowSize};
///
/// let config = ResponseConfig::builder()
///     .action("Echo")
///     .window_size(WindowSize::bounded(64).expect("non-zero window"))
///     .response_timeout(Some(Duration::from_secs(30)))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.window_size().capacity(), Some(64));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseConfig {
    action: String,
    client_id: String,
    window_size: WindowSize,
    response_timeout: Option<Duration>,
    flush_interval: Duration,
    report_last_response: bool,
}

impl ResponseConfig {
    /// Start building a configuration from the defaults.
    #[must_use]
    pub fn builder() -> ResponseConfigBuilder { ResponseConfigBuilder::default() }

    /// Action filter passed to the broker; empty means every action.
    #[must_use]
    pub fn action(&self) -> &str { &self.action }

    /// Identifier of the client whose responses are retrieved.
    #[must_use]
    pub fn client_id(&self) -> &str { &self.client_id }

    /// Window capacity.
    #[must_use]
    pub fn window_size(&self) -> WindowSize { self.window_size }

    /// Maximum wait for the next response, `None` to wait forever.
    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> { self.response_timeout }

    /// Latency bound for partially filled windows.
    #[must_use]
    pub fn flush_interval(&self) -> Duration { self.flush_interval }

    /// Whether the final response of a completed set is flagged terminal.
    #[must_use]
    pub fn report_last_response(&self) -> bool { self.report_last_response }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            action: String::new(),
            client_id: String::new(),
            window_size: WindowSize::default(),
            response_timeout: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            report_last_response: true,
        }
    }
}

/// Builder for [`ResponseConfig`].
#[derive(Debug, Default)]
pub struct ResponseConfigBuilder {
    config: ResponseConfig,
}

impl ResponseConfigBuilder {
    /// Restrict retrieval to responses for `action`.
    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.config.action = action.into();
        self
    }

    /// Retrieve responses for `client_id`.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    /// Set the window capacity.
    #[must_use]
    pub fn window_size(mut self, window_size: WindowSize) -> Self {
        self.config.window_size = window_size;
        self
    }

    /// Set the response timeout. `None` waits forever.
    #[must_use]
    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set how long a partially filled window may wait before it is flushed.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Enable or disable flagging of the final response.
    #[must_use]
    pub fn report_last_response(mut self, enabled: bool) -> Self {
        self.config.report_last_response = enabled;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroFlushInterval`] when the flush interval is
    /// zero.
    pub fn build(self) -> Result<ResponseConfig, ConfigError> {
        if self.config.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(self.config)
    }
}

/// Settings for [`HeartbeatMonitor`](crate::heartbeat::HeartbeatMonitor).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use brokerframe::config::HeartbeatConfig;
///
/// let config = HeartbeatConfig::builder("session-7")
///     .interval(Duration::from_secs(1))
///     .retry_count(3)
///     .build()
///     .expect("valid heartbeat configuration");
/// assert_eq!(config.probe_timeout(), Duration::from_secs(1));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    session_id: String,
    interval: Duration,
    retry_count: u32,
    probe_timeout: Option<Duration>,
}

impl HeartbeatConfig {
    /// Start building a heartbeat configuration for `session_id`.
    #[must_use]
    pub fn builder(session_id: impl Into<String>) -> HeartbeatConfigBuilder {
        HeartbeatConfigBuilder {
            config: Self {
                session_id: session_id.into(),
                interval: DEFAULT_HEARTBEAT_INTERVAL,
                retry_count: DEFAULT_HEARTBEAT_RETRIES,
                probe_timeout: None,
            },
        }
    }

    /// Session whose broker is probed.
    #[must_use]
    pub fn session_id(&self) -> &str { &self.session_id }

    /// Interval between probes.
    #[must_use]
    pub fn interval(&self) -> Duration { self.interval }

    /// Consecutive probe failures that trip the monitor.
    #[must_use]
    pub fn retry_count(&self) -> u32 { self.retry_count }

    /// Upper bound on a single probe; defaults to the interval.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration { self.probe_timeout.unwrap_or(self.interval) }
}

/// Builder for [`HeartbeatConfig`].
#[derive(Debug)]
pub struct HeartbeatConfigBuilder {
    config: HeartbeatConfig,
}

impl HeartbeatConfigBuilder {
    /// Set the probe interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the number of consecutive failures that trip the monitor.
    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.config.retry_count = retry_count;
        self
    }

    /// Bound a single probe call.
    #[must_use]
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = Some(timeout);
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroHeartbeatInterval`] or
    /// [`ConfigError::ZeroRetryCount`] for unusable values.
    pub fn build(self) -> Result<HeartbeatConfig, ConfigError> {
        if self.config.interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.config.retry_count == 0 {
            return Err(ConfigError::ZeroRetryCount);
        }
        Ok(self.config)
    }
}
