//! Connection options of a session.
//!
//! [`SessionOptions`] is an immutable snapshot: every `connect()` (and every
//! retry whose interceptor returned a patch) produces a new snapshot by
//! shallow-merging an [`OptionsPatch`] over the current one. Fields the patch
//! leaves unset keep their previous value.
//!
//! The same struct is deserialized from the `[session.options]` table of the
//! application configuration, hence the `serde` and `validator` derives.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Connection and retry parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SessionOptions {
    /// Keep-alive interval in seconds.
    ///
    /// The client pings the broker at this interval when idle. `0` disables
    /// keep-alive on brokers that allow it.
    ///
    /// # Examples
    /// ```toml
    /// keep_alive = 60
    /// ```
    #[validate(range(max = 3600, message = "Keep alive must not exceed 3600 seconds"))]
    pub keep_alive: u16,

    /// Username sent in CONNECT.
    #[validate(length(min = 1, message = "Username must not be empty when set"))]
    pub username: Option<String>,

    /// Password sent in CONNECT. Ignored by most brokers without a username.
    pub password: Option<String>,

    /// Request a clean session from the broker.
    pub clean_session: bool,

    /// Reconnect automatically when an established connection drops.
    ///
    /// Independent of `retry_count`: every disconnect observed while connected
    /// starts a fresh `connect()` through the reconnect interceptor.
    pub auto_reconnect: bool,

    /// Maximum number of retries after an unconfirmed connect attempt.
    ///
    /// `None` disables the retry loop entirely.
    ///
    /// # Examples
    /// ```toml
    /// retry_count = 5
    /// ```
    pub retry_count: Option<u32>,

    /// Base backoff delay in milliseconds (delay before the first retry).
    #[validate(range(
        min = 1,
        max = 3600000,
        message = "Backoff time must be between 1 ms and 1 hour"
    ))]
    pub backoff_time: u64,

    /// Upper bound for any single backoff delay, in milliseconds.
    #[validate(range(
        min = 1,
        max = 86400000,
        message = "Max backoff time must be between 1 ms and 24 hours"
    ))]
    pub max_backoff_time: u64,

    /// Randomize each delay uniformly in `[0, delay]`.
    pub jitter: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: 60,
            username: None,
            password: None,
            clean_session: true,
            auto_reconnect: false,
            retry_count: None,
            backoff_time: 1_000,
            max_backoff_time: 30_000,
            jitter: false,
        }
    }
}

impl SessionOptions {
    /// Returns a new snapshot with every field set in `patch` overriding `self`.
    pub fn merged(&self, patch: &OptionsPatch) -> Self {
        Self {
            keep_alive: patch.keep_alive.unwrap_or(self.keep_alive),
            username: patch.username.clone().or_else(|| self.username.clone()),
            password: patch.password.clone().or_else(|| self.password.clone()),
            clean_session: patch.clean_session.unwrap_or(self.clean_session),
            auto_reconnect: patch.auto_reconnect.unwrap_or(self.auto_reconnect),
            retry_count: patch.retry_count.or(self.retry_count),
            backoff_time: patch.backoff_time.unwrap_or(self.backoff_time),
            max_backoff_time: patch.max_backoff_time.unwrap_or(self.max_backoff_time),
            jitter: patch.jitter.unwrap_or(self.jitter),
        }
    }

    /// The subset of options the transport needs to open a connection.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            keep_alive: self.keep_alive,
            username: self.username.clone(),
            password: self.password.clone(),
            clean_session: self.clean_session,
        }
    }
}

/// Partial override of [`SessionOptions`].
///
/// Returned by reconnect interceptors and accepted by `connect()`.
///
/// # Examples
/// ```ignore
/// let patch = OptionsPatch::default()
///     .with_credentials("svc", fresh_token)
///     .with_keep_alive(30);
/// session.connect(Some(patch));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsPatch {
    pub keep_alive: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: Option<bool>,
    pub auto_reconnect: Option<bool>,
    pub retry_count: Option<u32>,
    pub backoff_time: Option<u64>,
    pub max_backoff_time: Option<u64>,
    pub jitter: Option<bool>,
}

impl OptionsPatch {
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = Some(seconds);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = Some(clean);
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = Some(enabled);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    /// Sets base and cap of the backoff, both in milliseconds.
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_time = Some(base_ms);
        self.max_backoff_time = Some(max_ms);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Parameters handed to the transport for one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Seconds.
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
}
