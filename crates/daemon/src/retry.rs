//! Retry classification and exponential backoff
//!
//! Shared by the transfer engine (chunk-level and whole-upload retries) and
//! by the fetch driver, which hands its attempt budget to aria2c.

use media_relay_config::{FetchConfig, TransferConfig};
use std::time::Duration;

/// Classification of a failure for retry purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out
    Timeout,
    /// Remote asked us to slow down (429, rate-limit 403, 503)
    Throttled,
    /// Network-level failure (reset, DNS, refused)
    Connection,
    /// Retryable server-side status
    Server(u16),
    /// Credentials rejected; recovered by re-authentication, never by waiting
    Auth,
    /// Anything else; not retried
    Other,
}

impl ErrorKind {
    /// Map an HTTP status to a kind
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 503 => ErrorKind::Throttled,
            401 => ErrorKind::Auth,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Server(status),
            _ => ErrorKind::Other,
        }
    }

    /// Same variant, ignoring the status carried by `Server`
    pub fn same_class(&self, other: &ErrorKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Failures that usually clear up on their own. `Server` matches any status.
pub const TRANSIENT: &[ErrorKind] = &[
    ErrorKind::Timeout,
    ErrorKind::Throttled,
    ErrorKind::Connection,
    ErrorKind::Server(0),
];

/// Whole uploads restart on server and connection trouble only; throttling
/// is already absorbed chunk by chunk.
pub const UPLOAD_RESTARTABLE: &[ErrorKind] = &[ErrorKind::Connection, ErrorKind::Server(0)];

/// Decision returned by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff policy with caps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Kinds worth another attempt; `Server` entries match any status
    pub retryable: &'static [ErrorKind],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            retryable: TRANSIENT,
        }
    }
}

impl RetryPolicy {
    /// Attempt budget handed to aria2c (`--max-tries`, `--retry-wait`)
    pub fn for_fetch(cfg: &FetchConfig) -> Self {
        let wait = Duration::from_secs(cfg.retry_wait_secs);
        Self {
            max_attempts: cfg.max_tries.max(1),
            base_delay: wait,
            max_delay: wait,
            retryable: TRANSIENT,
        }
    }

    /// Per-chunk retries inside one upload attempt
    pub fn for_chunks(cfg: &TransferConfig) -> Self {
        Self {
            max_attempts: cfg.chunk_retry_limit.max(1),
            base_delay: Duration::from_millis(cfg.backoff_base_ms),
            max_delay: Duration::from_millis(cfg.backoff_max_ms),
            retryable: TRANSIENT,
        }
    }

    /// Whole-upload attempts
    pub fn for_uploads(cfg: &TransferConfig, max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.max(1),
            base_delay: Duration::from_millis(cfg.backoff_base_ms),
            max_delay: Duration::from_millis(cfg.backoff_max_ms),
            retryable: UPLOAD_RESTARTABLE,
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.iter().any(|k| k.same_class(&kind))
    }

    /// Decide whether attempt number `attempt` (1-based) should be followed
    /// by another one.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts || !self.is_retryable(kind) {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }
}
