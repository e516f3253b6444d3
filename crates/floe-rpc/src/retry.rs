//! Retry logic with exponential backoff for invocations.
//!
//! [`classify`] decides whether a failed attempt may be repeated, and
//! [`RetryExecutor`] drives attempts with capped, jittered exponential
//! backoff. An invocation makes at most `max_retries + 1` attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::deadline::Deadline;
use crate::error::{Error, ErrorKind};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 10 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// A failed attempt and whether it may be repeated.
#[derive(Debug)]
pub struct AttemptError {
    /// Why the attempt failed.
    pub error: Error,
    /// Whether another attempt may be made.
    pub retryable: bool,
}

impl AttemptError {
    /// An error that ends the invocation.
    pub fn fatal(error: Error) -> Self {
        AttemptError {
            error,
            retryable: false,
        }
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// A fatal error, or all retries exhausted.
    Exhausted {
        /// The last error that occurred.
        last_error: Error,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// The value, or the last error.
    pub fn into_result(self) -> crate::Result<T> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails fatally, or the retry budget
    /// is spent. The attempt number (starting at 1) is passed in. Backoff
    /// sleeps never outlast `deadline`; when it expires the last error is
    /// replaced by `InvocationTimeout`.
    pub async fn execute<F, Fut, T>(&self, deadline: Option<Deadline>, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let failure = match operation(attempt).await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(failure) => failure,
            };
            let maxed_out = attempt > self.config.max_retries;
            if !failure.retryable || maxed_out {
                return RetryOutcome::Exhausted {
                    last_error: failure.error,
                    attempts: attempt,
                };
            }
            let mut backoff = self.compute_backoff(attempt - 1);
            if let Some(deadline) = deadline {
                if deadline.is_expired() {
                    return RetryOutcome::Exhausted {
                        last_error: Error::InvocationTimeout,
                        attempts: attempt,
                    };
                }
                backoff = deadline.cap(backoff);
            }
            tracing::debug!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %failure.error,
                "retrying invocation"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Computes `initial_backoff * backoff_multiplier^attempt`, capped at
    /// `max_backoff`, plus up to 50% random jitter when enabled.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let multiplier = self.config.backoff_multiplier;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;

        let computed = base_delay_ms * multiplier.powi(attempt as i32);
        let capped = computed.min(max_delay_ms);

        if self.config.jitter && capped >= 2.0 {
            let jitter_ms = rand::thread_rng().gen_range(0..(capped as u64 / 2));
            Duration::from_millis((capped as u64).saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped as u64)
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Whether a failed attempt may be repeated.
///
/// `sent` tells whether the request may have reached the peer.
/// `retry_after_send` is true for idempotent or nonmutating operations,
/// oneway requests, and invocations the caller marked retryable.
pub fn classify(error: &Error, sent: bool, retry_after_send: bool) -> bool {
    match error {
        // Handshake failures will fail the same way again.
        Error::Tls { .. } => false,
        // Sent only after the peer finished every dispatch for this
        // connection; requests that arrived later were ignored.
        Error::ConnectionClosedByPeer => true,
        e if !sent => e.kind() == ErrorKind::Transport,
        Error::ConnectionLost { .. }
        | Error::ConnectionTimeout
        | Error::Io(_)
        | Error::RequestTimeout { .. } => retry_after_send,
        _ => false,
    }
}
