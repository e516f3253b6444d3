//! Overall invocation deadlines.
//!
//! A deadline bounds an invocation across all of its attempts, backoff
//! sleeps included. It is measured on the tokio clock so paused-time tests
//! behave.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Absolute point in time after which an invocation fails with
/// `Error::InvocationTimeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    expiry: Instant,
}

impl Deadline {
    /// Creates a new deadline from now + timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            expiry: Instant::now() + timeout,
        }
    }

    /// Creates a deadline at an explicit instant.
    pub fn at(expiry: Instant) -> Self {
        Self { expiry }
    }

    /// Deadline for a timeout in milliseconds where negative means none.
    pub fn from_timeout_ms(timeout_ms: i32) -> Option<Self> {
        u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Deadline::new(Duration::from_millis(ms)))
    }

    /// Returns the remaining time until the deadline expires.
    ///
    /// Returns `None` if the deadline has already expired.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.expiry > now {
            Some(self.expiry - now)
        } else {
            None
        }
    }

    /// Returns `true` if the deadline has expired.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// The point in time the deadline expires.
    pub fn instant(&self) -> Instant {
        self.expiry
    }

    /// Fails with `InvocationTimeout` once expired.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(Error::InvocationTimeout)
        } else {
            Ok(())
        }
    }

    /// Caps `wait` by the remaining time.
    pub fn cap(&self, wait: Duration) -> Duration {
        wait.min(self.remaining().unwrap_or(Duration::ZERO))
    }
}

/// The earlier of two optional deadlines.
pub fn earliest(a: Option<Deadline>, b: Option<Deadline>) -> Option<Deadline> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
