//! Dispatch accounting for object adapter deactivation.
//!
//! Every dispatch holds a [`DispatchPermit`]. Closing the gate stops new
//! permits from being issued; [`DispatchGate::drain`] then waits for the
//! outstanding ones, bounded by the drain timeout, and
//! [`DispatchGate::wait_idle`] waits for them without a bound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every dispatch finished.
    Drained {
        /// Time spent waiting.
        waited: Duration,
    },
    /// The timeout expired with dispatches still running.
    Abandoned {
        /// Dispatches still holding a permit.
        remaining: usize,
    },
}

/// Admission gate and in-flight counter for one adapter's dispatches.
#[derive(Debug)]
pub struct DispatchGate {
    closed: AtomicBool,
    inflight: watch::Sender<usize>,
    timeout: Duration,
}

/// Held for the duration of one dispatch.
#[must_use]
pub struct DispatchPermit<'a> {
    gate: &'a DispatchGate,
}

impl Drop for DispatchPermit<'_> {
    fn drop(&mut self) {
        self.gate.inflight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl DispatchGate {
    /// An open gate whose drains give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let (inflight, _) = watch::channel(0);
        DispatchGate {
            closed: AtomicBool::new(false),
            inflight,
            timeout,
        }
    }

    /// Admits a dispatch, or returns `None` once the gate is closed.
    pub fn enter(&self) -> Option<DispatchPermit<'_>> {
        self.inflight.send_modify(|n| *n += 1);
        let permit = DispatchPermit { gate: self };
        // Counted before the check so `drain` never misses a late entrant.
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(permit)
    }

    /// Permits currently held.
    pub fn inflight(&self) -> usize {
        *self.inflight.borrow()
    }

    /// Whether new dispatches are refused.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the gate and waits for outstanding permits. Calling it again
    /// after a drain waits again, which completes at once when idle.
    pub async fn drain(&self) -> DrainOutcome {
        self.closed.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let mut rx = self.inflight.subscribe();
        let outcome = match tokio::time::timeout(self.timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(_) => {
                let waited = started.elapsed();
                debug!(waited_ms = waited.as_millis() as u64, "dispatches drained");
                DrainOutcome::Drained { waited }
            }
            Err(_) => {
                let remaining = self.inflight();
                warn!(remaining, timeout_ms = self.timeout.as_millis() as u64, "drain timed out");
                DrainOutcome::Abandoned { remaining }
            }
        };
        outcome
    }

    /// Resolves once no permit is held.
    pub async fn wait_idle(&self) {
        let mut rx = self.inflight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
