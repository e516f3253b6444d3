//! Runtime counters for a communicator.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of the counters at a point in time.
pub struct MetricsSnapshot {
    /// Invocations started through proxies.
    pub invocations: u64,
    /// Invocations that failed after all attempts.
    pub invocations_failed: u64,
    /// Extra attempts made by the retry engine.
    pub retries: u64,
    /// Invocations that hit their deadline or a reply timeout.
    pub timeouts: u64,
    /// Invocations cancelled by the caller.
    pub cancellations: u64,
    /// Request messages written (twoway and oneway).
    pub requests_sent: u64,
    /// Requests dispatched to servants, batched ones included.
    pub requests_dispatched: u64,
    /// Reply messages received.
    pub replies_received: u64,
    /// Batch request messages written.
    pub batches_flushed: u64,
    /// Total bytes written.
    pub bytes_sent: u64,
    /// Total bytes read.
    pub bytes_received: u64,
    /// Heartbeats written.
    pub heartbeats_sent: u64,
    /// Number of connections opened.
    pub connections_opened: u64,
    /// Number of connections closed.
    pub connections_closed: u64,
    /// Number of currently active connections.
    pub active_connections: u32,
}

/// Lock-free counters shared by every connection of a communicator.
pub struct Metrics {
    invocations: AtomicU64,
    invocations_failed: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    requests_sent: AtomicU64,
    requests_dispatched: AtomicU64,
    replies_received: AtomicU64,
    batches_flushed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Metrics {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            invocations_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            replies_received: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
        }
    }

    /// Counts a started invocation.
    pub fn inc_invocations(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed invocation.
    pub fn inc_invocations_failed(&self) {
        self.invocations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts `n` retried attempts.
    pub fn add_retries(&self, n: u64) {
        self.retries.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts an invocation that ran out of time.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a cancelled invocation.
    pub fn inc_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request written to a connection.
    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts `n` requests handed to an adapter.
    pub fn add_requests_dispatched(&self, n: u64) {
        self.requests_dispatched.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a reply read from a connection.
    pub fn inc_replies_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a batch written to a connection.
    pub fn inc_batches_flushed(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts outbound bytes.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts inbound bytes.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Counts a heartbeat written.
    pub fn inc_heartbeats_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an opened connection as active.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a closed connection and removes it from the active gauge.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invocations: self.invocations.load(Ordering::Relaxed),
            invocations_failed: self.invocations_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}
