//! Active connection management: heartbeats, dead peer detection and idle
//! close.
//!
//! With a timeout `T`, a monitor wakes every `T/2`. It writes a heartbeat
//! when the heartbeat policy asks for one, closes the connection with
//! `ConnectionTimeout` when nothing was read for `2T`, and gracefully closes
//! an idle connection (nothing read or written, no pending request, no
//! dispatch) after `T` when the close policy is `OnIdle`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// When heartbeats are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatPolicy {
    /// Never.
    Off,
    /// When nothing was written for half the timeout.
    #[default]
    OnIdle,
    /// Every half timeout.
    Always,
}

/// When the monitor closes a connection on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Never; only dead peers are closed.
    #[default]
    Off,
    /// After a full timeout without traffic or outstanding work.
    OnIdle,
}

/// Error parsing an ACM policy name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePolicyError(pub String);

impl fmt::Display for ParsePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown ACM policy `{}`", self.0)
    }
}

impl std::error::Error for ParsePolicyError {}

impl FromStr for HeartbeatPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Off" | "0" => Ok(HeartbeatPolicy::Off),
            "OnIdle" | "2" => Ok(HeartbeatPolicy::OnIdle),
            "Always" | "3" => Ok(HeartbeatPolicy::Always),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

impl FromStr for ClosePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Off" | "0" => Ok(ClosePolicy::Off),
            "OnIdle" | "1" => Ok(ClosePolicy::OnIdle),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// Configuration for connection monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmConfig {
    /// Monitoring timeout; `None` disables the monitor.
    pub timeout: Option<Duration>,
    /// When heartbeats are sent.
    pub heartbeat: HeartbeatPolicy,
    /// When an inactive connection is closed.
    pub close: ClosePolicy,
}

impl Default for AcmConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            heartbeat: HeartbeatPolicy::OnIdle,
            close: ClosePolicy::Off,
        }
    }
}

impl AcmConfig {
    /// Monitoring switched off.
    pub fn disabled() -> Self {
        Self {
            timeout: None,
            heartbeat: HeartbeatPolicy::Off,
            close: ClosePolicy::Off,
        }
    }

    /// How often the monitor wakes up.
    pub fn interval(&self) -> Option<Duration> {
        self.timeout
            .map(|t| (t / 2).max(Duration::from_millis(1)))
    }

    /// Decides what the monitor does now. `busy` is true while requests are
    /// pending or dispatches are running.
    pub fn evaluate(&self, activity: &Activity, busy: bool) -> AcmAction {
        let Some(timeout) = self.timeout else {
            return AcmAction::None;
        };
        let since_read = activity.since_read();
        if since_read >= timeout * 2 {
            return AcmAction::TimedOut;
        }
        let since_write = activity.since_write();
        if self.close == ClosePolicy::OnIdle
            && !busy
            && since_read >= timeout
            && since_write >= timeout
        {
            return AcmAction::CloseIdle;
        }
        match self.heartbeat {
            HeartbeatPolicy::Always => AcmAction::Heartbeat,
            HeartbeatPolicy::OnIdle if since_write >= timeout / 2 => AcmAction::Heartbeat,
            _ => AcmAction::None,
        }
    }
}

/// The monitor's verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmAction {
    /// Nothing to do.
    None,
    /// Send a heartbeat.
    Heartbeat,
    /// The peer went silent; close with `ConnectionTimeout`.
    TimedOut,
    /// Close gracefully.
    CloseIdle,
}

/// Last read and write times of a connection.
#[derive(Debug)]
pub struct Activity {
    base: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    /// Starts with both directions marked active now.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    /// Records inbound traffic.
    pub fn mark_read(&self) {
        self.last_read_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Records outbound traffic.
    pub fn mark_write(&self) {
        self.last_write_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Time since the last inbound traffic.
    pub fn since_read(&self) -> Duration {
        let last = self.last_read_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    /// Time since the last outbound traffic.
    pub fn since_write(&self) -> Duration {
        let last = self.last_write_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(heartbeat: HeartbeatPolicy, close: ClosePolicy) -> AcmConfig {
        AcmConfig {
            timeout: Some(Duration::from_secs(10)),
            heartbeat,
            close,
        }
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Always".parse::<HeartbeatPolicy>().unwrap(), HeartbeatPolicy::Always);
        assert_eq!("OnIdle".parse::<ClosePolicy>().unwrap(), ClosePolicy::OnIdle);
        assert!("Sometimes".parse::<HeartbeatPolicy>().is_err());
    }

    #[test]
    fn test_interval_is_half_timeout() {
        assert_eq!(AcmConfig::default().interval(), Some(Duration::from_secs(30)));
        assert_eq!(AcmConfig::disabled().interval(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_connection_needs_nothing() {
        let activity = Activity::new();
        let acm = config(HeartbeatPolicy::OnIdle, ClosePolicy::OnIdle);
        assert_eq!(acm.evaluate(&activity, false), AcmAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_on_idle_write() {
        let activity = Activity::new();
        let acm = config(HeartbeatPolicy::OnIdle, ClosePolicy::Off);
        tokio::time::advance(Duration::from_secs(5)).await;
        activity.mark_read();
        assert_eq!(acm.evaluate(&activity, false), AcmAction::Heartbeat);
        activity.mark_write();
        assert_eq!(acm.evaluate(&activity, false), AcmAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_always() {
        let activity = Activity::new();
        let acm = config(HeartbeatPolicy::Always, ClosePolicy::Off);
        assert_eq!(acm.evaluate(&activity, true), AcmAction::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let activity = Activity::new();
        let acm = config(HeartbeatPolicy::Always, ClosePolicy::Off);
        tokio::time::advance(Duration::from_secs(20)).await;
        activity.mark_write();
        assert_eq!(acm.evaluate(&activity, true), AcmAction::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_close_only_when_not_busy() {
        let activity = Activity::new();
        let acm = config(HeartbeatPolicy::Off, ClosePolicy::OnIdle);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(acm.evaluate(&activity, true), AcmAction::None);
        assert_eq!(acm.evaluate(&activity, false), AcmAction::CloseIdle);
    }
}
