//! Cooperative cancellation of invocations.
//!
//! A [`CancelHandle`] fires its paired [`CancelToken`]s. The invocation engine
//! races every wait against [`CancelToken::cancelled`]; when it wins, the
//! pending reply slot is released and the caller sees `Error::Cancelled`.
//! The connection itself stays open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

/// Why an invocation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit caller cancellation
    #[default]
    UserRequested,
    /// The owning communicator or adapter is shutting down
    Shutdown,
    /// A newer invocation supersedes this one
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Arc<CancelState>>>,
}

impl CancelState {
    fn new(cancelled: bool, reason: Option<CancelReason>) -> Arc<Self> {
        Arc::new(CancelState {
            cancelled: AtomicBool::new(cancelled),
            reason: Mutex::new(reason),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        for child in children.iter() {
            child.cancel(reason);
        }
    }
}

/// A cloneable token observed by the invocation engine.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self
            .state
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// A child token cancelled with its parent but also on its own.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = CancelState::new(self.is_cancelled(), self.cancelled_reason());
        self.state
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        (
            CancelToken {
                state: state.clone(),
            },
            CancelHandle { state },
        )
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = CancelState::new(false, None);
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_pair_not_cancelled() {
        let (token, handle) = new_cancel_pair();
        assert!(!token.is_cancelled());
        assert!(!handle.is_cancelled());
        assert_eq!(token.cancelled_reason(), None);
    }

    #[test]
    fn test_first_reason_wins() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Superseded);
        handle.cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
        assert_eq!(token.cancelled_reason(), Some(CancelReason::Superseded));
    }

    #[test]
    fn test_child_follows_parent() {
        let (parent, handle) = new_cancel_pair();
        let (child, child_handle) = parent.child();
        child_handle.cancel(CancelReason::UserRequested);
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (other_child, _) = parent.child();
        handle.cancel(CancelReason::Shutdown);
        assert_eq!(other_child.cancelled_reason(), Some(CancelReason::Shutdown));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let (token, handle) = new_cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(CancelReason::UserRequested);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(CancelReason::Shutdown.to_string(), "Shutdown");
    }
}
