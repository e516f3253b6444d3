//! Pending twoway requests of one connection.
//!
//! Each in-flight twoway request owns one slot keyed by its request id. A slot
//! resolves exactly once: by its reply, or by the connection failing, or it is
//! released when the waiter gives up (timeout, cancellation, drop). Ids are
//! positive, wrap from `i32::MAX` back to 1 and skip ids still in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::protocol::Reply;

struct PendingState {
    slots: HashMap<i32, oneshot::Sender<Result<Reply>>>,
    next_id: i32,
    closed: Option<Error>,
}

/// Request-id allocator and reply router.
pub struct PendingTable {
    state: Mutex<PendingState>,
    drained: Notify,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// An empty, open table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                slots: HashMap::new(),
                next_id: 1,
                closed: None,
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates an id and its slot. Fails with the closing error once the
    /// table is closed.
    pub fn register(self: &Arc<Self>) -> Result<ResponseHandle> {
        let mut state = self.lock();
        if let Some(error) = &state.closed {
            return Err(error.clone());
        }
        let id = loop {
            let candidate = state.next_id;
            state.next_id = if candidate == i32::MAX { 1 } else { candidate + 1 };
            if !state.slots.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        state.slots.insert(id, tx);
        Ok(ResponseHandle {
            id,
            receiver: rx,
            table: self.clone(),
        })
    }

    /// Routes a reply. Returns false when no slot waits for its id.
    pub fn complete(&self, reply: Reply) -> bool {
        let sender = {
            let mut state = self.lock();
            let sender = state.slots.remove(&reply.request_id);
            if state.slots.is_empty() {
                self.drained.notify_waiters();
            }
            sender
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Fails one slot, e.g. when writing its request failed.
    pub fn fail(&self, id: i32, error: Error) {
        let sender = self.remove(id);
        if let Some(sender) = sender {
            let _ = sender.send(Err(error));
        }
    }

    /// Closes the table and fails every slot with `error`. Later calls keep
    /// the first error.
    pub fn fail_all(&self, error: Error) {
        let senders: Vec<_> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(error.clone());
            }
            state.slots.drain().map(|(_, s)| s).collect()
        };
        self.drained.notify_waiters();
        for sender in senders {
            let _ = sender.send(Err(error.clone()));
        }
    }

    fn remove(&self, id: i32) -> Option<oneshot::Sender<Result<Reply>>> {
        let mut state = self.lock();
        let sender = state.slots.remove(&id);
        if sender.is_some() && state.slots.is_empty() {
            self.drained.notify_waiters();
        }
        sender
    }

    /// Number of requests awaiting a reply.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether no request awaits a reply.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table was failed and refuses new slots.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Resolves once no slot is pending.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// The caller's side of one pending slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ResponseHandle {
    id: i32,
    receiver: oneshot::Receiver<Result<Reply>>,
    table: Arc<PendingTable>,
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PendingTable")
            .field("pending", &state.slots.len())
            .field("closed", &state.closed.is_some())
            .finish()
    }
}

impl ResponseHandle {
    /// The request id the reply must carry.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Waits for the reply, at most `timeout`, giving up early on `cancel`.
    pub async fn wait(mut self, timeout: Option<Duration>, cancel: Option<&CancelToken>) -> Result<Reply> {
        let id = self.id;
        let receiver = &mut self.receiver;
        let reply = async move {
            receiver.await.unwrap_or_else(|_| {
                Err(Error::ConnectionLost {
                    reason: "pending request dropped".to_string(),
                })
            })
        };
        let timed = async move {
            match timeout {
                Some(t) => tokio::time::timeout(t, reply).await.unwrap_or_else(|_| {
                    Err(Error::RequestTimeout {
                        request_id: id,
                        timeout_ms: t.as_millis() as u64,
                    })
                }),
                None => reply.await,
            }
        };
        match cancel {
            Some(token) => tokio::select! {
                result = timed => result,
                _ = token.cancelled() => Err(Error::Cancelled),
            },
            None => timed.await,
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{new_cancel_pair, CancelReason};
    use crate::codec::Encapsulation;
    use crate::protocol::ReplyBody;
    use crate::version::ENCODING_1_1;
    use std::collections::HashSet;

    fn ok_reply(request_id: i32) -> Reply {
        Reply {
            request_id,
            body: ReplyBody::Ok(Encapsulation::empty(ENCODING_1_1)),
        }
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register().unwrap();
        assert_eq!(handle.id(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.complete(ok_reply(1)));
        let reply = handle.wait(None, None).await.unwrap();
        assert_eq!(reply.request_id, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_unique_among_in_flight() {
        let table = Arc::new(PendingTable::new());
        let handles: Vec<_> = (0..100).map(|_| table.register().unwrap()).collect();
        let ids: HashSet<i32> = handles.iter().map(|h| h.id()).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|&id| id > 0));
    }

    #[test]
    fn test_id_wraps_and_skips_in_use() {
        let table = Arc::new(PendingTable::new());
        let first = table.register().unwrap();
        assert_eq!(first.id(), 1);
        table.lock().next_id = i32::MAX;
        let max = table.register().unwrap();
        assert_eq!(max.id(), i32::MAX);
        let wrapped = table.register().unwrap();
        assert_eq!(wrapped.id(), 2);
    }

    #[test]
    fn test_unknown_reply_is_not_routed() {
        let table = PendingTable::new();
        assert!(!table.complete(ok_reply(42)));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_everyone_once() {
        let table = Arc::new(PendingTable::new());
        let a = table.register().unwrap();
        let b = table.register().unwrap();
        table.fail_all(Error::ConnectionClosedByPeer);
        table.fail_all(Error::ConnectionTimeout);
        assert!(matches!(a.wait(None, None).await, Err(Error::ConnectionClosedByPeer)));
        assert!(matches!(b.wait(None, None).await, Err(Error::ConnectionClosedByPeer)));
        assert!(matches!(table.register(), Err(Error::ConnectionClosedByPeer)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register().unwrap();
        let id = handle.id();
        let err = handle
            .wait(Some(Duration::from_millis(50)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { request_id, .. } if request_id == id));
        assert!(table.is_empty());
        assert!(!table.complete(ok_reply(id)));
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register().unwrap();
        let (token, cancel) = new_cancel_pair();
        cancel.cancel(CancelReason::UserRequested);
        assert!(matches!(
            handle.wait(None, Some(&token)).await,
            Err(Error::Cancelled)
        ));
        assert!(table.is_empty());
        assert!(!table.is_closed());
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let table = Arc::new(PendingTable::new());
        let handle = table.register().unwrap();
        let t = table.clone();
        let waiter = tokio::spawn(async move { t.wait_empty().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        table.complete(ok_reply(handle.id()));
        waiter.await.unwrap();
    }
}
