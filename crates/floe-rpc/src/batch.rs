//! Batch request queues.
//!
//! Batch-oneway and batch-datagram invocations are not sent one by one: their
//! request bodies (without request id) accumulate in a queue and go out as a
//! single batch-request message on flush. The queue itself never performs
//! I/O; [`BatchRequestQueue::enqueue`] hands back any batch that must be
//! written before the new request, and [`BatchRequestQueue::swap`] takes the
//! accumulated batch for an explicit flush.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};

use crate::codec::OutputStream;
use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::{Request, HEADER_SIZE};
use crate::version::ENCODING_1_0;

/// Default auto-flush threshold (1 MiB).
pub const DEFAULT_AUTO_FLUSH_SIZE: usize = 1024 * 1024;

/// What to do with a request offered to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Append it to the queue.
    Enqueue,
    /// Flush what is queued, then append it.
    FlushThenEnqueue,
    /// Discard it.
    Drop,
}

/// A request about to be queued, as seen by a [`BatchInterceptor`].
#[derive(Debug)]
pub struct BatchRequest<'a> {
    /// Target object.
    pub identity: &'a Identity,
    /// Operation name.
    pub operation: &'a str,
    /// Encoded size of the request body.
    pub size: usize,
}

/// Decides per request whether to enqueue, flush first, or drop. Called
/// with the number of queued requests and their encoded size.
pub type BatchInterceptor = Arc<dyn Fn(&BatchRequest<'_>, usize, usize) -> BatchDecision + Send + Sync>;

/// A batch ready to be written: request count and concatenated bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Number of requests.
    pub count: usize,
    /// Request bodies, back to back.
    pub bodies: Bytes,
}

impl Batch {
    /// The batch-request message carrying these requests.
    pub fn to_message(&self) -> Result<Bytes> {
        crate::protocol::batch_message(self.count, &self.bodies)
    }
}

struct QueueState {
    bodies: BytesMut,
    count: usize,
}

/// FIFO of encoded batch requests.
pub struct BatchRequestQueue {
    state: Mutex<QueueState>,
    auto_flush_size: usize,
    interceptor: Option<BatchInterceptor>,
}

impl fmt::Debug for BatchRequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BatchRequestQueue")
            .field("count", &state.count)
            .field("size", &state.bodies.len())
            .field("auto_flush_size", &self.auto_flush_size)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

impl Default for BatchRequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_FLUSH_SIZE, None)
    }
}

impl BatchRequestQueue {
    /// A queue that asks for a flush once a batch message would exceed
    /// `auto_flush_size` bytes (0 disables auto-flush).
    pub fn new(auto_flush_size: usize, interceptor: Option<BatchInterceptor>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                bodies: BytesMut::new(),
                count: 0,
            }),
            auto_flush_size,
            interceptor,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `request` (its id is not written). Returns the batch that was
    /// queued before it when that batch must be flushed first.
    pub fn enqueue(&self, request: &Request) -> Result<Option<Batch>> {
        let mut out = OutputStream::new(ENCODING_1_0);
        request.encode_body(&mut out, false);
        let body = out.finished()?;

        let mut state = self.lock();
        let mut decision = BatchDecision::Enqueue;
        if let Some(interceptor) = &self.interceptor {
            let offered = BatchRequest {
                identity: &request.header.identity,
                operation: &request.header.operation,
                size: body.len(),
            };
            decision = interceptor(&offered, state.count, state.bodies.len());
        }
        if decision == BatchDecision::Drop {
            tracing::debug!(operation = %request.header.operation, "batch request dropped");
            return Ok(None);
        }
        let projected = HEADER_SIZE + 4 + state.bodies.len() + body.len();
        if self.auto_flush_size > 0 && state.count > 0 && projected > self.auto_flush_size {
            decision = BatchDecision::FlushThenEnqueue;
        }
        let flushed = match decision {
            BatchDecision::FlushThenEnqueue => take(&mut state),
            _ => None,
        };
        state.bodies.extend_from_slice(&body);
        state.count += 1;
        Ok(flushed)
    }

    /// Takes everything queued, leaving the queue empty.
    pub fn swap(&self) -> Option<Batch> {
        take(&mut self.lock())
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.lock().count
    }

    /// Whether the batch holds no request.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn take(state: &mut QueueState) -> Option<Batch> {
    if state.count == 0 {
        return None;
    }
    let count = std::mem::take(&mut state.count);
    let bodies = std::mem::take(&mut state.bodies).freeze();
    Some(Batch { count, bodies })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Context, Encapsulation};
    use crate::protocol::{body_reader, OperationMode, RequestHeader};
    use crate::version::ENCODING_1_1;

    fn request(operation: &str, payload: &[u8]) -> Request {
        Request {
            header: RequestHeader {
                request_id: 0,
                identity: Identity::new("obj"),
                facet: String::new(),
                operation: operation.to_string(),
                mode: OperationMode::Normal,
                context: Context::new(),
            },
            params: Encapsulation::new(ENCODING_1_1, Bytes::copy_from_slice(payload)),
        }
    }

    #[test]
    fn test_fifo_order_in_one_message() {
        let queue = BatchRequestQueue::default();
        for op in ["a", "b", "c"] {
            assert!(queue.enqueue(&request(op, &[1])).unwrap().is_none());
        }
        assert_eq!(queue.len(), 3);
        let batch = queue.swap().unwrap();
        assert!(queue.is_empty());
        assert_eq!(batch.count, 3);

        let mut input = body_reader(batch.to_message().unwrap());
        assert_eq!(input.read_int().unwrap(), 3);
        let ops: Vec<String> = (0..3)
            .map(|_| Request::decode_body(&mut input, false).unwrap().header.operation)
            .collect();
        assert_eq!(ops, vec!["a", "b", "c"]);
        assert!(input.is_at_end());
    }

    #[test]
    fn test_swap_empty() {
        assert!(BatchRequestQueue::default().swap().is_none());
    }

    #[test]
    fn test_auto_flush_returns_previous_batch() {
        let queue = BatchRequestQueue::new(64, None);
        assert!(queue.enqueue(&request("first", &[0; 20])).unwrap().is_none());
        let flushed = queue.enqueue(&request("second", &[0; 20])).unwrap().unwrap();
        assert_eq!(flushed.count, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_interceptor_drop_and_flush() {
        let interceptor: BatchInterceptor = Arc::new(|req, count, _size| match req.operation {
            "skip" => BatchDecision::Drop,
            "flush" if count > 0 => BatchDecision::FlushThenEnqueue,
            _ => BatchDecision::Enqueue,
        });
        let queue = BatchRequestQueue::new(0, Some(interceptor));
        assert!(queue.enqueue(&request("keep", &[])).unwrap().is_none());
        assert!(queue.enqueue(&request("skip", &[])).unwrap().is_none());
        assert_eq!(queue.len(), 1);
        let flushed = queue.enqueue(&request("flush", &[])).unwrap().unwrap();
        assert_eq!(flushed.count, 1);
        assert_eq!(queue.len(), 1);
    }
}
