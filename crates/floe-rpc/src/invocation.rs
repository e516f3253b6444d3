//! The invocation engine.
//!
//! One [`invoke`] call builds the request once and drives it through
//! attempts: pick a collocated adapter or a connection, send, await the
//! reply, and classify failures for [`RetryExecutor`]. The whole run races
//! the caller's deadline and cancel token; losing the race drops the attempt
//! in flight, which releases its pending slot without touching the
//! connection.

use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::adapter::ObjectAdapter;
use crate::cancel::CancelToken;
use crate::codec::{Context, Encapsulation};
use crate::connection::Connection;
use crate::deadline::{earliest, Deadline};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{OperationMode, ReplyBody, Request, RequestHeader};
use crate::proxy::ObjectPrx;
use crate::reference::EndpointSelection;
use crate::retry::{classify, AttemptError, RetryOutcome};
use crate::version::PROTOCOL_1_0;

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Replaces the proxy's context for this call.
    pub context: Option<Context>,
    /// Allows retries after the request may have reached the server, as if
    /// the operation were idempotent.
    pub retryable: bool,
    /// Bounds all attempts together with the proxy's invocation timeout.
    pub deadline: Option<Deadline>,
    /// Cancels the call when triggered.
    pub cancel: Option<CancelToken>,
}

/// The result of an invocation that reached a servant.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeReply {
    /// False when `payload` holds a user exception.
    pub ok: bool,
    /// Return values, or the encoded user exception.
    pub payload: Encapsulation,
}

/// Progress of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Looking for a connection.
    Pending,
    /// Oneway request written.
    Sent,
    /// Twoway request written or dispatched locally.
    AwaitingReply,
    /// A reply arrived, possibly carrying a user exception.
    Succeeded,
    /// The attempt failed and may be repeated.
    FailedRetryable,
    /// The invocation failed for good.
    FailedFatal,
}

/// Sends `operation` through `proxy`.
pub(crate) async fn invoke(
    proxy: &ObjectPrx,
    operation: &str,
    mode: OperationMode,
    params: Encapsulation,
    options: InvokeOptions,
) -> Result<InvokeReply> {
    let communicator = proxy.communicator();
    communicator.check_destroyed()?;
    let metrics = communicator.metrics();
    metrics.inc_invocations();

    let data = proxy.data();
    if !data.encoding.is_supported() {
        return Err(Error::UnsupportedEncoding {
            encoding: data.encoding,
        });
    }
    if data.protocol != PROTOCOL_1_0 {
        return Err(Error::UnsupportedProtocol {
            version: data.protocol,
        });
    }

    let twoway = data.mode.is_twoway();
    let request = Request {
        header: RequestHeader {
            // Twoway ids are assigned by the connection at send time.
            request_id: if twoway { 1 } else { 0 },
            identity: data.identity.clone(),
            facet: data.facet.clone(),
            operation: operation.to_string(),
            mode,
            context: options.context.clone().unwrap_or_else(|| data.context.clone()),
        },
        params,
    };

    if data.mode.is_batch() {
        return enqueue_batch(proxy, &request).await;
    }

    let deadline = earliest(options.deadline, Deadline::from_timeout_ms(data.invocation_timeout));
    let invocation = Invocation {
        proxy,
        message: request.to_message()?,
        request,
        twoway,
        retry_after_send: mode.is_idempotent() || !twoway || options.retryable,
        state: Mutex::new(InvocationState::Pending),
        attempts: AtomicU32::new(0),
        located_retry: AtomicBool::new(false),
    };

    let executor = communicator.retry_executor();
    let run = {
        let invocation = &invocation;
        executor.execute(deadline, move |attempt| invocation.attempt(attempt))
    };
    let result = tokio::select! {
        biased;
        _ = cancellation(options.cancel.as_ref()) => Err(Error::Cancelled),
        _ = expiry(deadline) => Err(Error::InvocationTimeout),
        outcome = run => match outcome {
            RetryOutcome::Success(reply) => Ok(reply),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        },
    };

    let attempts = invocation.attempts.load(Ordering::Acquire);
    if attempts > 1 {
        metrics.add_retries(u64::from(attempts - 1));
    }
    if let Err(error) = &result {
        metrics.inc_invocations_failed();
        match error {
            Error::InvocationTimeout => metrics.inc_timeouts(),
            Error::Cancelled => metrics.inc_cancellations(),
            _ => {}
        }
        debug!(
            proxy = %proxy,
            operation,
            attempts,
            state = ?invocation.state(),
            error = %error,
            "invocation failed"
        );
    }
    result
}

async fn cancellation(token: Option<&CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => pending().await,
    }
}

async fn expiry(deadline: Option<Deadline>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.instant()).await,
        None => pending().await,
    }
}

/// Queues a batched request on the fixed connection or the proxy, sending
/// the previous batch when the queue asks for an automatic flush.
async fn enqueue_batch(proxy: &ObjectPrx, request: &Request) -> Result<InvokeReply> {
    let reference = proxy.reference();
    let queue = match &reference.fixed {
        Some(connection) => connection.batch_queue(),
        None => &reference.batch,
    };
    if let Some(batch) = queue.enqueue(request)? {
        let connection = connection_for(proxy).await?;
        connection.send_batch(batch).await?;
    }
    Ok(InvokeReply {
        ok: true,
        payload: Encapsulation::empty(reference.data.encoding),
    })
}

struct Invocation<'a> {
    proxy: &'a ObjectPrx,
    request: Request,
    message: Bytes,
    twoway: bool,
    retry_after_send: bool,
    state: Mutex<InvocationState>,
    attempts: AtomicU32,
    /// Object-not-exist on an indirect proxy is retried once.
    located_retry: AtomicBool,
}

impl Invocation<'_> {
    fn state(&self) -> InvocationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: InvocationState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn empty_reply(&self) -> InvokeReply {
        InvokeReply {
            ok: true,
            payload: Encapsulation::empty(self.request.params.encoding),
        }
    }

    async fn attempt(&self, attempt: u32) -> std::result::Result<InvokeReply, AttemptError> {
        self.attempts.store(attempt, Ordering::Release);
        self.set_state(InvocationState::Pending);
        trace!(
            operation = %self.request.header.operation,
            attempt,
            "invocation attempt"
        );

        if let Some(adapter) = self.collocated_adapter() {
            return self.dispatch_collocated(adapter).await;
        }

        let connection = connection_for(self.proxy)
            .await
            .map_err(|e| self.fail(e, false))?;
        let handle = connection
            .send_request(self.message.clone(), self.twoway)
            .await
            .map_err(|e| self.fail(e, false))?;
        let Some(handle) = handle else {
            self.set_state(InvocationState::Sent);
            return Ok(self.empty_reply());
        };

        self.set_state(InvocationState::AwaitingReply);
        let reply_timeout = self.proxy.communicator().config().reply_timeout;
        let reply = handle
            .wait(reply_timeout, None)
            .await
            .map_err(|e| self.fail(e, true))?;
        self.handle_reply(reply.body)
    }

    fn collocated_adapter(&self) -> Option<ObjectAdapter> {
        let data = self.proxy.data();
        if !data.collocation_optimized || self.proxy.is_fixed() || data.mode.is_datagram() {
            return None;
        }
        self.proxy.communicator().find_collocated_adapter(data)
    }

    async fn dispatch_collocated(&self, adapter: ObjectAdapter) -> std::result::Result<InvokeReply, AttemptError> {
        if !self.twoway {
            let request = self.request.clone();
            tokio::spawn(async move {
                adapter.dispatch(request, None).await;
            });
            self.set_state(InvocationState::Sent);
            return Ok(self.empty_reply());
        }
        self.set_state(InvocationState::AwaitingReply);
        match adapter.dispatch(self.request.clone(), None).await {
            Some(body) => self.handle_reply(body),
            None => {
                // Not dispatched; the next attempt no longer sees the
                // adapter as local.
                self.set_state(InvocationState::FailedRetryable);
                Err(AttemptError {
                    error: Error::AdapterDeactivated {
                        name: adapter.name().to_string(),
                    },
                    retryable: true,
                })
            }
        }
    }

    fn handle_reply(&self, body: ReplyBody) -> std::result::Result<InvokeReply, AttemptError> {
        let error = match body {
            ReplyBody::Ok(payload) => {
                self.set_state(InvocationState::Succeeded);
                return Ok(InvokeReply { ok: true, payload });
            }
            ReplyBody::UserException(payload) => {
                self.set_state(InvocationState::Succeeded);
                return Ok(InvokeReply { ok: false, payload });
            }
            ReplyBody::ObjectNotExist {
                identity,
                facet,
                operation,
            } => {
                let error = Error::ObjectNotExist {
                    identity,
                    facet,
                    operation,
                };
                if self.proxy.is_indirect() && !self.located_retry.swap(true, Ordering::AcqRel) {
                    self.forget_endpoints();
                    self.set_state(InvocationState::FailedRetryable);
                    return Err(AttemptError {
                        error,
                        retryable: true,
                    });
                }
                error
            }
            ReplyBody::FacetNotExist {
                identity,
                facet,
                operation,
            } => Error::FacetNotExist {
                identity,
                facet,
                operation,
            },
            ReplyBody::OperationNotExist {
                identity,
                facet,
                operation,
            } => Error::OperationNotExist {
                identity,
                facet,
                operation,
            },
            ReplyBody::UnknownLocalException(reason) => Error::UnknownLocal { reason },
            ReplyBody::UnknownUserException(reason) => Error::UnknownUser { reason },
            ReplyBody::UnknownException(reason) => Error::Unknown { reason },
        };
        self.set_state(InvocationState::FailedFatal);
        Err(AttemptError::fatal(error))
    }

    /// Drops the cached connection and, for indirect proxies, the locator
    /// cache entry that led to it.
    fn forget_endpoints(&self) {
        let reference = self.proxy.reference();
        reference.clear_cached_connection();
        if self.proxy.is_indirect() {
            if let Some(locator) = reference.communicator.locator_info() {
                locator.invalidate(&reference.data);
            }
        }
    }

    fn fail(&self, error: Error, sent: bool) -> AttemptError {
        if error.kind() == ErrorKind::Transport {
            self.forget_endpoints();
        }
        let retryable = !self.proxy.is_fixed()
            && !matches!(error, Error::NoEndpoint { .. })
            && classify(&error, sent, self.retry_after_send);
        self.set_state(if retryable {
            InvocationState::FailedRetryable
        } else {
            InvocationState::FailedFatal
        });
        AttemptError { error, retryable }
    }
}

/// The connection `proxy` sends on: its fixed connection, else its cached
/// one, else the first endpoint that yields a validated connection.
pub(crate) async fn connection_for(proxy: &ObjectPrx) -> Result<Arc<Connection>> {
    let reference = proxy.reference();
    if let Some(fixed) = &reference.fixed {
        if let Some(error) = fixed.close_error() {
            return Err(error);
        }
        return Ok(fixed.clone());
    }

    let communicator = &reference.communicator;
    communicator.check_destroyed()?;
    if let Some(connection) = reference.cached_connection() {
        return Ok(connection);
    }

    let data = &reference.data;
    let mut endpoints = if data.is_indirect() {
        match communicator.locator_info() {
            Some(locator) => locator.resolve(data).await?,
            None => Vec::new(),
        }
    } else {
        data.endpoints.clone()
    };

    let transports = communicator.transports();
    endpoints.retain(|endpoint| {
        transports.supports(endpoint)
            && endpoint.is_datagram() == data.mode.is_datagram()
            && (!data.secure || endpoint.is_secure())
    });
    if endpoints.is_empty() {
        return Err(Error::NoEndpoint {
            proxy: data.to_string(),
        });
    }
    if data.endpoint_selection == EndpointSelection::Random {
        endpoints.shuffle(&mut rand::thread_rng());
    }

    let connection = communicator
        .get_connection(&endpoints, &data.connection_id)
        .await?;
    reference.set_cached_connection(&connection);
    Ok(connection)
}
