//! Connections: one validated transport channel plus its request state.
//!
//! A connection owns the writing half of a [`Channel`] behind an async mutex
//! so whole messages never interleave, a [`PendingTable`] routing replies to
//! waiting callers, a batch queue, and an optional object adapter for
//! requests arriving on it. A reader task decodes incoming messages; an ACM
//! task (when configured) writes heartbeats and detects dead peers.
//!
//! Lifecycle: `Validating -> Active -> Closing -> Closed`. The first error
//! that closes the connection is kept, delivered to every pending caller,
//! and returned by every later send. A closed connection is never reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::acm::{AcmAction, AcmConfig, Activity};
use crate::adapter::ObjectAdapter;
use crate::batch::{Batch, BatchInterceptor, BatchRequestQueue};
use crate::communicator::WeakCommunicator;
use crate::config::CommunicatorConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::info::ConnectionInfo;
use crate::metrics::Metrics;
use crate::outgoing::{PendingTable, ResponseHandle};
use crate::protocol::{
    body_reader, close_connection_message, validate_connection_message, MessageHeader,
    MessageType, Reply, ReplyBody, Request, HEADER_SIZE, REQUEST_ID_OFFSET,
};
use crate::proxy::ObjectPrx;
use crate::transport::{Channel, FrameSink, FrameSource};

/// Upper bound on flushing and shutting down the sink when closing.
const SINK_SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// How [`Connection::close`] treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Fail pending requests and drop the transport immediately.
    Forcefully,
    /// Wait for replies and dispatches, tell the peer, then close.
    Gracefully,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Exchanging the validation message.
    Validating,
    /// Sending and receiving requests.
    Active,
    /// Graceful close in progress; new requests are refused and incoming
    /// ones ignored.
    Closing,
    /// Closed; see [`Connection::close_error`].
    Closed,
}

/// Per-connection settings derived from the communicator configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest accepted frame, in bytes.
    pub message_size_max: usize,
    /// Heartbeat and idle-close settings.
    pub acm: AcmConfig,
    /// Bound on the validation handshake.
    pub connect_timeout: Option<Duration>,
    /// Bound on the wait for outstanding work in a graceful close.
    pub close_timeout: Duration,
    /// Queued batch size that triggers a flush, in bytes.
    pub batch_auto_flush_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_communicator(&CommunicatorConfig::default())
    }
}

impl ConnectionConfig {
    /// The connection settings of a communicator configuration.
    pub fn from_communicator(config: &CommunicatorConfig) -> Self {
        Self {
            message_size_max: config.message_size_max,
            acm: config.acm.clone(),
            connect_timeout: config.connect_timeout,
            close_timeout: config.close_timeout,
            batch_auto_flush_size: config.batch_auto_flush_size,
        }
    }
}

/// Everything a connection needs besides its channel.
pub(crate) struct ConnectionOptions {
    /// Accepted rather than connected.
    pub incoming: bool,
    /// Remote endpoint for outgoing connections, listening endpoint for
    /// incoming ones.
    pub endpoint: Endpoint,
    /// Connection id of the proxies sharing the connection.
    pub connection_id: String,
    /// Adapter dispatching requests that arrive on the connection.
    pub adapter: Option<ObjectAdapter>,
    /// Limits and timeouts.
    pub config: ConnectionConfig,
    /// Counters updated by the connection.
    pub metrics: Arc<Metrics>,
    /// Owning communicator, for proxies created from the connection.
    pub communicator: WeakCommunicator,
    /// Interceptor for the connection batch queue.
    pub batch_interceptor: Option<BatchInterceptor>,
}

/// A validated connection to a peer.
pub struct Connection {
    serial: u64,
    endpoint: Endpoint,
    datagram: bool,
    info: ConnectionInfo,
    sink: AsyncMutex<Box<dyn FrameSink>>,
    pending: Arc<PendingTable>,
    batch: BatchRequestQueue,
    adapter: RwLock<Option<ObjectAdapter>>,
    state: watch::Sender<ConnectionState>,
    close_error: Mutex<Option<Error>>,
    activity: Activity,
    dispatch_count: AtomicUsize,
    dispatch_idle: Notify,
    config: ConnectionConfig,
    metrics: Arc<Metrics>,
    communicator: WeakCommunicator,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("endpoint", &self.endpoint.to_string())
            .field("incoming", &self.info.incoming)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn parse_header(frame: &[u8], max: usize) -> Result<MessageHeader> {
    let header: &[u8; HEADER_SIZE] = frame
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| Error::protocol("message shorter than its header"))?;
    MessageHeader::decode(header, max)
}

impl Connection {
    /// Client side: waits for the server's validate-connection message.
    pub(crate) async fn connect(mut channel: Channel, options: ConnectionOptions) -> Result<Arc<Self>> {
        if !channel.datagram {
            let read = channel.source.read_frame();
            let frame = match options.config.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, read).await.map_err(|_| {
                    Error::ConnectTimeout {
                        endpoint: options.endpoint.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }
                })??,
                None => read.await?,
            };
            let frame = frame.ok_or_else(|| Error::ConnectionLost {
                reason: "closed by peer before validation".to_string(),
            })?;
            let header = parse_header(&frame, options.config.message_size_max)?;
            if header.message_type != MessageType::ValidateConnection {
                return Err(Error::protocol(format!(
                    "expected a validate connection message, got {:?}",
                    header.message_type
                )));
            }
        }
        Ok(Self::start(channel, options))
    }

    /// Server side: sends the validate-connection message.
    pub(crate) async fn accept(mut channel: Channel, options: ConnectionOptions) -> Result<Arc<Self>> {
        if !channel.datagram {
            let write = channel.sink.write_frame(validate_connection_message());
            match options.config.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, write).await.map_err(|_| {
                    Error::ConnectTimeout {
                        endpoint: options.endpoint.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }
                })??,
                None => write.await?,
            }
        }
        Ok(Self::start(channel, options))
    }

    fn start(channel: Channel, options: ConnectionOptions) -> Arc<Self> {
        let Channel {
            source,
            sink,
            layers,
            datagram,
        } = channel;
        let adapter_name = options
            .adapter
            .as_ref()
            .map(|a| a.name().to_string())
            .unwrap_or_default();
        let info = ConnectionInfo::new(
            options.incoming,
            adapter_name,
            options.connection_id,
            layers.into(),
        );
        let (state, _) = watch::channel(ConnectionState::Validating);
        let connection = Arc::new(Connection {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            endpoint: options.endpoint,
            datagram,
            info,
            sink: AsyncMutex::new(sink),
            pending: Arc::new(PendingTable::new()),
            batch: BatchRequestQueue::new(
                options.config.batch_auto_flush_size,
                options.batch_interceptor,
            ),
            adapter: RwLock::new(options.adapter),
            state,
            close_error: Mutex::new(None),
            activity: Activity::new(),
            dispatch_count: AtomicUsize::new(0),
            dispatch_idle: Notify::new(),
            config: options.config,
            metrics: options.metrics,
            communicator: options.communicator,
        });
        connection.metrics.connection_opened();
        connection.state.send_replace(ConnectionState::Active);
        tokio::spawn(connection.clone().read_loop(source));
        if !datagram {
            if let Some(interval) = connection.config.acm.interval() {
                tokio::spawn(monitor(
                    Arc::downgrade(&connection),
                    connection.config.acm.clone(),
                    interval,
                ));
            }
        }
        info!(
            connection = connection.serial,
            endpoint = %connection.endpoint,
            incoming = connection.info.incoming,
            "connection established"
        );
        connection
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether new requests can be sent. A closing connection is not.
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Whether the connection has finished closing.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// The error that closed the connection, once closed.
    pub fn close_error(&self) -> Option<Error> {
        self.close_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The endpoint connected to, or the listening endpoint for incoming connections.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The connection id the connection was opened for.
    pub fn connection_id(&self) -> &str {
        &self.info.connection_id
    }

    /// Whether the peer connected to us.
    pub fn is_incoming(&self) -> bool {
        self.info.incoming
    }

    /// Whether the connection runs over udp.
    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    /// Snapshot of the connection's layers, outermost first.
    pub fn info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    /// Number of twoway requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// The adapter serving requests from the peer.
    pub fn adapter(&self) -> Option<ObjectAdapter> {
        self.adapter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attaches an adapter that serves requests arriving on this connection
    /// (bidirectional use), or detaches it.
    pub fn set_adapter(&self, adapter: Option<ObjectAdapter>) {
        *self.adapter.write().unwrap_or_else(PoisonError::into_inner) = adapter;
    }

    /// A proxy bound to this connection.
    pub fn create_proxy(self: &Arc<Self>, identity: Identity) -> Result<ObjectPrx> {
        let communicator = self
            .communicator
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        Ok(ObjectPrx::fixed(&communicator, identity, self.clone()))
    }

    pub(crate) fn batch_queue(&self) -> &BatchRequestQueue {
        &self.batch
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(error) = self.close_error() {
            return Err(error);
        }
        match self.state() {
            ConnectionState::Active => Ok(()),
            _ => Err(Error::ConnectionClosed {
                reason: "connection is closing".to_string(),
            }),
        }
    }

    /// Writes one message under the sink lock. A failed write closes the
    /// connection (datagram sends only fail themselves).
    async fn write(&self, frame: Bytes) -> Result<()> {
        let len = frame.len();
        let mut sink = self.sink.lock().await;
        if let Some(error) = self.close_error() {
            return Err(error);
        }
        let result = sink.write_frame(frame).await;
        drop(sink);
        match result {
            Ok(()) => {
                self.activity.mark_write();
                self.metrics.add_bytes_sent(len as u64);
                Ok(())
            }
            Err(error) => {
                if !self.datagram {
                    self.terminate(error.clone()).await;
                }
                Err(error)
            }
        }
    }

    /// Sends a complete request message. For twoway requests an id is
    /// allocated before the write and patched into the message; the returned
    /// handle resolves exactly once. Oneway requests return `None` once
    /// written. An error means the request was not sent.
    pub async fn send_request(&self, message: Bytes, twoway: bool) -> Result<Option<ResponseHandle>> {
        self.check_usable()?;
        if !twoway {
            self.write(message).await?;
            self.metrics.inc_requests_sent();
            return Ok(None);
        }
        if self.datagram {
            return Err(Error::TwowayOnly {
                operation: "twoway request over a datagram connection".to_string(),
            });
        }
        if message.len() < REQUEST_ID_OFFSET + 4 {
            return Err(Error::protocol("request message too short"));
        }
        let handle = self.pending.register()?;
        let mut frame = BytesMut::from(&message[..]);
        frame[REQUEST_ID_OFFSET..REQUEST_ID_OFFSET + 4].copy_from_slice(&handle.id().to_le_bytes());
        self.write(frame.freeze()).await?;
        self.metrics.inc_requests_sent();
        trace!(connection = self.serial, request_id = handle.id(), "request sent");
        Ok(Some(handle))
    }

    /// Writes a batch taken from a batch queue.
    pub(crate) async fn send_batch(&self, batch: Batch) -> Result<()> {
        self.check_usable()?;
        self.write(batch.to_message()?).await?;
        self.metrics.inc_batches_flushed();
        debug!(connection = self.serial, count = batch.count, "batch flushed");
        Ok(())
    }

    /// Sends the requests queued on this connection as one batch message.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        match self.batch.swap() {
            Some(batch) => self.send_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Writes a validate-connection message. Datagram connections have no
    /// heartbeats.
    pub async fn heartbeat(&self) -> Result<()> {
        if self.datagram {
            return Ok(());
        }
        self.check_usable()?;
        self.write(validate_connection_message()).await?;
        self.metrics.inc_heartbeats_sent();
        trace!(connection = self.serial, "heartbeat sent");
        Ok(())
    }

    /// Closes the connection. Pending callers see `ConnectionClosed`.
    pub async fn close(&self, mode: CloseMode) {
        match mode {
            CloseMode::Forcefully => {
                self.terminate(Error::ConnectionClosed {
                    reason: "closed forcefully".to_string(),
                })
                .await
            }
            CloseMode::Gracefully => {
                let began = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Active {
                        *state = ConnectionState::Closing;
                        true
                    } else {
                        false
                    }
                });
                if !began {
                    self.wait_closed().await;
                    return;
                }
                let drained = async {
                    self.pending.wait_empty().await;
                    self.wait_dispatches().await;
                };
                if tokio::time::timeout(self.config.close_timeout, drained)
                    .await
                    .is_err()
                {
                    // A close-connection message would let the peer retry
                    // requests that are still being dispatched here.
                    debug!(connection = self.serial, "graceful close did not drain in time, closing forcefully");
                    self.terminate(Error::ConnectionClosed {
                        reason: "graceful close timed out".to_string(),
                    })
                    .await;
                    return;
                }
                if !self.datagram {
                    let _ = self.write(close_connection_message()).await;
                }
                self.terminate(Error::ConnectionClosed {
                    reason: "closed gracefully".to_string(),
                })
                .await;
            }
        }
    }

    /// Resolves once the connection is closed.
    pub async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    async fn wait_dispatches(&self) {
        loop {
            let notified = self.dispatch_idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.dispatch_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Closes with `error`; only the first call has an effect.
    pub(crate) async fn terminate(&self, error: Error) {
        {
            let mut slot = self.close_error.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(error.clone());
        }
        self.state.send_replace(ConnectionState::Closed);
        self.pending.fail_all(error.clone());
        if let Some(dropped) = self.batch.swap() {
            debug!(connection = self.serial, count = dropped.count, "discarding queued batch requests");
        }
        match &error {
            Error::ConnectionClosed { .. } | Error::CommunicatorDestroyed => {
                info!(connection = self.serial, endpoint = %self.endpoint, "connection closed")
            }
            e if e.closes_connection() => {
                warn!(connection = self.serial, endpoint = %self.endpoint, error = %e, "connection closed")
            }
            e => debug!(connection = self.serial, endpoint = %self.endpoint, error = %e, "connection closed"),
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.shutdown().await;
        };
        let _ = tokio::time::timeout(SINK_SHUTDOWN_WAIT, shutdown).await;
        self.metrics.connection_closed();
    }

    async fn read_loop(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        let mut state = self.state.subscribe();
        loop {
            let frame = tokio::select! {
                frame = source.read_frame() => frame,
                _ = state.wait_for(|s| *s == ConnectionState::Closed) => return,
            };
            let result = match frame {
                Ok(Some(frame)) => {
                    self.activity.mark_read();
                    self.metrics.add_bytes_received(frame.len() as u64);
                    self.handle_frame(frame)
                }
                Ok(None) => Err(Error::ConnectionLost {
                    reason: "end of stream".to_string(),
                }),
                Err(e) => Err(e),
            };
            if let Err(error) = result {
                if self.datagram && error.closes_connection() {
                    warn!(connection = self.serial, error = %error, "discarding datagram");
                    continue;
                }
                self.terminate(error).await;
                return;
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Bytes) -> Result<()> {
        let header = parse_header(&frame, self.config.message_size_max)?;
        if matches!(header.message_type, MessageType::Request | MessageType::BatchRequest)
            && self.state() != ConnectionState::Active
        {
            debug!(connection = self.serial, "ignoring request received while closing");
            return Ok(());
        }
        let mut input = body_reader(frame);
        match header.message_type {
            MessageType::Request => {
                let request = Request::decode_body(&mut input, true)?;
                trace!(
                    connection = self.serial,
                    request_id = request.header.request_id,
                    operation = %request.header.operation,
                    "request received"
                );
                self.spawn_dispatch(vec![request]);
            }
            MessageType::BatchRequest => {
                let count = input.read_int()?;
                if count < 0 {
                    return Err(Error::marshal(format!("negative batch request count {count}")));
                }
                let mut requests = Vec::with_capacity((count as usize).min(1024));
                for _ in 0..count {
                    requests.push(Request::decode_body(&mut input, false)?);
                }
                if !requests.is_empty() {
                    self.spawn_dispatch(requests);
                }
            }
            MessageType::Reply => {
                let reply = Reply::decode_body(&mut input)?;
                self.metrics.inc_replies_received();
                let request_id = reply.request_id;
                if !self.pending.complete(reply) {
                    debug!(connection = self.serial, request_id, "discarding reply to unknown request");
                }
            }
            MessageType::ValidateConnection => {
                trace!(connection = self.serial, "heartbeat received");
            }
            MessageType::CloseConnection => {
                if !self.datagram {
                    return Err(Error::ConnectionClosedByPeer);
                }
            }
        }
        Ok(())
    }

    /// Dispatches `requests` in order on one task.
    fn spawn_dispatch(self: &Arc<Self>, requests: Vec<Request>) {
        self.dispatch_count.fetch_add(1, Ordering::SeqCst);
        let connection = self.clone();
        tokio::spawn(async move {
            for request in requests {
                connection.dispatch(request).await;
            }
            if connection.dispatch_count.fetch_sub(1, Ordering::SeqCst) == 1 {
                connection.dispatch_idle.notify_waiters();
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, request: Request) {
        self.metrics.add_requests_dispatched(1);
        let request_id = request.header.request_id;
        let body = match self.adapter() {
            Some(adapter) => match adapter.dispatch(request, Some(self.clone())).await {
                Some(body) => body,
                // The peer retries once this connection closes.
                None => return,
            },
            None => ReplyBody::ObjectNotExist {
                identity: request.header.identity,
                facet: request.header.facet,
                operation: request.header.operation,
            },
        };
        if request_id == 0 || self.datagram {
            return;
        }
        let reply = Reply { request_id, body };
        match reply.to_message() {
            Ok(message) => {
                if let Err(e) = self.write(message).await {
                    debug!(connection = self.serial, request_id, error = %e, "reply not sent");
                }
            }
            Err(e) => warn!(connection = self.serial, request_id, error = %e, "cannot encode reply"),
        }
    }

    fn is_busy(&self) -> bool {
        !self.pending.is_empty() || self.dispatch_count.load(Ordering::SeqCst) > 0
    }
}

/// ACM task: runs until the connection closes or is dropped.
async fn monitor(connection: Weak<Connection>, acm: AcmConfig, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if connection.state() != ConnectionState::Active {
            return;
        }
        match acm.evaluate(&connection.activity, connection.is_busy()) {
            AcmAction::None => {}
            AcmAction::Heartbeat => {
                if let Err(e) = connection.heartbeat().await {
                    debug!(connection = connection.serial, error = %e, "heartbeat failed");
                }
            }
            AcmAction::TimedOut => {
                connection.terminate(Error::ConnectionTimeout).await;
                return;
            }
            AcmAction::CloseIdle => {
                debug!(connection = connection.serial, "closing idle connection");
                connection.close(CloseMode::Gracefully).await;
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::acm::{ClosePolicy, HeartbeatPolicy};
    use crate::codec::{Context, Encapsulation};
    use crate::protocol::{OperationMode, RequestHeader, DEFAULT_MESSAGE_SIZE_MAX};
    use crate::transport::{StreamSink, StreamSource};
    use crate::version::ENCODING_1_1;

    /// Two connected in-memory channels.
    pub(crate) fn channel_pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let make = |stream: tokio::io::DuplexStream| {
            let (read, write) = tokio::io::split(stream);
            Channel {
                source: Box::new(StreamSource::new(read, DEFAULT_MESSAGE_SIZE_MAX)),
                sink: Box::new(StreamSink::new(write)),
                layers: Vec::new(),
                datagram: false,
            }
        };
        (make(a), make(b))
    }

    pub(crate) fn options(incoming: bool, acm: AcmConfig) -> ConnectionOptions {
        ConnectionOptions {
            incoming,
            endpoint: Endpoint::tcp("127.0.0.1", 4061),
            connection_id: String::new(),
            adapter: None,
            config: ConnectionConfig {
                acm,
                connect_timeout: Some(Duration::from_secs(5)),
                ..ConnectionConfig::default()
            },
            metrics: Arc::new(Metrics::new()),
            communicator: WeakCommunicator::default(),
            batch_interceptor: None,
        }
    }

    fn request(operation: &str) -> Request {
        Request {
            header: RequestHeader {
                request_id: 1,
                identity: Identity::new("initial"),
                facet: String::new(),
                operation: operation.to_string(),
                mode: OperationMode::Normal,
                context: Context::new(),
            },
            params: Encapsulation::empty(ENCODING_1_1),
        }
    }

    async fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (client, server) = channel_pair();
        let accept = tokio::spawn(Connection::accept(server, options(true, AcmConfig::disabled())));
        let client = Connection::connect(client, options(false, AcmConfig::disabled()))
            .await
            .unwrap();
        let server = accept.await.unwrap().unwrap();
        (client, server)
    }

    /// A client connection whose peer is driven by hand.
    async fn client_with_raw_peer(acm: AcmConfig) -> (Arc<Connection>, Channel) {
        let (client, mut raw) = channel_pair();
        raw.sink.write_frame(validate_connection_message()).await.unwrap();
        let client = Connection::connect(client, options(false, acm)).await.unwrap();
        (client, raw)
    }

    async fn read_request(raw: &mut Channel) -> Request {
        let frame = raw.source.read_frame().await.unwrap().unwrap();
        let mut input = body_reader(frame);
        Request::decode_body(&mut input, true).unwrap()
    }

    #[tokio::test]
    async fn test_validation_handshake() {
        let (client, server) = pair().await;
        assert_eq!(client.state(), ConnectionState::Active);
        assert!(!client.is_incoming());
        assert!(server.is_incoming());
    }

    #[tokio::test]
    async fn test_connect_rejects_other_first_message() {
        let (client, mut raw) = channel_pair();
        raw.sink.write_frame(close_connection_message()).await.unwrap();
        let err = Connection::connect(client, options(false, AcmConfig::disabled()))
            .await
            .unwrap_err();
        assert!(err.closes_connection());
    }

    #[tokio::test]
    async fn test_no_adapter_replies_object_not_exist_and_stays_usable() {
        let (client, _server) = pair().await;
        for _ in 0..2 {
            let handle = client
                .send_request(request("ice_ping").to_message().unwrap(), true)
                .await
                .unwrap()
                .unwrap();
            let reply = handle.wait(Some(Duration::from_secs(5)), None).await.unwrap();
            assert!(matches!(reply.body, ReplyBody::ObjectNotExist { ref identity, .. } if identity.name == "initial"));
        }
        assert_eq!(client.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_request_ids_patched_and_unique() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let message = request("op").to_message().unwrap();
        let a = client.send_request(message.clone(), true).await.unwrap().unwrap();
        let b = client.send_request(message, true).await.unwrap().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(read_request(&mut raw).await.header.request_id, a.id());
        assert_eq!(read_request(&mut raw).await.header.request_id, b.id());
        assert_eq!(client.pending_requests(), 2);
    }

    #[tokio::test]
    async fn test_oneway_returns_no_handle() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let mut oneway = request("notify");
        oneway.header.request_id = 0;
        assert!(client
            .send_request(oneway.to_message().unwrap(), false)
            .await
            .unwrap()
            .is_none());
        assert_eq!(read_request(&mut raw).await.header.request_id, 0);
    }

    #[tokio::test]
    async fn test_unknown_reply_is_discarded() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let handle = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap()
            .unwrap();
        let id = read_request(&mut raw).await.header.request_id;
        for request_id in [id + 1000, id] {
            let reply = Reply {
                request_id,
                body: ReplyBody::Ok(Encapsulation::empty(ENCODING_1_1)),
            };
            raw.sink.write_frame(reply.to_message().unwrap()).await.unwrap();
        }
        let reply = handle.wait(None, None).await.unwrap();
        assert_eq!(reply.request_id, id);
        assert_eq!(client.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn test_forceful_close_fails_pending_once() {
        let (client, _raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let handle = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap()
            .unwrap();
        client.close(CloseMode::Forcefully).await;
        assert!(matches!(handle.wait(None, None).await, Err(Error::ConnectionClosed { .. })));
        assert!(client.is_closed());
        let err = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_marshal_error_closes_connection() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let handle = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap()
            .unwrap();
        // A reply header announcing a body that is too short for a reply.
        let bogus = crate::protocol::build_message(MessageType::Reply, |out| out.write_byte(1)).unwrap();
        raw.sink.write_frame(bogus).await.unwrap();
        let err = handle.wait(None, None).await.unwrap_err();
        assert!(err.closes_connection());
        client.wait_closed().await;
        assert!(client.close_error().unwrap().closes_connection());
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_closed_by_peer() {
        let (client, server) = pair().await;
        server.close(CloseMode::Gracefully).await;
        assert!(server.is_closed());
        client.wait_closed().await;
        assert!(matches!(client.close_error(), Some(Error::ConnectionClosedByPeer)));
    }

    #[tokio::test]
    async fn test_graceful_close_waits_for_reply() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let handle = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap()
            .unwrap();
        let c = client.clone();
        let closing = tokio::spawn(async move { c.close(CloseMode::Gracefully).await });
        let id = read_request(&mut raw).await.header.request_id;
        tokio::task::yield_now().await;
        assert_eq!(client.state(), ConnectionState::Closing);
        assert!(client
            .send_request(request("late").to_message().unwrap(), false)
            .await
            .is_err());
        let reply = Reply {
            request_id: id,
            body: ReplyBody::Ok(Encapsulation::empty(ENCODING_1_1)),
        };
        raw.sink.write_frame(reply.to_message().unwrap()).await.unwrap();
        assert!(handle.wait(None, None).await.is_ok());
        closing.await.unwrap();
        let frame = raw.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, close_connection_message());
    }

    #[tokio::test]
    async fn test_graceful_close_timeout_does_not_notify_peer() {
        let (client, mut raw) = channel_pair();
        raw.sink.write_frame(validate_connection_message()).await.unwrap();
        let mut opts = options(false, AcmConfig::disabled());
        opts.config.close_timeout = Duration::from_millis(50);
        let client = Connection::connect(client, opts).await.unwrap();
        let handle = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap()
            .unwrap();
        read_request(&mut raw).await;

        client.close(CloseMode::Gracefully).await;
        assert!(client.is_closed());
        assert!(matches!(handle.wait(None, None).await, Err(Error::ConnectionClosed { .. })));
        // End of stream, which the peer reports as a lost connection.
        assert!(raw.source.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requests_ignored_while_closing() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        let handle = client
            .send_request(request("op").to_message().unwrap(), true)
            .await
            .unwrap()
            .unwrap();
        let id = read_request(&mut raw).await.header.request_id;
        let c = client.clone();
        let closing = tokio::spawn(async move { c.close(CloseMode::Gracefully).await });
        tokio::task::yield_now().await;
        assert_eq!(client.state(), ConnectionState::Closing);

        let mut incoming = request("mutate");
        incoming.header.request_id = 77;
        raw.sink.write_frame(incoming.to_message().unwrap()).await.unwrap();
        let reply = Reply {
            request_id: id,
            body: ReplyBody::Ok(Encapsulation::empty(ENCODING_1_1)),
        };
        raw.sink.write_frame(reply.to_message().unwrap()).await.unwrap();
        assert!(handle.wait(None, None).await.is_ok());
        closing.await.unwrap();

        // No reply to request 77 precedes the close.
        let frame = raw.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, close_connection_message());
    }

    #[tokio::test]
    async fn test_batch_flush_is_one_message() {
        let (client, mut raw) = client_with_raw_peer(AcmConfig::disabled()).await;
        for op in ["a", "b", "c"] {
            assert!(client.batch_queue().enqueue(&request(op)).unwrap().is_none());
        }
        client.flush_batch_requests().await.unwrap();
        let frame = raw.source.read_frame().await.unwrap().unwrap();
        let header = parse_header(&frame, DEFAULT_MESSAGE_SIZE_MAX).unwrap();
        assert_eq!(header.message_type, MessageType::BatchRequest);
        let mut input = body_reader(frame);
        assert_eq!(input.read_int().unwrap(), 3);
        let first = Request::decode_body(&mut input, false).unwrap();
        assert_eq!(first.header.operation, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acm_heartbeats_and_timeout() {
        let acm = AcmConfig {
            timeout: Some(Duration::from_secs(2)),
            heartbeat: HeartbeatPolicy::Always,
            close: ClosePolicy::Off,
        };
        let (client, mut raw) = client_with_raw_peer(acm).await;
        let frame = raw.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, validate_connection_message());
        client.wait_closed().await;
        assert!(matches!(client.close_error(), Some(Error::ConnectionTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acm_closes_idle_connection() {
        let acm = AcmConfig {
            timeout: Some(Duration::from_secs(1)),
            heartbeat: HeartbeatPolicy::Off,
            close: ClosePolicy::OnIdle,
        };
        let (client, mut raw) = client_with_raw_peer(acm).await;
        client.wait_closed().await;
        assert!(matches!(client.close_error(), Some(Error::ConnectionClosed { .. })));
        let frame = raw.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, close_connection_message());
    }
}
