//! Pluggable transports.
//!
//! A [`Transport`] turns an [`IpEndpoint`] into a [`Channel`]: a source of
//! complete protocol messages, a sink for them, and the layer list describing
//! how the bytes travel. Stream transports (tcp, ssl) frame messages by the
//! size field of the message header; WebSocket carries one message per binary
//! frame; UDP carries one message per datagram.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::{Endpoint, IpEndpoint, TransportKind};
use crate::error::{Error, Result};
use crate::info::LayerInfo;
use crate::protocol::{MessageHeader, DEFAULT_MESSAGE_SIZE_MAX, HEADER_SIZE};

pub mod netproxy;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

pub use netproxy::NetworkProxy;
pub use tcp::TcpTransport;
pub use tls::{SslTransport, TlsConfig};
pub use udp::UdpTransport;
pub use ws::WsTransport;

/// WebSocket subprotocol negotiated by the ws and wss transports.
pub const WS_PROTOCOL: &str = "ice.zeroc.com";

/// Reading half of a channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Next complete message, header included. `None` on orderly end of
    /// stream.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;
}

/// Writing half of a channel.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one complete message.
    async fn write_frame(&mut self, frame: Bytes) -> Result<()>;

    /// Shuts down the write direction.
    async fn shutdown(&mut self) -> Result<()>;
}

/// An established, not yet validated, transport connection.
pub struct Channel {
    /// Inbound frames.
    pub source: Box<dyn FrameSource>,
    /// Outbound frames.
    pub sink: Box<dyn FrameSink>,
    /// Layers innermost first.
    pub layers: Vec<LayerInfo>,
    /// Message-oriented and unreliable; no validation, oneway only.
    pub datagram: bool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("layers", &self.layers)
            .field("datagram", &self.datagram)
            .finish()
    }
}

/// Settings shared by the built-in transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Overrides the endpoint timeout for connection establishment.
    pub connect_timeout: Option<Duration>,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Largest message accepted from a peer.
    pub message_size_max: usize,
    /// Tunnel outgoing stream connections through this proxy.
    pub network_proxy: Option<NetworkProxy>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            nodelay: true,
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
            network_proxy: None,
        }
    }
}

impl TransportConfig {
    /// Connect timeout for `endpoint`: the override, else the endpoint's own.
    pub fn connect_timeout_for(&self, endpoint: &IpEndpoint) -> Option<Duration> {
        self.connect_timeout.or_else(|| {
            u64::try_from(endpoint.timeout_ms)
                .ok()
                .map(Duration::from_millis)
        })
    }
}

/// Creates outgoing channels and listening acceptors for one transport kind.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The endpoint kind this transport serves.
    fn kind(&self) -> TransportKind;

    /// Opens a channel to `endpoint`.
    async fn connect(&self, endpoint: &IpEndpoint) -> Result<Channel>;

    /// Binds `endpoint` for incoming channels.
    async fn listen(&self, endpoint: &IpEndpoint) -> Result<Box<dyn Acceptor>>;
}

/// A bound listening endpoint.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// The endpoint as bound, with the OS-assigned port filled in.
    fn endpoint(&self) -> Endpoint;

    /// Waits for the next incoming channel.
    async fn accept(&self) -> Result<Channel>;
}

/// Transports by kind.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// A registry with the built-in transports.
    pub fn new() -> Self {
        Self::default()
    }

    /// tcp, udp and ws always; ssl and wss when `tls` is given.
    pub fn with_defaults(config: TransportConfig, tls: Option<TlsConfig>) -> Result<Self> {
        let mut registry = TransportRegistry::new();
        registry.register(Arc::new(TcpTransport::new(config.clone())));
        registry.register(Arc::new(UdpTransport::new(config.clone())));
        registry.register(Arc::new(WsTransport::new(config.clone(), None)?));
        if let Some(tls) = tls {
            registry.register(Arc::new(SslTransport::new(config.clone(), tls.clone())?));
            registry.register(Arc::new(WsTransport::new(config, Some(tls))?));
        }
        Ok(registry)
    }

    /// Adds or replaces the transport for its kind.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.kind(), transport);
    }

    /// The transport registered for `kind`.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports.get(&kind).cloned()
    }

    /// Whether `endpoint` can be used by this process.
    pub fn supports(&self, endpoint: &Endpoint) -> bool {
        endpoint
            .transport()
            .map(|kind| self.transports.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Opens a channel to `endpoint` with its transport.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Channel> {
        let ip = endpoint.as_ip().ok_or_else(|| Error::NoEndpoint {
            proxy: endpoint.to_string(),
        })?;
        let transport = self.get(ip.transport).ok_or_else(|| Error::FeatureNotSupported {
            feature: format!("transport `{}`", ip.transport.name()),
        })?;
        transport.connect(ip).await
    }

    /// Binds `endpoint` with its transport.
    pub async fn listen(&self, endpoint: &Endpoint) -> Result<Box<dyn Acceptor>> {
        let ip = endpoint.as_ip().ok_or_else(|| Error::EndpointParse {
            input: endpoint.to_string(),
            reason: "cannot listen on an opaque endpoint".to_string(),
        })?;
        let transport = self.get(ip.transport).ok_or_else(|| Error::FeatureNotSupported {
            feature: format!("transport `{}`", ip.transport.name()),
        })?;
        transport.listen(ip).await
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.transports.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("TransportRegistry")
            .field("transports", &kinds)
            .finish()
    }
}

/// Checks a message that arrived as one unit (WebSocket frame, datagram).
pub(crate) fn check_whole_message(data: &[u8], max: usize) -> Result<()> {
    let header: &[u8; HEADER_SIZE] = data
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| Error::protocol(format!("message of {} bytes is truncated", data.len())))?;
    let header = MessageHeader::decode(header, max)?;
    if header.size != data.len() {
        return Err(Error::protocol(format!(
            "message announces {} bytes but carries {}",
            header.size,
            data.len()
        )));
    }
    Ok(())
}

/// Frames messages off a byte stream using the header size field.
pub(crate) struct StreamSource<R> {
    reader: R,
    message_size_max: usize,
}

impl<R> StreamSource<R> {
    pub(crate) fn new(reader: R, message_size_max: usize) -> Self {
        Self {
            reader,
            message_size_max,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for StreamSource<R> {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::ConnectionLost {
                    reason: "end of stream inside a message header".to_string(),
                });
            }
            filled += n;
        }
        let decoded = MessageHeader::decode(&header, self.message_size_max)?;
        let mut message = BytesMut::zeroed(decoded.size);
        message[..HEADER_SIZE].copy_from_slice(&header);
        if decoded.size > HEADER_SIZE {
            self.reader.read_exact(&mut message[HEADER_SIZE..]).await?;
        }
        Ok(Some(message.freeze()))
    }
}

/// Writes whole messages to a byte stream.
pub(crate) struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for StreamSink<W> {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
