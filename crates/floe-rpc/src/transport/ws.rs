//! WebSocket transports (ws and wss).
//!
//! Each protocol message travels as one binary WebSocket message. Both sides
//! negotiate the `ice.zeroc.com` subprotocol; the handshake headers the peer
//! sent are kept in the connection's WebSocket layer.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::tcp::{bind_listener, connect_stream, tcp_layer};
use super::tls::{connect_tls, TlsAcceptor, TlsConfig, TlsConnector};
use super::{
    check_whole_message, Acceptor, Channel, FrameSink, FrameSource, Transport, TransportConfig,
    WS_PROTOCOL,
};
use crate::endpoint::{Endpoint, IpEndpoint, TransportKind};
use crate::error::{Error, Result};
use crate::info::LayerInfo;

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Io(io) => Error::from(io),
            WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ConnectionLost {
                reason: "websocket closed".to_string(),
            },
            WsError::Capacity(e) => Error::protocol(format!("websocket capacity: {e}")),
            WsError::Protocol(e) => Error::protocol(format!("websocket: {e}")),
            other => Error::ConnectionLost {
                reason: format!("websocket: {other}"),
            },
        }
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    message_size_max: usize,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Binary(data))) => {
                    check_whole_message(&data, self.message_size_max)?;
                    return Ok(Some(data));
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(Error::protocol("unexpected text websocket message"))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        self.sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

fn ws_channel<S>(
    ws: WebSocketStream<S>,
    mut layers: Vec<LayerInfo>,
    headers: HashMap<String, String>,
    config: &TransportConfig,
) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    layers.push(LayerInfo::WebSocket { headers });
    let (sink, stream) = ws.split();
    Channel {
        source: Box::new(WsSource {
            stream,
            message_size_max: config.message_size_max,
        }),
        sink: Box::new(WsSink { sink }),
        layers,
        datagram: false,
    }
}

/// Runs the client handshake over an established stream.
async fn client_handshake<S>(
    stream: S,
    endpoint: &IpEndpoint,
    secure: bool,
) -> Result<(WebSocketStream<S>, HashMap<String, String>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let scheme = if secure { "wss" } else { "ws" };
    let resource = if endpoint.resource.is_empty() {
        "/"
    } else {
        endpoint.resource.as_str()
    };
    let url = format!("{scheme}://{}{resource}", endpoint.socket_address());
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_PROTOCOL));
    let (ws, response) = tokio_tungstenite::client_async(request, stream).await?;
    Ok((ws, header_map(response.headers())))
}

/// Runs the server handshake, echoing our subprotocol when offered.
async fn server_handshake<S>(stream: S) -> Result<(WebSocketStream<S>, HashMap<String, String>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut headers = HashMap::new();
    let callback = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
        headers = header_map(request.headers());
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim() == WS_PROTOCOL))
            .unwrap_or(false);
        if offered {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(WS_PROTOCOL));
        }
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    Ok((ws, headers))
}

/// WebSocket over TCP, or over TLS for wss.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: TransportConfig,
    tls: Option<(TlsConfig, TlsConnector)>,
}

impl WsTransport {
    /// A ws transport, or wss when `tls` is given.
    pub fn new(config: TransportConfig, tls: Option<TlsConfig>) -> Result<Self> {
        let tls = match tls {
            Some(tls) => {
                let connector = TlsConnector::new(&tls)?;
                Some((tls, connector))
            }
            None => None,
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        if self.tls.is_some() {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        }
    }

    async fn connect(&self, endpoint: &IpEndpoint) -> Result<Channel> {
        let channel = match &self.tls {
            Some((_, connector)) => {
                let (stream, layers) = connect_tls(endpoint, &self.config, connector).await?;
                let (ws, headers) = client_handshake(stream, endpoint, true).await?;
                ws_channel(ws, layers, headers, &self.config)
            }
            None => {
                let (stream, layers) = connect_stream(endpoint, &self.config).await?;
                let (ws, headers) = client_handshake(stream, endpoint, false).await?;
                ws_channel(ws, layers, headers, &self.config)
            }
        };
        tracing::debug!(endpoint = %Endpoint::Ip(endpoint.clone()), "WebSocket connected");
        Ok(channel)
    }

    async fn listen(&self, endpoint: &IpEndpoint) -> Result<Box<dyn Acceptor>> {
        let acceptor = match &self.tls {
            Some((tls, _)) => Some(TlsAcceptor::new(tls)?),
            None => None,
        };
        let (listener, bound) = bind_listener(endpoint).await?;
        Ok(Box::new(WsAcceptor {
            listener,
            endpoint: bound,
            tls: acceptor,
            config: self.config.clone(),
        }))
    }
}

/// Accepts WebSocket connections.
#[derive(Debug)]
pub struct WsAcceptor {
    listener: TcpListener,
    endpoint: Endpoint,
    tls: Option<TlsAcceptor>,
    config: TransportConfig,
}

impl WsAcceptor {
    async fn upgrade(&self, stream: TcpStream) -> Result<Channel> {
        let tcp = tcp_layer(&stream);
        match &self.tls {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                let tls = tls_stream.layer_info();
                let (ws, headers) = server_handshake(tls_stream).await?;
                Ok(ws_channel(ws, vec![tcp, tls], headers, &self.config))
            }
            None => {
                let (ws, headers) = server_handshake(stream).await?;
                Ok(ws_channel(ws, vec![tcp], headers, &self.config))
            }
        }
    }
}

#[async_trait]
impl Acceptor for WsAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Channel> {
        let (stream, peer) = self.listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        let channel = self.upgrade(stream).await?;
        tracing::debug!(peer = %peer, "WebSocket accepted");
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::validate_connection_message;
    use crate::transport::tls::tests::test_configs;

    async fn roundtrip(server: WsTransport, client: WsTransport, kind: TransportKind) {
        let mut ep = IpEndpoint::tcp("127.0.0.1", 0);
        ep.transport = kind;
        ep.resource = "/floe".into();
        let acceptor = server.listen(&ep).await.unwrap();
        let mut endpoint = acceptor.endpoint().as_ip().unwrap().clone();
        endpoint.host = "localhost".into();

        let accept = tokio::spawn(async move {
            let mut channel = acceptor.accept().await.unwrap();
            match channel.layers.last() {
                Some(LayerInfo::WebSocket { headers }) => {
                    assert_eq!(
                        headers.get("sec-websocket-protocol").map(String::as_str),
                        Some(WS_PROTOCOL)
                    );
                }
                other => panic!("unexpected layer {other:?}"),
            }
            let frame = channel.source.read_frame().await.unwrap().unwrap();
            channel.sink.write_frame(frame).await.unwrap();
        });

        let mut channel = client.connect(&endpoint).await.unwrap();
        assert!(matches!(channel.layers.last(), Some(LayerInfo::WebSocket { .. })));
        channel.sink.write_frame(validate_connection_message()).await.unwrap();
        assert_eq!(
            channel.source.read_frame().await.unwrap().unwrap(),
            validate_connection_message()
        );
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_ws_roundtrip() {
        let server = WsTransport::new(TransportConfig::default(), None).unwrap();
        let client = WsTransport::new(TransportConfig::default(), None).unwrap();
        assert_eq!(server.kind(), TransportKind::Ws);
        roundtrip(server, client, TransportKind::Ws).await;
    }

    #[tokio::test]
    async fn test_wss_roundtrip_has_three_layers() {
        let (server_tls, client_tls) = test_configs(false);
        let server = WsTransport::new(TransportConfig::default(), Some(server_tls)).unwrap();
        let client = WsTransport::new(TransportConfig::default(), Some(client_tls)).unwrap();
        assert_eq!(client.kind(), TransportKind::Wss);
        roundtrip(server, client, TransportKind::Wss).await;
    }
}
