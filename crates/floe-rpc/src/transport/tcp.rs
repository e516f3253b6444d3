//! TCP transport.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{Acceptor, Channel, StreamSink, StreamSource, Transport, TransportConfig};
use crate::endpoint::{Endpoint, IpEndpoint, TransportKind};
use crate::error::{Error, Result};
use crate::info::{IpInfo, LayerInfo};

/// TCP transport: creates connections and listeners.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

/// Connects to `endpoint`, through the configured network proxy if any,
/// and returns the stream with the layers below the caller's own.
pub(crate) async fn connect_stream(
    endpoint: &IpEndpoint,
    config: &TransportConfig,
) -> Result<(TcpStream, Vec<LayerInfo>)> {
    let Some(proxy) = &config.network_proxy else {
        let stream = connect_direct(endpoint, config).await?;
        let layer = tcp_layer(&stream);
        return Ok((stream, vec![layer]));
    };
    let mut stream = connect_direct(&proxy.endpoint(endpoint), config).await?;
    let handshake = proxy.handshake(&mut stream, endpoint);
    match config.connect_timeout_for(endpoint) {
        Some(timeout) => tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| Error::ConnectTimeout {
                endpoint: endpoint_string(endpoint),
                timeout_ms: timeout.as_millis() as u64,
            })??,
        None => handshake.await?,
    }
    tracing::debug!(endpoint = %endpoint_string(endpoint), proxy = %proxy, "tunnel established");
    let layers = vec![tcp_layer(&stream), proxy.layer(endpoint)];
    Ok((stream, layers))
}

/// Resolves and connects, trying each resolved address in turn.
async fn connect_direct(endpoint: &IpEndpoint, config: &TransportConfig) -> Result<TcpStream> {
    let addr = endpoint.socket_address();
    let connect = async {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr)
            .await
            .map_err(|_| Error::DnsFailure {
                host: endpoint.host.clone(),
            })?
            .collect();
        let mut last_error = Error::DnsFailure {
            host: endpoint.host.clone(),
        };
        for candidate in addrs {
            match TcpStream::connect(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    last_error = Error::ConnectionRefused {
                        endpoint: endpoint_string(endpoint),
                    };
                }
                Err(e) => last_error = Error::from(e),
            }
        }
        Err::<TcpStream, Error>(last_error)
    };
    let stream = match config.connect_timeout_for(endpoint) {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout {
                endpoint: endpoint_string(endpoint),
                timeout_ms: timeout.as_millis() as u64,
            })??,
        None => connect.await?,
    };
    if config.nodelay {
        stream.set_nodelay(true)?;
    }
    tracing::debug!(endpoint = %endpoint_string(endpoint), "TCP connected");
    Ok(stream)
}

fn endpoint_string(endpoint: &IpEndpoint) -> String {
    Endpoint::Ip(endpoint.clone()).to_string()
}

pub(crate) fn tcp_layer(stream: &TcpStream) -> LayerInfo {
    LayerInfo::Tcp(IpInfo::new(stream.local_addr().ok(), stream.peer_addr().ok()))
}

/// Binds a listener and returns it with the endpoint as bound.
pub(crate) async fn bind_listener(endpoint: &IpEndpoint) -> Result<(TcpListener, Endpoint)> {
    let listener = TcpListener::bind(endpoint.bind_address()).await?;
    let port = listener.local_addr()?.port();
    let mut bound = endpoint.clone();
    bound.port = port;
    if matches!(bound.host.as_str(), "*" | "0.0.0.0" | "::") {
        bound.host = String::new();
    }
    tracing::debug!(endpoint = %Endpoint::Ip(bound.clone()), "listening");
    Ok((listener, Endpoint::Ip(bound)))
}

fn stream_channel(stream: TcpStream, layers: Vec<LayerInfo>, config: &TransportConfig) -> Channel {
    let (read, write) = stream.into_split();
    Channel {
        source: Box::new(StreamSource::new(read, config.message_size_max)),
        sink: Box::new(StreamSink::new(write)),
        layers,
        datagram: false,
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect(&self, endpoint: &IpEndpoint) -> Result<Channel> {
        let (stream, layers) = connect_stream(endpoint, &self.config).await?;
        Ok(stream_channel(stream, layers, &self.config))
    }

    async fn listen(&self, endpoint: &IpEndpoint) -> Result<Box<dyn Acceptor>> {
        let (listener, bound) = bind_listener(endpoint).await?;
        Ok(Box::new(TcpAcceptor {
            listener,
            endpoint: bound,
            config: self.config.clone(),
        }))
    }
}

/// Accepts TCP connections on a bound listener.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    endpoint: Endpoint,
    config: TransportConfig,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Channel> {
        let (stream, peer) = self.listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(peer = %peer, "TCP accepted");
        let layers = vec![tcp_layer(&stream)];
        Ok(stream_channel(stream, layers, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::validate_connection_message;
    use crate::transport::NetworkProxy;

    #[tokio::test]
    async fn test_send_recv_frame() {
        let transport = TcpTransport::new(TransportConfig::default());
        let acceptor = transport
            .listen(&IpEndpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let endpoint = acceptor.endpoint();
        assert_ne!(endpoint.as_ip().unwrap().port, 0);

        let server = tokio::spawn(async move {
            let mut channel = acceptor.accept().await.unwrap();
            let frame = channel.source.read_frame().await.unwrap().unwrap();
            channel.sink.write_frame(frame).await.unwrap();
        });

        let mut channel = transport.connect(endpoint.as_ip().unwrap()).await.unwrap();
        assert!(matches!(channel.layers[0], LayerInfo::Tcp(_)));
        channel.sink.write_frame(validate_connection_message()).await.unwrap();
        let echoed = channel.source.read_frame().await.unwrap().unwrap();
        assert_eq!(echoed, validate_connection_message());

        server.await.unwrap();
    }

    /// Minimal SOCKS4 relay: grants every request and forwards bytes.
    async fn socks_relay() -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 9];
            client.read_exact(&mut request).await.unwrap();
            let port = u16::from_be_bytes([request[2], request[3]]);
            let ip = std::net::Ipv4Addr::new(request[4], request[5], request[6], request[7]);
            let mut server = TcpStream::connect((ip, port)).await.unwrap();
            client.write_all(&[0, 0x5a, 0, 0, 0, 0, 0, 0]).await.unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
        });
        port
    }

    #[tokio::test]
    async fn test_connect_through_socks_proxy() {
        let proxy_port = socks_relay().await;
        let config = TransportConfig {
            network_proxy: Some(NetworkProxy::Socks {
                host: "127.0.0.1".into(),
                port: proxy_port,
            }),
            ..TransportConfig::default()
        };
        let transport = TcpTransport::new(config);
        let acceptor = transport
            .listen(&IpEndpoint::tcp("127.0.0.1", 0))
            .await
            .unwrap();
        let endpoint = acceptor.endpoint().as_ip().unwrap().clone();

        let server = tokio::spawn(async move {
            let mut channel = acceptor.accept().await.unwrap();
            channel.sink.write_frame(validate_connection_message()).await.unwrap();
        });

        let mut channel = transport.connect(&endpoint).await.unwrap();
        match &channel.layers[..] {
            [LayerInfo::Tcp(ip), LayerInfo::NetworkProxy { protocol, target_port, .. }] => {
                assert_eq!(ip.remote_port, proxy_port);
                assert_eq!(protocol, "socks");
                assert_eq!(*target_port, endpoint.port);
            }
            other => panic!("unexpected layers {other:?}"),
        }
        let frame = channel.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, validate_connection_message());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(TransportConfig {
            network_proxy: Some(NetworkProxy::Http {
                host: "127.0.0.1".into(),
                port,
            }),
            ..TransportConfig::default()
        });
        let err = transport
            .connect(&IpEndpoint::tcp("127.0.0.1", 4061))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(TransportConfig::default());
        let err = transport
            .connect(&IpEndpoint::tcp("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_dns_failure() {
        let transport = TcpTransport::new(TransportConfig::default());
        let err = transport
            .connect(&IpEndpoint::tcp("no-such-host.invalid", 1))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::DnsFailure { .. } | Error::ConnectTimeout { .. }),
            "{err:?}"
        );
    }
}
