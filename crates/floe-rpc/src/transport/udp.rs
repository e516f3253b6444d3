//! UDP transport: one message per datagram.
//!
//! Datagram connections are never validated and only carry oneway and
//! batch-oneway requests. A listening endpoint yields a single incoming
//! channel that receives from every peer.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::{check_whole_message, Acceptor, Channel, FrameSink, FrameSource, Transport, TransportConfig};
use crate::endpoint::{Endpoint, IpEndpoint, TransportKind};
use crate::error::{Error, Result};
use crate::info::{IpInfo, LayerInfo};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// UDP transport.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    config: TransportConfig,
}

impl UdpTransport {
    /// A udp transport with `config`.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    fn max_message(&self) -> usize {
        self.config.message_size_max.min(MAX_DATAGRAM_SIZE)
    }
}

struct UdpSource {
    socket: Arc<UdpSocket>,
    message_size_max: usize,
}

#[async_trait]
impl FrameSource for UdpSource {
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            let mut buf = BytesMut::zeroed(MAX_DATAGRAM_SIZE);
            let (n, peer) = self.socket.recv_from(&mut buf).await?;
            buf.truncate(n);
            // A bad datagram only loses itself.
            match check_whole_message(&buf, self.message_size_max) {
                Ok(()) => return Ok(Some(buf.freeze())),
                Err(e) => tracing::warn!(peer = %peer, error = %e, "discarding datagram"),
            }
        }
    }
}

struct UdpSink {
    socket: Arc<UdpSocket>,
    connected: bool,
}

#[async_trait]
impl FrameSink for UdpSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        if !self.connected {
            return Err(Error::TwowayOnly {
                operation: "reply over an incoming datagram endpoint".to_string(),
            });
        }
        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge {
                size: frame.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        self.socket.send(&frame).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

fn udp_channel(socket: UdpSocket, connected: bool, message_size_max: usize) -> Channel {
    let layer = LayerInfo::Udp(IpInfo::new(
        socket.local_addr().ok(),
        socket.peer_addr().ok(),
    ));
    let socket = Arc::new(socket);
    Channel {
        source: Box::new(UdpSource {
            socket: socket.clone(),
            message_size_max,
        }),
        sink: Box::new(UdpSink { socket, connected }),
        layers: vec![layer],
        datagram: true,
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn connect(&self, endpoint: &IpEndpoint) -> Result<Channel> {
        let addr = endpoint.socket_address();
        let remote: SocketAddr = tokio::net::lookup_host(&addr)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::DnsFailure {
                host: endpoint.host.clone(),
            })?;
        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        tracing::debug!(endpoint = %Endpoint::Ip(endpoint.clone()), "UDP connected");
        Ok(udp_channel(socket, true, self.max_message()))
    }

    async fn listen(&self, endpoint: &IpEndpoint) -> Result<Box<dyn Acceptor>> {
        let socket = UdpSocket::bind(endpoint.bind_address()).await?;
        let mut bound = endpoint.clone();
        bound.port = socket.local_addr()?.port();
        if matches!(bound.host.as_str(), "*" | "0.0.0.0" | "::") {
            bound.host = String::new();
        }
        Ok(Box::new(UdpAcceptor {
            socket: Mutex::new(Some(socket)),
            endpoint: Endpoint::Ip(bound),
            message_size_max: self.max_message(),
        }))
    }
}

/// Hands out the bound socket once, then never completes.
#[derive(Debug)]
pub struct UdpAcceptor {
    socket: Mutex<Option<UdpSocket>>,
    endpoint: Endpoint,
    message_size_max: usize,
}

#[async_trait]
impl Acceptor for UdpAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Channel> {
        let socket = self.socket.lock().await.take();
        match socket {
            Some(socket) => Ok(udp_channel(socket, false, self.message_size_max)),
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::validate_connection_message;
    use std::time::Duration;

    #[tokio::test]
    async fn test_datagram_delivery() {
        let transport = UdpTransport::new(TransportConfig::default());
        let mut ep = IpEndpoint::tcp("127.0.0.1", 0);
        ep.transport = TransportKind::Udp;
        let acceptor = transport.listen(&ep).await.unwrap();
        let endpoint = acceptor.endpoint();
        let mut incoming = acceptor.accept().await.unwrap();
        assert!(incoming.datagram);

        let mut outgoing = transport.connect(endpoint.as_ip().unwrap()).await.unwrap();
        outgoing.sink.write_frame(validate_connection_message()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), incoming.source.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, validate_connection_message());

        assert!(incoming.sink.write_frame(validate_connection_message()).await.is_err());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), acceptor.accept())
                .await
                .is_err()
        );
    }
}
