//! Outgoing TCP through a SOCKS4 or HTTP CONNECT proxy.
//!
//! The proxy sits below every stream transport: tcp, ssl and ws all connect
//! to the proxy, run its handshake, and then carry their own protocol over
//! the tunnel. The channel records a [`LayerInfo::NetworkProxy`] above the
//! tcp layer, whose addresses are those of the socket to the proxy.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::IpEndpoint;
use crate::error::{Error, Result};
use crate::info::LayerInfo;

/// Largest CONNECT response header accepted from an HTTP proxy.
const HTTP_RESPONSE_MAX: usize = 8 * 1024;

const SOCKS4_VERSION: u8 = 4;
const SOCKS4_CONNECT: u8 = 1;
const SOCKS4_GRANTED: u8 = 0x5a;

/// A proxy that outgoing connections tunnel through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkProxy {
    /// SOCKS version 4; targets must resolve to IPv4.
    Socks { host: String, port: u16 },
    /// HTTP/1.1 `CONNECT`.
    Http { host: String, port: u16 },
}

impl NetworkProxy {
    /// Short protocol name, as recorded in the layer info.
    pub fn name(&self) -> &'static str {
        match self {
            NetworkProxy::Socks { .. } => "socks",
            NetworkProxy::Http { .. } => "http",
        }
    }

    /// Endpoint of the proxy itself, with the timeout of the target.
    pub(crate) fn endpoint(&self, target: &IpEndpoint) -> IpEndpoint {
        let (host, port) = match self {
            NetworkProxy::Socks { host, port } | NetworkProxy::Http { host, port } => (host, *port),
        };
        IpEndpoint {
            host: host.clone(),
            port,
            ..target.clone()
        }
    }

    /// Asks the proxy on `stream` to open a tunnel to `target`.
    pub(crate) async fn handshake<S>(&self, stream: &mut S, target: &IpEndpoint) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            NetworkProxy::Socks { .. } => {
                let address = resolve_ipv4(target).await?;
                socks4_connect(stream, address, target).await
            }
            NetworkProxy::Http { .. } => http_connect(stream, target).await,
        }
    }

    pub(crate) fn layer(&self, target: &IpEndpoint) -> LayerInfo {
        LayerInfo::NetworkProxy {
            protocol: self.name().to_string(),
            target_host: target.host.clone(),
            target_port: target.port,
        }
    }
}

impl fmt::Display for NetworkProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkProxy::Socks { host, port } | NetworkProxy::Http { host, port } => {
                write!(f, "{} proxy {host}:{port}", self.name())
            }
        }
    }
}

fn refused(target: &IpEndpoint, reason: &str) -> Error {
    tracing::debug!(host = %target.host, port = target.port, reason, "proxy refused tunnel");
    Error::ConnectionRefused {
        endpoint: format!("{}:{}", target.host, target.port),
    }
}

/// SOCKS4 carries the target as an IPv4 address, so the name is resolved here.
async fn resolve_ipv4(target: &IpEndpoint) -> Result<SocketAddr> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(_) => Ok(SocketAddr::new(ip, target.port)),
            IpAddr::V6(_) => Err(Error::FeatureNotSupported {
                feature: "IPv6 target through a SOCKS4 proxy".to_string(),
            }),
        };
    }
    let dns = || Error::DnsFailure {
        host: target.host.clone(),
    };
    tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|_| dns())?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(dns)
}

async fn socks4_connect<S>(stream: &mut S, address: SocketAddr, target: &IpEndpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let SocketAddr::V4(v4) = address else {
        return Err(Error::FeatureNotSupported {
            feature: "IPv6 target through a SOCKS4 proxy".to_string(),
        });
    };
    let mut request = Vec::with_capacity(9);
    request.push(SOCKS4_VERSION);
    request.push(SOCKS4_CONNECT);
    request.extend_from_slice(&v4.port().to_be_bytes());
    request.extend_from_slice(&v4.ip().octets());
    // Empty user id.
    request.push(0);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost {
            reason: "SOCKS proxy closed the connection".to_string(),
        },
        _ => Error::from(e),
    })?;
    if reply[0] != 0 || reply[1] != SOCKS4_GRANTED {
        return Err(refused(target, "SOCKS request rejected"));
    }
    Ok(())
}

async fn http_connect<S>(stream: &mut S, target: &IpEndpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = if target.host.contains(':') {
        format!("[{}]:{}", target.host, target.port)
    } else {
        format!("{}:{}", target.host, target.port)
    };
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Byte at a time: the tunnelled protocol may follow the header in the
    // same segment and must stay unread.
    let mut response = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= HTTP_RESPONSE_MAX {
            return Err(Error::Protocol {
                reason: "HTTP proxy response header too large".to_string(),
            });
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(Error::ConnectionLost {
                reason: "HTTP proxy closed the connection".to_string(),
            });
        }
        response.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let status = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Protocol {
            reason: format!("unexpected HTTP proxy response: {status_line}"),
        });
    }
    if status != "200" {
        return Err(refused(target, status_line));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn target() -> IpEndpoint {
        IpEndpoint::tcp("127.0.0.1", 4061)
    }

    #[tokio::test]
    async fn test_socks4_request_layout() {
        let (mut client, mut proxy) = duplex(64);
        let server = tokio::spawn(async move {
            let mut request = [0u8; 9];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[0, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0]).await.unwrap();
            request
        });

        let socks = NetworkProxy::Socks {
            host: "proxy".into(),
            port: 1080,
        };
        socks.handshake(&mut client, &target()).await.unwrap();
        let request = server.await.unwrap();
        assert_eq!(request, [4, 1, 0x0f, 0xdd, 127, 0, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_socks4_rejection() {
        let (mut client, mut proxy) = duplex(64);
        tokio::spawn(async move {
            let mut request = [0u8; 9];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[0, 0x5b, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let socks = NetworkProxy::Socks {
            host: "proxy".into(),
            port: 1080,
        };
        let err = socks.handshake(&mut client, &target()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_socks4_rejects_ipv6_target() {
        let (mut client, _proxy) = duplex(64);
        let socks = NetworkProxy::Socks {
            host: "proxy".into(),
            port: 1080,
        };
        let err = socks
            .handshake(&mut client, &IpEndpoint::tcp("::1", 4061))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FeatureNotSupported { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_http_connect_leaves_tunnel_bytes_unread() {
        let (mut client, mut proxy) = duplex(256);
        let server = tokio::spawn(async move {
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                proxy.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nIceP")
                .await
                .unwrap();
            String::from_utf8(request).unwrap()
        });

        let http = NetworkProxy::Http {
            host: "proxy".into(),
            port: 3128,
        };
        http.handshake(&mut client, &target()).await.unwrap();
        let mut tunnelled = [0u8; 4];
        client.read_exact(&mut tunnelled).await.unwrap();
        assert_eq!(&tunnelled, b"IceP");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT 127.0.0.1:4061 HTTP/1.1\r\n"));
        assert!(request.contains("Host: 127.0.0.1:4061\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_refused() {
        let (mut client, mut proxy) = duplex(256);
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let _ = proxy.read(&mut buf).await.unwrap();
            proxy
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let http = NetworkProxy::Http {
            host: "proxy".into(),
            port: 3128,
        };
        let err = http.handshake(&mut client, &target()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }), "{err:?}");
    }

    #[test]
    fn test_proxy_endpoint_keeps_target_timeout() {
        let http = NetworkProxy::Http {
            host: "proxy".into(),
            port: 3128,
        };
        let mut target = target();
        target.timeout_ms = 250;
        let endpoint = http.endpoint(&target);
        assert_eq!(endpoint.host, "proxy");
        assert_eq!(endpoint.port, 3128);
        assert_eq!(endpoint.timeout_ms, 250);
        assert_eq!(http.to_string(), "http proxy proxy:3128");
    }
}
