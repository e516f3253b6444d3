//! Connection information snapshots.
//!
//! Transports stack on each other: TLS runs over TCP, WebSocket runs over
//! either, and a network proxy tunnel may sit right above TCP. A connection records one [`LayerInfo`] per layer, innermost first.
//! [`ConnectionInfo`] views the outermost layer and [`ConnectionInfo::underlying`]
//! walks inwards. Snapshots are immutable copies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;

/// Addresses of an IP-level layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpInfo {
    /// Local address, empty when unknown.
    pub local_address: String,
    /// Local port, 0 when unknown.
    pub local_port: u16,
    /// Peer address, empty when unknown.
    pub remote_address: String,
    /// Port of the peer as observed on this socket.
    pub remote_port: u16,
}

impl IpInfo {
    /// Addresses of a socket; unknown ones are left empty.
    pub fn new(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        let split = |addr: Option<SocketAddr>| match addr {
            Some(a) => (a.ip().to_string(), a.port()),
            None => (String::new(), 0),
        };
        let (local_address, local_port) = split(local);
        let (remote_address, remote_port) = split(remote);
        IpInfo {
            local_address,
            local_port,
            remote_address,
            remote_port,
        }
    }
}

/// One transport layer of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LayerInfo {
    /// Stream socket.
    Tcp(IpInfo),
    /// Datagram socket.
    Udp(IpInfo),
    /// TLS session over the layer below.
    Tls {
        cipher: String,
        /// DER-encoded peer certificates, leaf first.
        peer_certificates: Vec<Vec<u8>>,
        verified: bool,
    },
    /// Tunnel opened through a SOCKS or HTTP proxy; the layer below is the
    /// socket to the proxy.
    NetworkProxy {
        /// `socks` or `http`.
        protocol: String,
        target_host: String,
        target_port: u16,
    },
    /// WebSocket framing over the layer below.
    WebSocket {
        /// Handshake headers received from the peer.
        headers: HashMap<String, String>,
    },
}

impl LayerInfo {
    /// The innermost IP addresses of the connection.
    pub fn ip(&self) -> Option<&IpInfo> {
        match self {
            LayerInfo::Tcp(ip) | LayerInfo::Udp(ip) => Some(ip),
            _ => None,
        }
    }
}

/// Immutable snapshot of a connection's identity and layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// True on the accepting side.
    pub incoming: bool,
    /// Name of the adapter that accepted the connection, empty otherwise.
    pub adapter_name: String,
    /// Connection id used to keep proxies on separate connections.
    pub connection_id: String,
    layers: Arc<[LayerInfo]>,
    depth: usize,
}

impl ConnectionInfo {
    pub(crate) fn new(
        incoming: bool,
        adapter_name: String,
        connection_id: String,
        layers: Arc<[LayerInfo]>,
    ) -> Self {
        let depth = layers.len().saturating_sub(1);
        ConnectionInfo {
            incoming,
            adapter_name,
            connection_id,
            layers,
            depth,
        }
    }

    /// The layer this view describes.
    pub fn layer(&self) -> Option<&LayerInfo> {
        self.layers.get(self.depth)
    }

    /// The view of the next inner layer, if any.
    pub fn underlying(&self) -> Option<ConnectionInfo> {
        if self.depth == 0 {
            return None;
        }
        Some(ConnectionInfo {
            depth: self.depth - 1,
            ..self.clone()
        })
    }

    /// All layers, innermost first.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    /// IP addresses of the innermost layer.
    pub fn ip(&self) -> Option<&IpInfo> {
        self.layers.first().and_then(LayerInfo::ip)
    }

    /// Whether any layer is a TLS session.
    pub fn is_secure(&self) -> bool {
        self.layers.iter().any(|l| matches!(l, LayerInfo::Tls { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wss_info() -> ConnectionInfo {
        let ip = IpInfo::new(
            Some("127.0.0.1:5000".parse().unwrap()),
            Some("127.0.0.1:6000".parse().unwrap()),
        );
        let layers: Vec<LayerInfo> = vec![
            LayerInfo::Tcp(ip),
            LayerInfo::Tls {
                cipher: "TLS13_AES_128_GCM_SHA256".into(),
                peer_certificates: vec![],
                verified: true,
            },
            LayerInfo::WebSocket {
                headers: HashMap::from([("host".to_string(), "localhost".to_string())]),
            },
        ];
        ConnectionInfo::new(false, String::new(), String::new(), layers.into())
    }

    #[test]
    fn test_outermost_first_then_underlying() {
        let info = wss_info();
        assert!(matches!(info.layer(), Some(LayerInfo::WebSocket { .. })));
        let tls = info.underlying().unwrap();
        assert!(matches!(tls.layer(), Some(LayerInfo::Tls { .. })));
        let tcp = tls.underlying().unwrap();
        assert_eq!(tcp.layer().and_then(LayerInfo::ip).unwrap().remote_port, 6000);
        assert!(tcp.underlying().is_none());
    }

    #[test]
    fn test_snapshot_helpers() {
        let info = wss_info();
        assert!(info.is_secure());
        assert_eq!(info.ip().unwrap().local_port, 5000);
        assert_eq!(info.layers().len(), 3);
    }

    #[test]
    fn test_ip_info_missing_addresses() {
        let ip = IpInfo::new(None, None);
        assert_eq!(ip.local_port, 0);
        assert!(ip.remote_address.is_empty());
    }
}
