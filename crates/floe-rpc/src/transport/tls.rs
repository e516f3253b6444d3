//! TLS support for the ssl and wss transports.
//!
//! Certificates and keys come as PEM bytes. A client presents a certificate
//! only when one is configured; a server verifies client certificates against
//! the configured CA when `require_client_auth` is set. Handshake failures
//! surface as `Error::Tls` and are never retried.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use super::tcp::{bind_listener, connect_stream, tcp_layer};
use super::{Acceptor, Channel, StreamSink, StreamSource, Transport, TransportConfig};
use crate::endpoint::{Endpoint, IpEndpoint, TransportKind};
use crate::error::{Error, Result};
use crate::info::LayerInfo;

/// Configuration for TLS connections.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA certificates for verifying peer certificates.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain; may be empty on clients.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key matching the chain.
    pub private_key_pem: Vec<u8>,
    /// Whether servers demand client certificates.
    pub require_client_auth: bool,
}

impl TlsConfig {
    /// Creates a new TLS configuration.
    pub fn new(
        ca_cert_pem: Vec<u8>,
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        require_client_auth: bool,
    ) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
            require_client_auth,
        }
    }
}

fn tls_error(context: &str, e: impl fmt::Display) -> Error {
    Error::Tls {
        reason: format!("{context}: {e}"),
    }
}

fn root_store(config: &TlsConfig) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_pem(&config.ca_cert_pem)? {
        roots
            .add(cert)
            .map_err(|e| tls_error("failed to add CA cert", e))?;
    }
    Ok(roots)
}

/// Client-side TLS connector.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    /// Creates a new TLS connector from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(config)?);
        let client_config = if config.cert_chain_pem.is_empty() {
            builder.with_no_client_auth()
        } else {
            let certs = load_certs_from_pem(&config.cert_chain_pem)?;
            let key = load_private_key_from_pem(&config.private_key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error("failed to create client config", e))?
        };
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Runs the client handshake over `stream`, verifying `domain`.
    pub async fn connect<IO>(&self, domain: &str, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let domain = if domain.is_empty() { "localhost" } else { domain };
        let server_name = match domain.parse::<std::net::IpAddr>() {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(domain.to_string())
                .map_err(|e| tls_error("invalid domain", e))?,
        };
        let stream = self
            .inner
            .connect(server_name, stream)
            .await
            .map_err(|e| tls_error("TLS handshake failed", e))?;
        Ok(TlsStream::Client(stream))
    }
}

/// Server-side TLS acceptor.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor from configuration.
    pub fn new(config: &TlsConfig) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;

        let builder = rustls::ServerConfig::builder();
        let builder = if config.require_client_auth {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(config)?))
                .build()
                .map_err(|e| tls_error("failed to build client verifier", e))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };
        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| tls_error("failed to set server cert", e))?;
        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Runs the server handshake over `stream`.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| tls_error("TLS handshake failed", e))?;
        Ok(TlsStream::Server(stream))
    }
}

/// A TLS stream that can be either client or server side.
#[derive(Debug)]
pub enum TlsStream<IO> {
    /// Client-side TLS stream.
    Client(tokio_rustls::client::TlsStream<IO>),
    /// Server-side TLS stream.
    Server(tokio_rustls::server::TlsStream<IO>),
}

impl<IO> TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// The peer's certificate chain, DER-encoded, leaf first.
    pub fn peer_certificates(&self) -> Vec<Vec<u8>> {
        let certs = match self {
            TlsStream::Client(s) => s.get_ref().1.peer_certificates(),
            TlsStream::Server(s) => s.get_ref().1.peer_certificates(),
        };
        certs
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default()
    }

    fn cipher(&self) -> String {
        let suite = match self {
            TlsStream::Client(s) => s.get_ref().1.negotiated_cipher_suite(),
            TlsStream::Server(s) => s.get_ref().1.negotiated_cipher_suite(),
        };
        suite
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default()
    }

    /// Describes the session for `ConnectionInfo`.
    pub fn layer_info(&self) -> LayerInfo {
        let peer_certificates = self.peer_certificates();
        // Client sessions always verify the server; servers only when asked.
        let verified = matches!(self, TlsStream::Client(_)) || !peer_certificates.is_empty();
        LayerInfo::Tls {
            cipher: self.cipher(),
            peer_certificates,
            verified,
        }
    }
}

impl<IO> AsyncRead for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<IO> AsyncWrite for TlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TlsStream::Client(s) => Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        if let rustls_pemfile::Item::X509Certificate(cert) = item {
            certs.push(cert);
        }
    }

    if certs.is_empty() {
        return Err(Error::Tls {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    while let Ok(Some(item)) = rustls_pemfile::read_one(&mut cursor) {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => {}
        }
    }

    Err(Error::Tls {
        reason: "no private key found in PEM".to_string(),
    })
}

/// Generates a self-signed CA certificate and key pair using rcgen.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| tls_error("failed to generate CA key", e))?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| tls_error("failed to create CA certificate", e))?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Generates a certificate for `names` (DNS names or IP addresses) signed by
/// the given CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    names: &[&str],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let ca_key_pem =
        std::str::from_utf8(ca_key_pem).map_err(|e| tls_error("invalid CA key PEM", e))?;
    let ca_key =
        rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| tls_error("failed to parse CA key", e))?;

    let ca_cert_pem =
        std::str::from_utf8(ca_cert_pem).map_err(|e| tls_error("invalid CA cert PEM", e))?;
    let ca_cert = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| tls_error("failed to parse CA certificate", e))?
        .self_signed(&ca_key)
        .map_err(|e| tls_error("failed to reconstruct CA certificate", e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_error("failed to generate key", e))?;
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let cert = rcgen::CertificateParams::new(names)
        .map_err(|e| tls_error("failed to create certificate params", e))?
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_error("failed to sign certificate", e))?;

    Ok((cert.pem().into_bytes(), key.serialize_pem().into_bytes()))
}

/// TLS over TCP.
#[derive(Debug, Clone)]
pub struct SslTransport {
    config: TransportConfig,
    connector: TlsConnector,
    tls: TlsConfig,
}

impl SslTransport {
    /// Loads the certificates and builds the client and server configurations.
    pub fn new(config: TransportConfig, tls: TlsConfig) -> Result<Self> {
        Ok(Self {
            connector: TlsConnector::new(&tls)?,
            config,
            tls,
        })
    }
}

/// Connects TCP and runs the client handshake, returning the stream and
/// its layers.
pub(crate) async fn connect_tls(
    endpoint: &IpEndpoint,
    config: &TransportConfig,
    connector: &TlsConnector,
) -> Result<(TlsStream<TcpStream>, Vec<LayerInfo>)> {
    let (stream, mut layers) = connect_stream(endpoint, config).await?;
    let handshake = connector.connect(&endpoint.host, stream);
    let tls_stream = match config.connect_timeout_for(endpoint) {
        Some(timeout) => tokio::time::timeout(timeout, handshake).await.map_err(|_| {
            Error::ConnectTimeout {
                endpoint: Endpoint::Ip(endpoint.clone()).to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        })??,
        None => handshake.await?,
    };
    layers.push(tls_stream.layer_info());
    Ok((tls_stream, layers))
}

fn tls_channel(stream: TlsStream<TcpStream>, layers: Vec<LayerInfo>, config: &TransportConfig) -> Channel {
    let (read, write) = tokio::io::split(stream);
    Channel {
        source: Box::new(StreamSource::new(read, config.message_size_max)),
        sink: Box::new(StreamSink::new(write)),
        layers,
        datagram: false,
    }
}

#[async_trait]
impl Transport for SslTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssl
    }

    async fn connect(&self, endpoint: &IpEndpoint) -> Result<Channel> {
        let (stream, layers) = connect_tls(endpoint, &self.config, &self.connector).await?;
        tracing::debug!(endpoint = %Endpoint::Ip(endpoint.clone()), "TLS connected");
        Ok(tls_channel(stream, layers, &self.config))
    }

    async fn listen(&self, endpoint: &IpEndpoint) -> Result<Box<dyn Acceptor>> {
        let acceptor = TlsAcceptor::new(&self.tls)?;
        let (listener, bound) = bind_listener(endpoint).await?;
        Ok(Box::new(SslAcceptor {
            listener,
            endpoint: bound,
            acceptor,
            config: self.config.clone(),
        }))
    }
}

/// Accepts TLS connections.
#[derive(Debug)]
pub struct SslAcceptor {
    listener: TcpListener,
    endpoint: Endpoint,
    acceptor: TlsAcceptor,
    config: TransportConfig,
}

#[async_trait]
impl Acceptor for SslAcceptor {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn accept(&self) -> Result<Channel> {
        let (stream, peer) = self.listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        let tcp = tcp_layer(&stream);
        let tls_stream = self.acceptor.accept(stream).await?;
        let tls = tls_stream.layer_info();
        tracing::debug!(peer = %peer, "TLS accepted");
        Ok(tls_channel(tls_stream, vec![tcp, tls], &self.config))
    }
}
