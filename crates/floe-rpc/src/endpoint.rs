//! Endpoints: where and how to reach an object adapter.
//!
//! Stringified form: `tcp -h 127.0.0.1 -p 12010 -t 60000 -z`, with `-r` for
//! the WebSocket resource path. Endpoints of transports this process does
//! not know are kept as opaque bytes so proxies can be forwarded unchanged.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

use crate::codec::{Decode, Encapsulation, Encode, InputStream, OutputStream};
use crate::error::{Error, Result};
use crate::version::EncodingVersion;

/// Default endpoint timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: i32 = 60_000;

/// Transports with a built-in implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// Plain TCP.
    Tcp,
    /// TCP with TLS.
    Ssl,
    /// UDP datagrams.
    Udp,
    /// WebSocket over TCP.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl TransportKind {
    /// Endpoint type code used in encoded proxies.
    pub fn wire_type(self) -> i16 {
        match self {
            TransportKind::Tcp => 1,
            TransportKind::Ssl => 2,
            TransportKind::Udp => 3,
            TransportKind::Ws => 4,
            TransportKind::Wss => 5,
        }
    }

    /// The transport for a wire type code.
    pub fn from_wire_type(t: i16) -> Option<Self> {
        match t {
            1 => Some(TransportKind::Tcp),
            2 => Some(TransportKind::Ssl),
            3 => Some(TransportKind::Udp),
            4 => Some(TransportKind::Ws),
            5 => Some(TransportKind::Wss),
            _ => None,
        }
    }

    /// Protocol name used in stringified endpoints.
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ssl => "ssl",
            TransportKind::Udp => "udp",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }

    /// The transport for an endpoint string protocol name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(TransportKind::Tcp),
            "ssl" => Some(TransportKind::Ssl),
            "udp" => Some(TransportKind::Udp),
            "ws" => Some(TransportKind::Ws),
            "wss" => Some(TransportKind::Wss),
            _ => None,
        }
    }

    /// Whether the transport runs over TLS.
    pub fn is_secure(self) -> bool {
        matches!(self, TransportKind::Ssl | TransportKind::Wss)
    }

    /// Whether the transport is udp.
    pub fn is_datagram(self) -> bool {
        matches!(self, TransportKind::Udp)
    }
}

/// An endpoint of one of the built-in IP transports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpEndpoint {
    /// Which built-in transport.
    pub transport: TransportKind,
    /// Host name or address; empty means the default host.
    pub host: String,
    /// Port; 0 asks the OS for one when listening.
    pub port: u16,
    /// Connect and close timeout in milliseconds; -1 means infinite.
    pub timeout_ms: i32,
    /// Whether the peer may compress messages (never done here).
    pub compress: bool,
    /// WebSocket resource path.
    pub resource: String,
}

impl IpEndpoint {
    /// A TCP endpoint with the default timeout.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        IpEndpoint {
            transport: TransportKind::Tcp,
            host: host.into(),
            port,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            compress: false,
            resource: String::new(),
        }
    }

    /// `host:port` suitable for socket APIs.
    pub fn socket_address(&self) -> String {
        let host = match self.host.as_str() {
            "" => "localhost",
            h => h,
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Address to bind when listening on this endpoint.
    pub fn bind_address(&self) -> String {
        match self.host.as_str() {
            "" | "*" | "0.0.0.0" => format!("0.0.0.0:{}", self.port),
            "::" => format!("[::]:{}", self.port),
            _ => self.socket_address(),
        }
    }
}

/// An endpoint whose transport is unknown; kept byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpaqueEndpoint {
    /// Transport code as written on the wire.
    pub wire_type: i16,
    /// Encoding of the endpoint body.
    pub encoding: EncodingVersion,
    /// The undecoded endpoint body.
    pub bytes: Bytes,
}

/// A candidate address of an object adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// A built-in transport.
    Ip(IpEndpoint),
    /// A transport this runtime does not implement.
    Opaque(OpaqueEndpoint),
}

impl Endpoint {
    /// A tcp endpoint with the default timeout.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Ip(IpEndpoint::tcp(host, port))
    }

    /// The built-in transport, if any.
    pub fn transport(&self) -> Option<TransportKind> {
        match self {
            Endpoint::Ip(ip) => Some(ip.transport),
            Endpoint::Opaque(_) => None,
        }
    }

    /// The IP endpoint, unless opaque.
    pub fn as_ip(&self) -> Option<&IpEndpoint> {
        match self {
            Endpoint::Ip(ip) => Some(ip),
            Endpoint::Opaque(_) => None,
        }
    }

    /// Whether the transport runs over TLS.
    pub fn is_secure(&self) -> bool {
        self.transport().map(TransportKind::is_secure).unwrap_or(false)
    }

    /// Whether the transport is udp.
    pub fn is_datagram(&self) -> bool {
        self.transport()
            .map(TransportKind::is_datagram)
            .unwrap_or(false)
    }

    /// Timeout in milliseconds, -1 for infinite.
    pub fn timeout_ms(&self) -> i32 {
        match self {
            Endpoint::Ip(ip) => ip.timeout_ms,
            Endpoint::Opaque(_) => -1,
        }
    }

    /// Copy with another port (used after binding port 0).
    pub fn with_port(&self, port: u16) -> Endpoint {
        match self {
            Endpoint::Ip(ip) => Endpoint::Ip(IpEndpoint { port, ..ip.clone() }),
            other => other.clone(),
        }
    }

    /// Copy with another host.
    pub fn with_host(&self, host: &str) -> Endpoint {
        match self {
            Endpoint::Ip(ip) => Endpoint::Ip(IpEndpoint {
                host: host.to_string(),
                ..ip.clone()
            }),
            other => other.clone(),
        }
    }

    /// A copy with the given timeout; opaque endpoints are unchanged.
    pub fn with_timeout(&self, timeout_ms: i32) -> Endpoint {
        match self {
            Endpoint::Ip(ip) => Endpoint::Ip(IpEndpoint {
                timeout_ms,
                ..ip.clone()
            }),
            other => other.clone(),
        }
    }

    /// A copy with the compression flag set; opaque endpoints are unchanged.
    pub fn with_compress(&self, compress: bool) -> Endpoint {
        match self {
            Endpoint::Ip(ip) => Endpoint::Ip(IpEndpoint {
                compress,
                ..ip.clone()
            }),
            other => other.clone(),
        }
    }
}

/// Splits an endpoint or proxy string on whitespace, honouring double quotes.
pub(crate) fn tokenize(s: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(Error::EndpointParse {
            input: s.to_string(),
            reason: "unterminated quote".to_string(),
        });
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_error(input: &str, reason: impl Into<String>) -> Error {
    Error::EndpointParse {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn parse_ip(transport: TransportKind, args: &[String], input: &str) -> Result<Endpoint> {
    let mut ep = IpEndpoint {
        transport,
        host: String::new(),
        port: 0,
        timeout_ms: DEFAULT_TIMEOUT_MS,
        compress: false,
        resource: String::new(),
    };
    let mut i = 0;
    while i < args.len() {
        let opt = args[i].as_str();
        let value = args.get(i + 1).filter(|v| !v.starts_with('-'));
        match opt {
            "-h" => {
                let v = value.ok_or_else(|| parse_error(input, "-h requires a host"))?;
                ep.host = v.clone();
                i += 2;
            }
            "-p" => {
                let v = value.ok_or_else(|| parse_error(input, "-p requires a port"))?;
                ep.port = v
                    .parse()
                    .map_err(|_| parse_error(input, format!("invalid port `{v}`")))?;
                i += 2;
            }
            "-t" if transport != TransportKind::Udp => {
                let v = value.ok_or_else(|| parse_error(input, "-t requires a timeout"))?;
                ep.timeout_ms = if v == "infinite" {
                    -1
                } else {
                    match v.parse::<i32>() {
                        Ok(t) if t > 0 || t == -1 => t,
                        _ => return Err(parse_error(input, format!("invalid timeout `{v}`"))),
                    }
                };
                i += 2;
            }
            "-r" if matches!(transport, TransportKind::Ws | TransportKind::Wss) => {
                let v = value.ok_or_else(|| parse_error(input, "-r requires a resource"))?;
                ep.resource = v.clone();
                i += 2;
            }
            "-z" => {
                ep.compress = true;
                i += 1;
            }
            other => return Err(parse_error(input, format!("unknown option `{other}`"))),
        }
    }
    if transport == TransportKind::Udp {
        ep.timeout_ms = -1;
    }
    Ok(Endpoint::Ip(ep))
}

fn parse_opaque(args: &[String], input: &str) -> Result<Endpoint> {
    let mut wire_type = None;
    let mut encoding = crate::version::ENCODING_1_1;
    let mut bytes = None;
    let mut i = 0;
    while i < args.len() {
        let value = args
            .get(i + 1)
            .ok_or_else(|| parse_error(input, format!("{} requires a value", args[i])))?;
        match args[i].as_str() {
            "-t" => {
                let t: i16 = value
                    .parse()
                    .map_err(|_| parse_error(input, format!("invalid type `{value}`")))?;
                if t < 0 {
                    return Err(parse_error(input, "negative endpoint type"));
                }
                wire_type = Some(t);
            }
            "-e" => {
                encoding = value
                    .parse()
                    .map_err(|_| parse_error(input, format!("invalid encoding `{value}`")))?;
            }
            "-v" => {
                let decoded = STANDARD
                    .decode(value.as_bytes())
                    .map_err(|e| parse_error(input, format!("invalid base64 value: {e}")))?;
                bytes = Some(Bytes::from(decoded));
            }
            other => return Err(parse_error(input, format!("unknown option `{other}`"))),
        }
        i += 2;
    }
    let wire_type = wire_type.ok_or_else(|| parse_error(input, "missing -t"))?;
    let bytes = bytes.ok_or_else(|| parse_error(input, "missing -v"))?;
    Ok(Endpoint::Opaque(OpaqueEndpoint {
        wire_type,
        encoding,
        bytes,
    }))
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        let (protocol, args) = tokens
            .split_first()
            .ok_or_else(|| parse_error(s, "empty endpoint"))?;
        let protocol = if protocol == "default" { "tcp" } else { protocol.as_str() };
        if protocol == "opaque" {
            return parse_opaque(args, s);
        }
        let transport = TransportKind::from_name(protocol)
            .ok_or_else(|| parse_error(s, format!("unknown protocol `{protocol}`")))?;
        parse_ip(transport, args, s)
    }
}

fn quote_host(host: &str) -> String {
    if host.contains(':') || host.contains(' ') {
        format!("\"{host}\"")
    } else {
        host.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(ip) => {
                write!(f, "{}", ip.transport.name())?;
                if !ip.host.is_empty() {
                    write!(f, " -h {}", quote_host(&ip.host))?;
                }
                write!(f, " -p {}", ip.port)?;
                if ip.transport != TransportKind::Udp {
                    if ip.timeout_ms == -1 {
                        write!(f, " -t infinite")?;
                    } else {
                        write!(f, " -t {}", ip.timeout_ms)?;
                    }
                }
                if ip.compress {
                    write!(f, " -z")?;
                }
                if !ip.resource.is_empty() {
                    write!(f, " -r {}", ip.resource)?;
                }
                Ok(())
            }
            Endpoint::Opaque(o) => write!(
                f,
                "opaque -t {} -e {} -v {}",
                o.wire_type,
                o.encoding,
                STANDARD.encode(&o.bytes)
            ),
        }
    }
}

impl Encode for Endpoint {
    fn encode(&self, out: &mut OutputStream) {
        match self {
            Endpoint::Ip(ip) => {
                out.write_short(ip.transport.wire_type());
                let encoding = out.encoding();
                out.start_encapsulation(encoding);
                out.write_string(&ip.host);
                out.write_int(i32::from(ip.port));
                match ip.transport {
                    TransportKind::Udp => {
                        if encoding.is_1_0() {
                            // Protocol and encoding versions, only under 1.0.
                            out.write_blob(&[1, 0, 1, 0]);
                        }
                        out.write_bool(ip.compress);
                    }
                    _ => {
                        out.write_int(ip.timeout_ms);
                        out.write_bool(ip.compress);
                    }
                }
                if matches!(ip.transport, TransportKind::Ws | TransportKind::Wss) {
                    out.write_string(&ip.resource);
                }
                out.end_encapsulation();
            }
            Endpoint::Opaque(o) => {
                out.write_short(o.wire_type);
                out.write_encapsulation(&Encapsulation::new(o.encoding, o.bytes.clone()));
            }
        }
    }
}

impl Decode for Endpoint {
    fn decode(input: &mut InputStream) -> Result<Self> {
        let wire_type = input.read_short()?;
        let Some(transport) = TransportKind::from_wire_type(wire_type) else {
            let encaps = input.read_encapsulation()?;
            return Ok(Endpoint::Opaque(OpaqueEndpoint {
                wire_type,
                encoding: encaps.encoding,
                bytes: encaps.data,
            }));
        };
        let encoding = input.start_encapsulation()?;
        let host = input.read_string()?;
        let port = input.read_int()?;
        let port = u16::try_from(port)
            .map_err(|_| Error::marshal(format!("invalid endpoint port {port}")))?;
        let (timeout_ms, compress) = if transport == TransportKind::Udp {
            if encoding.is_1_0() {
                input.skip(4)?;
            }
            (-1, input.read_bool()?)
        } else {
            (input.read_int()?, input.read_bool()?)
        };
        let resource = if matches!(transport, TransportKind::Ws | TransportKind::Wss) {
            input.read_string()?
        } else {
            String::new()
        };
        input.end_encapsulation()?;
        Ok(Endpoint::Ip(IpEndpoint {
            transport,
            host,
            port,
            timeout_ms,
            compress,
            resource,
        }))
    }
}

/// Splits `s` on every `sep` that is outside double quotes. Pieces are
/// trimmed; quotes are kept for the tokenizer.
pub(crate) fn split_unquoted(s: &str, sep: char) -> Result<Vec<String>> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        if c == sep && !in_quotes {
            pieces.push(std::mem::take(&mut current).trim().to_string());
        } else {
            current.push(c);
        }
    }
    if in_quotes {
        return Err(parse_error(s, "unterminated quote"));
    }
    pieces.push(current.trim().to_string());
    Ok(pieces)
}

/// Parses a colon-separated endpoint list. `default` resolves to
/// `default_protocol` and endpoints without `-h` get `default_host`.
pub(crate) fn parse_endpoint_list(
    s: &str,
    default_protocol: TransportKind,
    default_host: &str,
) -> Result<Vec<Endpoint>> {
    let mut endpoints = Vec::new();
    for piece in split_unquoted(s, ':')? {
        if piece.is_empty() {
            if s.trim().is_empty() {
                continue;
            }
            return Err(parse_error(s, "empty endpoint"));
        }
        let piece = match piece.strip_prefix("default") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                format!("{}{rest}", default_protocol.name())
            }
            _ => piece,
        };
        let mut endpoint: Endpoint = piece.parse()?;
        if let Endpoint::Ip(ip) = &mut endpoint {
            if ip.host.is_empty() && !default_host.is_empty() {
                ip.host = default_host.to_string();
            }
        }
        endpoints.push(endpoint);
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{ENCODING_1_0, ENCODING_1_1};

    #[test]
    fn test_parse_tcp() {
        let ep: Endpoint = "tcp -h 127.0.0.1 -p 12010 -t 5000 -z".parse().unwrap();
        let ip = ep.as_ip().unwrap();
        assert_eq!(ip.transport, TransportKind::Tcp);
        assert_eq!(ip.host, "127.0.0.1");
        assert_eq!(ip.port, 12010);
        assert_eq!(ip.timeout_ms, 5000);
        assert!(ip.compress);
        assert_eq!(ep.to_string(), "tcp -h 127.0.0.1 -p 12010 -t 5000 -z");
    }

    #[test]
    fn test_parse_defaults_and_infinite() {
        let ep: Endpoint = "default -p 4061 -t infinite".parse().unwrap();
        assert_eq!(ep.transport(), Some(TransportKind::Tcp));
        assert_eq!(ep.timeout_ms(), -1);
        assert_eq!(ep.to_string(), "tcp -p 4061 -t infinite");
    }

    #[test]
    fn test_parse_ws_resource_and_ipv6() {
        let ep: Endpoint = "wss -h \"::1\" -p 443 -r /chat".parse().unwrap();
        let ip = ep.as_ip().unwrap();
        assert_eq!(ip.host, "::1");
        assert_eq!(ip.resource, "/chat");
        assert!(ep.is_secure());
        assert_eq!(ip.socket_address(), "[::1]:443");
        assert_eq!(ep.to_string().parse::<Endpoint>().unwrap(), ep);
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("carrier-pigeon -p 1".parse::<Endpoint>().is_err());
        assert!("tcp -p notaport".parse::<Endpoint>().is_err());
        assert!("tcp -t 0".parse::<Endpoint>().is_err());
        assert!("tcp -x".parse::<Endpoint>().is_err());
        assert!("tcp -r /x".parse::<Endpoint>().is_err());
        assert!("tcp -h \"open".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_wire_roundtrip_all_transports() {
        for s in [
            "tcp -h a -p 1 -t 100",
            "ssl -h b -p 2 -t infinite -z",
            "udp -h c -p 3",
            "ws -h d -p 4 -t 200 -r /x",
            "wss -h e -p 5 -t 300 -r /y",
        ] {
            let ep: Endpoint = s.parse().unwrap();
            for encoding in [ENCODING_1_0, ENCODING_1_1] {
                let mut out = OutputStream::new(encoding);
                out.write(&ep);
                let mut input = InputStream::new(out.finished().unwrap(), encoding);
                assert_eq!(Endpoint::decode(&mut input).unwrap(), ep, "{s}");
                assert!(input.is_at_end());
            }
        }
    }

    #[test]
    fn test_tcp_wire_layout() {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write(&Endpoint::tcp("h", 10));
        let bytes = out.finished().unwrap();
        assert_eq!(
            &bytes[..],
            &[1, 0, 17, 0, 0, 0, 1, 1, 1, b'h', 10, 0, 0, 0, 0x60, 0xEA, 0, 0, 0]
        );
    }

    #[test]
    fn test_opaque_preserved() {
        let ep: Endpoint = "opaque -t 99 -e 1.1 -v AQID".parse().unwrap();
        let Endpoint::Opaque(o) = &ep else {
            panic!("expected opaque endpoint");
        };
        assert_eq!(o.wire_type, 99);
        assert_eq!(&o.bytes[..], &[1, 2, 3]);
        assert_eq!(ep.to_string(), "opaque -t 99 -e 1.1 -v AQID");

        let mut out = OutputStream::new(ENCODING_1_1);
        out.write(&ep);
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_1);
        assert_eq!(Endpoint::decode(&mut input).unwrap(), ep);
    }

    #[test]
    fn test_with_port_and_bind_address() {
        let ep: Endpoint = "tcp -h * -p 0".parse().unwrap();
        let bound = ep.with_port(4000);
        assert_eq!(bound.as_ip().unwrap().port, 4000);
        assert_eq!(bound.as_ip().unwrap().bind_address(), "0.0.0.0:4000");
        assert_eq!(Endpoint::tcp("", 5).as_ip().unwrap().socket_address(), "localhost:5");
    }

    #[test]
    fn test_endpoint_list() {
        let list = parse_endpoint_list(
            "default -p 10000:udp -h \"::1\" -p 10001 : ws -p 10002 -r /x",
            TransportKind::Tcp,
            "127.0.0.1",
        )
        .unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].transport(), Some(TransportKind::Tcp));
        assert_eq!(list[0].as_ip().unwrap().host, "127.0.0.1");
        assert_eq!(list[1].as_ip().unwrap().host, "::1");
        assert_eq!(list[2].as_ip().unwrap().resource, "/x");
        assert!(parse_endpoint_list("", TransportKind::Tcp, "").unwrap().is_empty());
        assert!(parse_endpoint_list("tcp -p 1::tcp -p 2", TransportKind::Tcp, "").is_err());
    }
}
