//! Proxy references: what a proxy points at and how to invoke it.
//!
//! A [`ReferenceData`] is the immutable description (identity, facet, mode,
//! endpoints or adapter id, versions, per-proxy settings). It has a
//! stringified form, `identity [-f facet] [-t|-o|-O|-d|-D] [-s] [-e X.Y]
//! [-p X.Y] (:endpoint)*` or `identity @ adapter-id`, and a wire form used
//! when proxies travel as parameters. A [`Reference`] adds the runtime state
//! shared by clones of one proxy: its cached connection and batch queue.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::batch::BatchRequestQueue;
use crate::codec::{Context, Decode, InputStream, OutputStream};
use crate::communicator::Communicator;
use crate::config::CommunicatorConfig;
use crate::connection::Connection;
use crate::endpoint::{parse_endpoint_list, tokenize, Endpoint};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::version::{
    EncodingVersion, ProtocolVersion, ENCODING_1_0, PROTOCOL_1_0,
};

/// How requests through a proxy are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum InvocationMode {
    /// Request and reply.
    #[default]
    Twoway = 0,
    /// Request only, over a stream transport.
    Oneway = 1,
    /// Queued and sent in batches over a stream transport.
    BatchOneway = 2,
    /// Request only, over a datagram transport.
    Datagram = 3,
    /// Queued and sent in batches over a datagram transport.
    BatchDatagram = 4,
}

impl InvocationMode {
    /// The mode for its wire value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(InvocationMode::Twoway),
            1 => Some(InvocationMode::Oneway),
            2 => Some(InvocationMode::BatchOneway),
            3 => Some(InvocationMode::Datagram),
            4 => Some(InvocationMode::BatchDatagram),
            _ => None,
        }
    }

    /// Whether replies are awaited.
    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    /// Whether requests are queued.
    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    /// Whether requests go over udp.
    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    fn option(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }
}

/// Order in which the endpoints of a proxy are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointSelection {
    /// As listed.
    #[default]
    Ordered,
    /// Shuffled for every new connection.
    Random,
}

impl FromStr for EndpointSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Ordered" => Ok(EndpointSelection::Ordered),
            "Random" => Ok(EndpointSelection::Random),
            other => Err(Error::InvalidProperty {
                key: "EndpointSelection".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable description of a proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReferenceData {
    /// Target object.
    pub identity: Identity,
    /// Target facet.
    pub facet: String,
    /// How calls are sent.
    pub mode: InvocationMode,
    /// Restricts the proxy to secure endpoints.
    pub secure: bool,
    /// Protocol version of the requests.
    pub protocol: ProtocolVersion,
    /// Encoding of the parameters.
    pub encoding: EncodingVersion,
    /// Direct proxies carry endpoints.
    pub endpoints: Vec<Endpoint>,
    /// Indirect proxies carry an adapter id, or nothing when well-known.
    pub adapter_id: String,
    /// Context sent with every call.
    pub context: Context,
    /// Overall invocation timeout in ms; -1 for none.
    pub invocation_timeout: i32,
    /// Proxies with different ids never share a connection.
    pub connection_id: String,
    /// Dispatch to local adapters directly.
    pub collocation_optimized: bool,
    /// Seconds; -1 forever, 0 never cache.
    pub locator_cache_timeout: i32,
    /// Order in which endpoints are tried.
    pub endpoint_selection: EndpointSelection,
}

fn proxy_error(input: &str, reason: impl Into<String>) -> Error {
    Error::ProxyParse {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn quote_if_needed(s: &str) -> Cow<'_, str> {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == ':' || c == '@') {
        Cow::Owned(format!("\"{s}\""))
    } else {
        Cow::Borrowed(s)
    }
}

fn next_arg(tokens: &mut impl Iterator<Item = String>, option: &str, input: &str) -> Result<String> {
    tokens
        .next()
        .ok_or_else(|| proxy_error(input, format!("option `{option}` requires an argument")))
}

/// Position and kind of the first `:` or `@` outside quotes.
fn find_target(s: &str) -> Result<Option<(usize, char)>> {
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' | '@' if !in_quotes => return Ok(Some((i, c))),
            _ => {}
        }
    }
    if in_quotes {
        return Err(proxy_error(s, "unterminated quote"));
    }
    Ok(None)
}

impl ReferenceData {
    /// A twoway reference to `identity` with the communicator's defaults.
    pub fn new(config: &CommunicatorConfig, identity: Identity) -> Self {
        ReferenceData {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            protocol: PROTOCOL_1_0,
            encoding: config.default_encoding,
            endpoints: Vec::new(),
            adapter_id: String::new(),
            context: Context::new(),
            invocation_timeout: config.invocation_timeout,
            connection_id: String::new(),
            collocation_optimized: config.collocation_optimized,
            locator_cache_timeout: config.locator_cache_timeout,
            endpoint_selection: config.endpoint_selection,
        }
    }

    /// Indirect references are resolved through a locator.
    pub fn is_indirect(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Parses the stringified form.
    pub fn parse(input: &str, config: &CommunicatorConfig) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() {
            return Err(proxy_error(input, "empty proxy string"));
        }
        let (head, target) = match find_target(s)? {
            Some((i, c)) => (&s[..i], Some((c, &s[i + 1..]))),
            None => (s, None),
        };
        let mut tokens = tokenize(head)
            .map_err(|e| proxy_error(input, e.to_string()))?
            .into_iter();
        let identity: Identity = tokens
            .next()
            .ok_or_else(|| proxy_error(input, "missing identity"))?
            .parse()?;
        if identity.name.is_empty() {
            return Err(proxy_error(input, "identity has an empty name"));
        }
        let mut data = ReferenceData::new(config, identity);
        while let Some(option) = tokens.next() {
            match option.as_str() {
                "-f" => data.facet = next_arg(&mut tokens, "-f", input)?,
                "-t" => data.mode = InvocationMode::Twoway,
                "-o" => data.mode = InvocationMode::Oneway,
                "-O" => data.mode = InvocationMode::BatchOneway,
                "-d" => data.mode = InvocationMode::Datagram,
                "-D" => data.mode = InvocationMode::BatchDatagram,
                "-s" => data.secure = true,
                "-e" => {
                    let raw = next_arg(&mut tokens, "-e", input)?;
                    data.encoding = raw
                        .parse()
                        .map_err(|_| proxy_error(input, format!("invalid encoding `{raw}`")))?;
                }
                "-p" => {
                    let raw = next_arg(&mut tokens, "-p", input)?;
                    data.protocol = raw
                        .parse()
                        .map_err(|_| proxy_error(input, format!("invalid protocol `{raw}`")))?;
                }
                other => return Err(proxy_error(input, format!("unknown option `{other}`"))),
            }
        }
        match target {
            None => {}
            Some((':', rest)) => {
                data.endpoints = parse_endpoint_list(rest, config.default_protocol, &config.default_host)?;
                if data.endpoints.is_empty() {
                    return Err(proxy_error(input, "no endpoint after `:`"));
                }
            }
            Some((_, rest)) => {
                let mut ids = tokenize(rest).map_err(|e| proxy_error(input, e.to_string()))?;
                if ids.len() != 1 || ids[0].is_empty() {
                    return Err(proxy_error(input, "expected one adapter id after `@`"));
                }
                data.adapter_id = ids.remove(0);
            }
        }
        Ok(data)
    }

    /// Writes everything but the identity, which the caller has written.
    pub fn encode_after_identity(&self, out: &mut OutputStream) {
        if self.facet.is_empty() {
            out.write_size(0);
        } else {
            out.write_size(1);
            out.write_string(&self.facet);
        }
        out.write_byte(self.mode as u8);
        out.write_bool(self.secure);
        if !out.encoding().is_1_0() {
            out.write_byte(self.protocol.major);
            out.write_byte(self.protocol.minor);
            out.write_byte(self.encoding.major);
            out.write_byte(self.encoding.minor);
        }
        out.write_size(self.endpoints.len());
        if self.endpoints.is_empty() {
            out.write_string(&self.adapter_id);
        } else {
            for endpoint in &self.endpoints {
                out.write(endpoint);
            }
        }
    }

    /// Reads the rest of a non-null proxy whose identity was already read.
    pub fn decode_after_identity(
        identity: Identity,
        input: &mut InputStream,
        config: &CommunicatorConfig,
    ) -> Result<Self> {
        let facet = match input.read_size()? {
            0 => String::new(),
            1 => input.read_string()?,
            n => return Err(Error::marshal(format!("proxy facet sequence with {n} elements"))),
        };
        let raw_mode = input.read_byte()?;
        let mode = InvocationMode::from_byte(raw_mode)
            .ok_or_else(|| Error::marshal(format!("invalid proxy mode {raw_mode}")))?;
        let secure = input.read_bool()?;
        let (protocol, encoding) = if input.encoding().is_1_0() {
            (PROTOCOL_1_0, ENCODING_1_0)
        } else {
            let protocol = ProtocolVersion::new(input.read_byte()?, input.read_byte()?);
            let encoding = EncodingVersion::new(input.read_byte()?, input.read_byte()?);
            (protocol, encoding)
        };
        // Smallest endpoint: a type code and an empty encapsulation.
        let count = input.read_and_check_seq_size(8)?;
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            endpoints.push(Endpoint::decode(input)?);
        }
        let adapter_id = if count == 0 { input.read_string()? } else { String::new() };
        Ok(ReferenceData {
            facet,
            mode,
            secure,
            protocol,
            encoding,
            endpoints,
            adapter_id,
            ..ReferenceData::new(config, identity)
        })
    }
}

impl fmt::Display for ReferenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = self.identity.to_string();
        write!(f, "{}", quote_if_needed(&identity))?;
        if !self.facet.is_empty() {
            write!(f, " -f {}", quote_if_needed(&self.facet))?;
        }
        write!(f, " {}", self.mode.option())?;
        if self.secure {
            write!(f, " -s")?;
        }
        if self.protocol != PROTOCOL_1_0 {
            write!(f, " -p {}", self.protocol)?;
        }
        write!(f, " -e {}", self.encoding)?;
        if !self.endpoints.is_empty() {
            for endpoint in &self.endpoints {
                write!(f, ":{endpoint}")?;
            }
        } else if !self.adapter_id.is_empty() {
            write!(f, " @ {}", quote_if_needed(&self.adapter_id))?;
        }
        Ok(())
    }
}

/// A reference plus the runtime state shared by clones of one proxy.
pub(crate) struct Reference {
    /// Owning communicator.
    pub communicator: Communicator,
    /// What the proxy targets and how.
    pub data: ReferenceData,
    /// Set for proxies bound to one connection (bidirectional use).
    pub fixed: Option<Arc<Connection>>,
    cached: Mutex<Weak<Connection>>,
    /// Batched requests waiting for a flush.
    pub batch: BatchRequestQueue,
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("data", &self.data)
            .field("fixed", &self.fixed.is_some())
            .finish()
    }
}

impl Reference {
    /// A reference, bound to `fixed` when given.
    pub fn new(communicator: Communicator, data: ReferenceData, fixed: Option<Arc<Connection>>) -> Self {
        let batch = BatchRequestQueue::new(
            communicator.config().batch_auto_flush_size,
            communicator.batch_interceptor(),
        );
        Reference {
            communicator,
            data,
            fixed,
            cached: Mutex::new(Weak::new()),
            batch,
        }
    }

    /// The connection used by the last invocation, while it still accepts
    /// requests.
    pub fn cached_connection(&self) -> Option<Arc<Connection>> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .filter(|c| c.is_active())
    }

    /// Remembers the connection of a successful attempt.
    pub fn set_cached_connection(&self, connection: &Arc<Connection>) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(connection);
    }

    /// Forgets the cached connection.
    pub fn clear_cached_connection(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Weak::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encode;
    use crate::endpoint::TransportKind;
    use crate::version::ENCODING_1_1;

    fn parse(s: &str) -> Result<ReferenceData> {
        ReferenceData::parse(s, &CommunicatorConfig::default())
    }

    #[test]
    fn test_direct_round_trip() {
        let s = "initial -t -e 1.1:tcp -h 127.0.0.1 -p 12010 -t 60000";
        let data = parse(s).unwrap();
        assert_eq!(data.identity, Identity::new("initial"));
        assert_eq!(data.endpoints.len(), 1);
        assert_eq!(data.to_string(), s);
    }

    #[test]
    fn test_options() {
        let data = parse("\"a b\" -f admin -O -s -e 1.0:ssl -p 4063:udp -p 4064").unwrap();
        assert_eq!(data.identity.name, "a b");
        assert_eq!(data.facet, "admin");
        assert_eq!(data.mode, InvocationMode::BatchOneway);
        assert!(data.secure);
        assert_eq!(data.encoding, ENCODING_1_0);
        assert_eq!(data.endpoints[1].transport(), Some(TransportKind::Udp));
        assert_eq!(parse(&data.to_string()).unwrap(), data);
    }

    #[test]
    fn test_indirect_and_well_known() {
        let data = parse("hello @ HelloAdapter").unwrap();
        assert_eq!(data.adapter_id, "HelloAdapter");
        assert!(data.is_indirect());
        assert_eq!(data.to_string(), "hello -t -e 1.1 @ HelloAdapter");

        let well_known = parse("hello").unwrap();
        assert!(well_known.adapter_id.is_empty());
        assert!(well_known.is_indirect());
    }

    #[test]
    fn test_quoted_endpoint_colon() {
        let data = parse("x:tcp -h \"::1\" -p 10000").unwrap();
        assert_eq!(data.endpoints[0].as_ip().unwrap().host, "::1");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(Error::ProxyParse { .. })));
        assert!(matches!(parse("x -z"), Err(Error::ProxyParse { .. })));
        assert!(matches!(parse("x -f"), Err(Error::ProxyParse { .. })));
        assert!(matches!(parse("x @"), Err(Error::ProxyParse { .. })));
        assert!(matches!(parse("x:"), Err(_)));
        assert!(parse("x:bogus -p 1").is_err());
    }

    #[test]
    fn test_wire_form() {
        let config = CommunicatorConfig::default();
        let data = parse("obj -f facet -o:tcp -h host -p 1").unwrap();
        let mut out = OutputStream::new(ENCODING_1_1);
        data.identity.encode(&mut out);
        data.encode_after_identity(&mut out);
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_1);
        let identity = Identity::decode(&mut input).unwrap();
        let decoded = ReferenceData::decode_after_identity(identity, &mut input, &config).unwrap();
        assert!(input.is_at_end());
        assert_eq!(decoded, data);

        let indirect = parse("obj @ adapter").unwrap();
        let mut out = OutputStream::new(ENCODING_1_0);
        indirect.identity.encode(&mut out);
        indirect.encode_after_identity(&mut out);
        let mut input = InputStream::new(out.finished().unwrap(), ENCODING_1_0);
        let identity = Identity::decode(&mut input).unwrap();
        let decoded = ReferenceData::decode_after_identity(identity, &mut input, &config).unwrap();
        assert_eq!(decoded.adapter_id, "adapter");
        assert_eq!(decoded.encoding, ENCODING_1_0);
    }
}
