use std::sync::Arc;

use thiserror::Error;

use crate::codec::{OptionalFormat, UserException};
use crate::identity::Identity;
use crate::version::{EncodingVersion, ProtocolVersion};

/// Broad failure category, used by the retry engine and by callers that only
/// care whether something was unreachable, timed out or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Corrupt or truncated data; fatal to the connection that carried it.
    Marshal,
    /// Version mismatch or unexpected message; fatal to the connection.
    Protocol,
    /// Connect refused, reset, lost; retryable per policy.
    Transport,
    /// Object, facet or operation not found on the server.
    Dispatch,
    /// Domain fault raised by the remote operation.
    Application,
    /// Invocation deadline or per-request timeout expired.
    Timeout,
    /// Caller cancelled the invocation.
    Cancelled,
    /// Local misuse or lifecycle errors.
    Local,
}

/// Everything that can go wrong in the runtime.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("unmarshal out of bounds: needed {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },

    #[error("marshal error: {reason}")]
    Marshal { reason: String },

    #[error("no value factory for type id `{type_id}`")]
    NoValueFactory { type_id: String },

    #[error("encoding version {encoding} is not supported")]
    UnsupportedEncoding { encoding: EncodingVersion },

    #[error("bad magic in message header: {got:02X?}")]
    BadMagic { got: [u8; 4] },

    #[error("protocol version {version} is not supported")]
    UnsupportedProtocol { version: ProtocolVersion },

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("message of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("optional member {tag} has wire format {found:?}, expected {expected:?}")]
    OptionalFormatMismatch {
        tag: u32,
        expected: OptionalFormat,
        found: OptionalFormat,
    },

    #[error("compressed messages are not supported")]
    CompressionNotSupported,

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("connection refused to {endpoint}")]
    ConnectionRefused { endpoint: String },

    #[error("connect timeout after {timeout_ms}ms to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("cannot resolve host `{host}`")]
    DnsFailure { host: String },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("connection closed by peer")]
    ConnectionClosedByPeer,

    #[error("connection timed out (no traffic within the idle window)")]
    ConnectionTimeout,

    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("no usable endpoint for proxy `{proxy}`")]
    NoEndpoint { proxy: String },

    #[error("TLS failure: {reason}")]
    Tls { reason: String },

    #[error("object `{identity}` does not exist (facet `{facet}`, operation `{operation}`)")]
    ObjectNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("facet `{facet}` does not exist on `{identity}` (operation `{operation}`)")]
    FacetNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("operation `{operation}` does not exist on `{identity}` (facet `{facet}`)")]
    OperationNotExist {
        identity: Identity,
        facet: String,
        operation: String,
    },

    #[error("unknown local exception: {reason}")]
    UnknownLocal { reason: String },

    #[error("unknown user exception: {reason}")]
    UnknownUser { reason: String },

    #[error("unknown exception: {reason}")]
    Unknown { reason: String },

    #[error("user exception `{}`", .0.ice_id())]
    User(Arc<dyn UserException>),

    #[error("invocation timed out")]
    InvocationTimeout,

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: i32, timeout_ms: u64 },

    #[error("invocation cancelled")]
    Cancelled,

    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    #[error("object adapter `{name}` is deactivated")]
    AdapterDeactivated { name: String },

    #[error("{kind} `{id}` is already registered")]
    AlreadyRegistered { kind: &'static str, id: String },

    #[error("{kind} `{id}` is not registered")]
    NotRegistered { kind: &'static str, id: String },

    #[error("cannot parse proxy `{input}`: {reason}")]
    ProxyParse { input: String, reason: String },

    #[error("cannot parse endpoint `{input}`: {reason}")]
    EndpointParse { input: String, reason: String },

    #[error("cannot parse identity `{input}`: {reason}")]
    IdentityParse { input: String, reason: String },

    #[error("invalid value `{value}` for property `{key}`")]
    InvalidProperty { key: String, value: String },

    #[error("operation `{operation}` requires a twoway proxy")]
    TwowayOnly { operation: String },

    #[error("feature not supported: {feature}")]
    FeatureNotSupported { feature: String },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfBounds { .. }
            | Error::Marshal { .. }
            | Error::NoValueFactory { .. }
            | Error::UnsupportedEncoding { .. } => ErrorKind::Marshal,
            Error::BadMagic { .. }
            | Error::UnsupportedProtocol { .. }
            | Error::UnknownMessageType(_)
            | Error::MessageTooLarge { .. }
            | Error::OptionalFormatMismatch { .. }
            | Error::CompressionNotSupported
            | Error::Protocol { .. } => ErrorKind::Protocol,
            Error::ConnectionRefused { .. }
            | Error::ConnectTimeout { .. }
            | Error::DnsFailure { .. }
            | Error::ConnectionLost { .. }
            | Error::ConnectionClosedByPeer
            | Error::ConnectionTimeout
            | Error::ConnectionClosed { .. }
            | Error::Io(_)
            | Error::NoEndpoint { .. }
            | Error::Tls { .. } => ErrorKind::Transport,
            Error::ObjectNotExist { .. }
            | Error::FacetNotExist { .. }
            | Error::OperationNotExist { .. }
            | Error::UnknownLocal { .. }
            | Error::UnknownUser { .. }
            | Error::Unknown { .. } => ErrorKind::Dispatch,
            Error::User(_) => ErrorKind::Application,
            Error::InvocationTimeout | Error::RequestTimeout { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::CommunicatorDestroyed
            | Error::AdapterDeactivated { .. }
            | Error::AlreadyRegistered { .. }
            | Error::NotRegistered { .. }
            | Error::ProxyParse { .. }
            | Error::EndpointParse { .. }
            | Error::IdentityParse { .. }
            | Error::InvalidProperty { .. }
            | Error::TwowayOnly { .. }
            | Error::FeatureNotSupported { .. } => ErrorKind::Local,
        }
    }

    /// Whether a connection that produced this error must be closed.
    pub fn closes_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Marshal | ErrorKind::Protocol)
    }

    /// Shorthand for a marshal error with a reason.
    pub fn marshal(reason: impl Into<String>) -> Self {
        Error::Marshal {
            reason: reason.into(),
        }
    }

    /// Shorthand for a protocol error with a reason.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol {
            reason: reason.into(),
        }
    }

    /// Downcasts an application error to a concrete user exception type.
    pub fn user_exception<E: UserException>(&self) -> Option<&E> {
        match self {
            Error::User(e) => e.as_any().downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        match e.kind() {
            IoKind::ConnectionRefused => Error::ConnectionRefused {
                endpoint: e.to_string(),
            },
            IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::BrokenPipe
            | IoKind::UnexpectedEof => Error::ConnectionLost {
                reason: e.to_string(),
            },
            _ => Error::Io(Arc::new(e)),
        }
    }
}
