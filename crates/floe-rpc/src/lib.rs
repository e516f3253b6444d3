#![warn(missing_docs)]

//! Floe RPC core: Ice-compatible encoding, connections, proxies, retries and object adapters
//!
//! Client path: ObjectPrx → Invocation (retry, deadline, cancel) → ConnectionPool → Connection → Transport
//! Server path: Transport → Connection → ObjectAdapter → Servant → reply

pub mod acm;
pub mod adapter;
pub mod batch;
pub mod cancel;
pub mod codec;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod drain;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod info;
pub mod invocation;
pub mod locator;
pub mod logging;
pub mod metrics;
pub mod outgoing;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod reference;
pub mod retry;
pub mod servant;
pub mod transport;
pub mod version;

pub use acm::{AcmConfig, ClosePolicy, HeartbeatPolicy};
pub use adapter::{AdapterState, ObjectAdapter};
pub use batch::{BatchDecision, BatchInterceptor, BatchRequest};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use codec::{
    Context, Decode, DecodeContext, Encapsulation, Encode, InputStream, OutputStream, UserException,
};
pub use communicator::Communicator;
pub use config::{AdapterConfig, CommunicatorConfig, Properties};
pub use connection::{CloseMode, Connection, ConnectionState};
pub use deadline::Deadline;
pub use endpoint::{Endpoint, IpEndpoint, TransportKind};
pub use error::{Error, ErrorKind, Result};
pub use identity::Identity;
pub use info::{ConnectionInfo, IpInfo, LayerInfo};
pub use invocation::{InvocationState, InvokeOptions, InvokeReply};
pub use locator::{Locator, RemoteLocator};
pub use logging::try_init_logging;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::PoolStats;
pub use protocol::OperationMode;
pub use proxy::{ObjectPrx, TypedProxy};
pub use reference::{EndpointSelection, InvocationMode};
pub use retry::RetryConfig;
pub use servant::{Cookie, Current, Servant, ServantLocator};
pub use transport::{NetworkProxy, TlsConfig};
pub use version::{EncodingVersion, ProtocolVersion, ENCODING_1_0, ENCODING_1_1, PROTOCOL_1_0};
