//! The server-side seam: servants, servant locators and the per-request
//! [`Current`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::ObjectAdapter;
use crate::codec::{Context, DecodeContext, Encapsulation, InputStream, OutputStream};
use crate::connection::Connection;
use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::OperationMode;
use crate::version::EncodingVersion;

/// Type id every servant implements.
pub const OBJECT_TYPE_ID: &str = "::Ice::Object";

/// Information about the request being dispatched.
#[derive(Clone)]
pub struct Current {
    /// The adapter dispatching the request.
    pub adapter: ObjectAdapter,
    /// The connection the request arrived on; `None` for collocated calls.
    pub connection: Option<Arc<Connection>>,
    /// Identity of the target object.
    pub id: Identity,
    /// Target facet.
    pub facet: String,
    /// Operation name.
    pub operation: String,
    /// Operation mode; decides whether a sent request may be retried.
    pub mode: OperationMode,
    /// Context sent by the caller.
    pub context: Context,
    /// 0 for oneway and batched requests.
    pub request_id: i32,
    /// Encoding of the parameters, used for the reply as well.
    pub encoding: EncodingVersion,
}

impl std::fmt::Debug for Current {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Current")
            .field("adapter", &self.adapter.name())
            .field("id", &self.id)
            .field("facet", &self.facet)
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Current {
    /// Factories and limits for reading the parameters.
    pub fn decode_context(&self) -> DecodeContext {
        self.adapter.decode_context()
    }

    /// A reader over `params` that can decode classes, exceptions and proxies.
    pub fn reader(&self, params: &Encapsulation) -> InputStream {
        params.reader(self.decode_context())
    }

    /// Encodes a successful result.
    pub fn ok<F>(&self, write: F) -> Result<Encapsulation>
    where
        F: FnOnce(&mut OutputStream),
    {
        Encapsulation::build(self.encoding, write)
    }

    /// A successful result without return value or out parameters.
    pub fn empty(&self) -> Encapsulation {
        Encapsulation::empty(self.encoding)
    }

    /// Whether the caller waits for a reply.
    pub fn is_twoway(&self) -> bool {
        self.request_id != 0
    }
}

/// An object implementation registered with an adapter.
///
/// `ice_ping`, `ice_isA`, `ice_ids` and `ice_id` are answered by the adapter
/// from [`Servant::ice_ids`]; every other operation reaches
/// [`Servant::dispatch`]. Returning [`crate::Error::User`] sends a user
/// exception, the dispatch variants of [`crate::Error`] send the matching
/// fault, and anything else arrives as an unknown local exception.
#[async_trait]
pub trait Servant: Send + Sync + 'static {
    /// Most-derived type id.
    fn ice_id(&self) -> String;

    /// All implemented type ids, sorted.
    fn ice_ids(&self) -> Vec<String> {
        let mut ids = vec![OBJECT_TYPE_ID.to_string(), self.ice_id()];
        ids.sort();
        ids.dedup();
        ids
    }

    /// Whether `type_id` is among [`Servant::ice_ids`].
    fn ice_is_a(&self, type_id: &str) -> bool {
        self.ice_ids().iter().any(|id| id == type_id)
    }

    /// Runs a user operation and returns the encapsulated results.
    async fn dispatch(&self, current: &Current, params: Encapsulation) -> Result<Encapsulation>;
}

/// State a locator passes from `locate` to `finished`.
pub type Cookie = Option<Box<dyn Any + Send + Sync>>;

/// Supplies servants on demand for one category.
#[async_trait]
pub trait ServantLocator: Send + Sync + 'static {
    /// The servant for `current`, or `None` for object-not-exist.
    async fn locate(&self, current: &Current) -> Result<Option<(Arc<dyn Servant>, Cookie)>>;

    /// Called after the dispatch of a located servant.
    async fn finished(&self, _current: &Current, _servant: &Arc<dyn Servant>, _cookie: Cookie) {}

    /// Called when the adapter is destroyed.
    async fn deactivate(&self, _category: &str) {}
}
