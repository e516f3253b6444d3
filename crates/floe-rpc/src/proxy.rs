//! Proxies: local handles to remote objects.
//!
//! An [`ObjectPrx`] is an immutable value over a shared reference. `with_*`
//! methods return new proxies; clones share the cached connection and the
//! batch queue. Generated stubs wrap an `ObjectPrx` in a [`TypedProxy`] and
//! call [`ObjectPrx::invoke_typed`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::codec::{Context, Decode, Encapsulation, Encode, InputStream, OutputStream};
use crate::communicator::Communicator;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::invocation::{self, InvokeOptions, InvokeReply};
use crate::protocol::OperationMode;
use crate::reference::{EndpointSelection, InvocationMode, Reference, ReferenceData};
use crate::servant::OBJECT_TYPE_ID;
use crate::version::{EncodingVersion, ProtocolVersion};

/// A proxy to any object.
#[derive(Clone)]
pub struct ObjectPrx {
    reference: Arc<Reference>,
}

/// A proxy type for one interface, usually generated.
pub trait TypedProxy: Sized {
    /// Type id checked by [`ObjectPrx::checked_cast`].
    fn static_id() -> &'static str;

    /// Wraps an untyped proxy without checking its type.
    fn from_proxy(proxy: ObjectPrx) -> Self;

    /// The untyped proxy underneath.
    fn as_proxy(&self) -> &ObjectPrx;
}

impl TypedProxy for ObjectPrx {
    fn static_id() -> &'static str {
        OBJECT_TYPE_ID
    }

    fn from_proxy(proxy: ObjectPrx) -> Self {
        proxy
    }

    fn as_proxy(&self) -> &ObjectPrx {
        self
    }
}

impl ObjectPrx {
    pub(crate) fn from_data(communicator: &Communicator, data: ReferenceData) -> Self {
        ObjectPrx {
            reference: Arc::new(Reference::new(communicator.clone(), data, None)),
        }
    }

    /// A proxy bound to `connection`.
    pub(crate) fn fixed(communicator: &Communicator, identity: Identity, connection: Arc<Connection>) -> Self {
        let data = ReferenceData::new(communicator.config(), identity);
        ObjectPrx {
            reference: Arc::new(Reference::new(communicator.clone(), data, Some(connection))),
        }
    }

    pub(crate) fn reference(&self) -> &Reference {
        &self.reference
    }

    pub(crate) fn data(&self) -> &ReferenceData {
        &self.reference.data
    }

    fn derive(&self, update: impl FnOnce(&mut ReferenceData)) -> Self {
        let mut data = self.reference.data.clone();
        update(&mut data);
        if data == self.reference.data {
            return self.clone();
        }
        ObjectPrx {
            reference: Arc::new(Reference::new(
                self.reference.communicator.clone(),
                data,
                self.reference.fixed.clone(),
            )),
        }
    }

    /// The communicator the proxy belongs to.
    pub fn communicator(&self) -> &Communicator {
        &self.reference.communicator
    }

    /// Identity of the target object.
    pub fn identity(&self) -> &Identity {
        &self.data().identity
    }

    /// Target facet; empty for the default facet.
    pub fn facet(&self) -> &str {
        &self.data().facet
    }

    /// How calls are sent.
    pub fn mode(&self) -> InvocationMode {
        self.data().mode
    }

    /// Whether calls wait for a reply.
    pub fn is_twoway(&self) -> bool {
        self.mode().is_twoway()
    }

    /// Whether calls are queued until flushed.
    pub fn is_batch(&self) -> bool {
        self.mode().is_batch()
    }

    /// Whether only secure endpoints are used.
    pub fn is_secure(&self) -> bool {
        self.data().secure
    }

    /// Encoding used for parameters.
    pub fn encoding(&self) -> EncodingVersion {
        self.data().encoding
    }

    /// Protocol version of the requests.
    pub fn protocol(&self) -> ProtocolVersion {
        self.data().protocol
    }

    /// The endpoints of a direct proxy; empty for indirect ones.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.data().endpoints
    }

    /// Adapter id of an indirect proxy.
    pub fn adapter_id(&self) -> &str {
        &self.data().adapter_id
    }

    /// Context sent with every call.
    pub fn context(&self) -> &Context {
        &self.data().context
    }

    /// Overall invocation timeout in ms; -1 for none.
    pub fn invocation_timeout(&self) -> i32 {
        self.data().invocation_timeout
    }

    /// The connection id the connection was opened for.
    pub fn connection_id(&self) -> &str {
        &self.data().connection_id
    }

    /// Whether calls to an adapter of the same communicator skip the network.
    pub fn is_collocation_optimized(&self) -> bool {
        self.data().collocation_optimized
    }

    /// Seconds a locator answer stays cached; -1 forever.
    pub fn locator_cache_timeout(&self) -> i32 {
        self.data().locator_cache_timeout
    }

    /// Order in which endpoints are tried.
    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.data().endpoint_selection
    }

    /// Whether the proxy is bound to one connection.
    pub fn is_fixed(&self) -> bool {
        self.reference.fixed.is_some()
    }

    /// Whether endpoints come from a locator.
    pub fn is_indirect(&self) -> bool {
        !self.is_fixed() && self.data().is_indirect()
    }

    /// A copy targeting another object.
    pub fn with_identity(&self, identity: Identity) -> Self {
        self.derive(|d| d.identity = identity)
    }

    /// A copy targeting another facet.
    pub fn with_facet(&self, facet: &str) -> Self {
        self.derive(|d| d.facet = facet.to_string())
    }

    /// A copy with another invocation mode.
    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        self.derive(|d| d.mode = mode)
    }

    /// A twoway copy.
    pub fn with_twoway(&self) -> Self {
        self.with_mode(InvocationMode::Twoway)
    }

    /// A oneway copy.
    pub fn with_oneway(&self) -> Self {
        self.with_mode(InvocationMode::Oneway)
    }

    /// A batch oneway copy.
    pub fn with_batch_oneway(&self) -> Self {
        self.with_mode(InvocationMode::BatchOneway)
    }

    /// A datagram copy.
    pub fn with_datagram(&self) -> Self {
        self.with_mode(InvocationMode::Datagram)
    }

    /// A batch datagram copy.
    pub fn with_batch_datagram(&self) -> Self {
        self.with_mode(InvocationMode::BatchDatagram)
    }

    /// A copy restricted, or not, to secure endpoints.
    pub fn with_secure(&self, secure: bool) -> Self {
        self.derive(|d| d.secure = secure)
    }

    /// A copy encoding parameters with `encoding`.
    pub fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        self.derive(|d| d.encoding = encoding)
    }

    /// A direct proxy with `endpoints`.
    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.derive(|d| {
            d.endpoints = endpoints;
            d.adapter_id.clear();
        })
    }

    /// An indirect proxy resolved through `adapter_id`.
    pub fn with_adapter_id(&self, adapter_id: &str) -> Self {
        self.derive(|d| {
            d.adapter_id = adapter_id.to_string();
            d.endpoints.clear();
        })
    }

    /// A copy sending `context` with every call.
    pub fn with_context(&self, context: Context) -> Self {
        self.derive(|d| d.context = context)
    }

    /// Overall timeout in ms covering every attempt; -1 for none.
    pub fn with_invocation_timeout(&self, timeout_ms: i32) -> Self {
        self.derive(|d| d.invocation_timeout = if timeout_ms < 0 { -1 } else { timeout_ms })
    }

    /// A proxy that does not share connections with other connection ids.
    pub fn with_connection_id(&self, connection_id: &str) -> Self {
        self.derive(|d| d.connection_id = connection_id.to_string())
    }

    /// A copy with collocated dispatch enabled or disabled.
    pub fn with_collocation_optimized(&self, enabled: bool) -> Self {
        self.derive(|d| d.collocation_optimized = enabled)
    }

    /// A copy with another locator cache timeout.
    pub fn with_locator_cache_timeout(&self, seconds: i32) -> Self {
        self.derive(|d| d.locator_cache_timeout = seconds.max(-1))
    }

    /// A copy trying endpoints in another order.
    pub fn with_endpoint_selection(&self, selection: EndpointSelection) -> Self {
        self.derive(|d| d.endpoint_selection = selection)
    }

    /// The same target, bound to `connection`.
    pub fn with_fixed_connection(&self, connection: Arc<Connection>) -> Self {
        ObjectPrx {
            reference: Arc::new(Reference::new(
                self.reference.communicator.clone(),
                self.reference.data.clone(),
                Some(connection),
            )),
        }
    }

    /// Sends `operation` with already encoded parameters.
    pub async fn invoke(&self, operation: &str, mode: OperationMode, params: Encapsulation) -> Result<InvokeReply> {
        self.invoke_with(operation, mode, params, InvokeOptions::default()).await
    }

    /// Like [`ObjectPrx::invoke`], with per-call options.
    pub async fn invoke_with(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Encapsulation,
        options: InvokeOptions,
    ) -> Result<InvokeReply> {
        invocation::invoke(self, operation, mode, params, options).await
    }

    /// Encodes parameters with `write`, invokes, and decodes the result with
    /// `read`. User exceptions come back as [`Error::User`]. Non-twoway
    /// proxies run `read` over an empty result; operations that return
    /// something fail there with `TwowayOnly`.
    pub async fn invoke_typed<R, W, D>(&self, operation: &str, mode: OperationMode, write: W, read: D) -> Result<R>
    where
        W: FnOnce(&mut OutputStream),
        D: FnOnce(&mut InputStream) -> Result<R>,
    {
        let encoding = self.encoding();
        if !encoding.is_supported() {
            return Err(Error::UnsupportedEncoding { encoding });
        }
        let params = Encapsulation::build(encoding, write)?;
        let reply = self.invoke(operation, mode, params).await?;
        let mut input = reply.payload.reader(self.communicator().decode_context());
        if !reply.ok {
            return Err(Error::User(input.read_user_exception()?));
        }
        if !self.is_twoway() {
            return read(&mut input).map_err(|_| Error::TwowayOnly {
                operation: operation.to_string(),
            });
        }
        let result = read(&mut input)?;
        input.finish()?;
        Ok(result)
    }

    fn check_twoway(&self, operation: &str) -> Result<()> {
        if self.is_twoway() {
            Ok(())
        } else {
            Err(Error::TwowayOnly {
                operation: operation.to_string(),
            })
        }
    }

    /// Checks that the object exists.
    pub async fn ice_ping(&self) -> Result<()> {
        self.invoke_typed("ice_ping", OperationMode::Nonmutating, |_| {}, |_| Ok(()))
            .await
    }

    /// Whether the object implements `type_id`.
    pub async fn ice_is_a(&self, type_id: &str) -> Result<bool> {
        self.check_twoway("ice_isA")?;
        self.invoke_typed(
            "ice_isA",
            OperationMode::Nonmutating,
            |out| out.write_string(type_id),
            |input| input.read_bool(),
        )
        .await
    }

    /// Every type id the object implements.
    pub async fn ice_ids(&self) -> Result<Vec<String>> {
        self.check_twoway("ice_ids")?;
        self.invoke_typed("ice_ids", OperationMode::Nonmutating, |_| {}, |input| input.read_string_seq())
            .await
    }

    /// The most derived type id of the object.
    pub async fn ice_id(&self) -> Result<String> {
        self.check_twoway("ice_id")?;
        self.invoke_typed("ice_id", OperationMode::Nonmutating, |_| {}, |input| input.read_string())
            .await
    }

    /// Sends the requests queued by this proxy (or on its fixed connection)
    /// as one batch.
    pub async fn ice_flush_batch_requests(&self) -> Result<()> {
        if let Some(connection) = &self.reference.fixed {
            return connection.flush_batch_requests().await;
        }
        match self.reference.batch.swap() {
            Some(batch) => {
                let connection = invocation::connection_for(self).await?;
                connection.send_batch(batch).await
            }
            None => Ok(()),
        }
    }

    /// The connection invocations use, establishing it if needed.
    pub async fn ice_get_connection(&self) -> Result<Arc<Connection>> {
        invocation::connection_for(self).await
    }

    /// The connection used last, if it is still open.
    pub fn ice_get_cached_connection(&self) -> Option<Arc<Connection>> {
        match &self.reference.fixed {
            Some(fixed) => Some(fixed.clone()),
            None => self.reference.cached_connection(),
        }
    }

    /// Asks the object whether it implements `P` and returns a typed proxy
    /// if it does, `None` if it does not.
    pub async fn checked_cast<P: TypedProxy>(&self) -> Result<Option<P>> {
        let target = self.with_twoway();
        if target.ice_is_a(P::static_id()).await? {
            Ok(Some(P::from_proxy(self.clone())))
        } else {
            Ok(None)
        }
    }

    /// Like [`checked_cast`](Self::checked_cast) for another facet; a missing
    /// facet yields `None`.
    pub async fn checked_cast_facet<P: TypedProxy>(&self, facet: &str) -> Result<Option<P>> {
        let target = self.with_facet(facet);
        match target.with_twoway().ice_is_a(P::static_id()).await {
            Ok(true) => Ok(Some(P::from_proxy(target))),
            Ok(false) | Err(Error::FacetNotExist { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Converts without asking the object.
    pub fn unchecked_cast<P: TypedProxy>(&self) -> P {
        P::from_proxy(self.clone())
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        let same_fixed = match (&self.reference.fixed, &other.reference.fixed) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_fixed && self.reference.data == other.reference.data
    }
}

impl Eq for ObjectPrx {}

impl Hash for ObjectPrx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
        self.facet().hash(state);
    }
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.data(), f)
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPrx({self})")
    }
}

impl Encode for ObjectPrx {
    fn encode(&self, out: &mut OutputStream) {
        if self.is_fixed() {
            out.fail(Error::FeatureNotSupported {
                feature: "marshaling a proxy bound to a connection".to_string(),
            });
            return;
        }
        out.write(self.identity());
        self.data().encode_after_identity(out);
    }
}

impl Encode for Option<ObjectPrx> {
    fn encode(&self, out: &mut OutputStream) {
        match self {
            Some(proxy) => proxy.encode(out),
            None => out.write(&Identity::default()),
        }
    }
}

impl Decode for Option<ObjectPrx> {
    const MIN_WIRE_SIZE: usize = 2;

    fn decode(input: &mut InputStream) -> Result<Self> {
        let identity = Identity::decode(input)?;
        if identity.name.is_empty() {
            return Ok(None);
        }
        let communicator = input
            .communicator()
            .cloned()
            .ok_or_else(|| Error::marshal("cannot decode a proxy without a communicator"))?;
        let data = ReferenceData::decode_after_identity(identity, input, communicator.config())?;
        Ok(Some(ObjectPrx::from_data(&communicator, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodeContext;
    use crate::config::CommunicatorConfig;
    use crate::version::ENCODING_1_1;

    fn communicator() -> Communicator {
        Communicator::new(CommunicatorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_with_methods_return_new_values() {
        let communicator = communicator();
        let proxy = communicator
            .string_to_proxy("hello:tcp -h 127.0.0.1 -p 10000")
            .unwrap();
        let oneway = proxy.with_oneway();
        assert!(proxy.is_twoway());
        assert_eq!(oneway.mode(), InvocationMode::Oneway);
        assert_ne!(proxy, oneway);
        assert_eq!(proxy.with_twoway(), proxy);
        assert_eq!(proxy.with_facet("admin").facet(), "admin");
        assert!(proxy.with_adapter_id("Hello").is_indirect());
        assert_eq!(proxy.with_invocation_timeout(-5).invocation_timeout(), -1);
    }

    #[tokio::test]
    async fn test_proxy_encoding_needs_communicator() {
        let communicator = communicator();
        let proxy = communicator
            .string_to_proxy("hello -f admin:tcp -h 127.0.0.1 -p 10000")
            .unwrap();
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write(&Some(proxy.clone()));
        out.write(&None::<ObjectPrx>);
        let bytes = out.finished().unwrap();

        let mut input = InputStream::with_context(bytes.clone(), ENCODING_1_1, communicator.decode_context());
        assert_eq!(input.read::<Option<ObjectPrx>>().unwrap(), Some(proxy));
        assert_eq!(input.read::<Option<ObjectPrx>>().unwrap(), None);

        let mut bare = InputStream::with_context(bytes, ENCODING_1_1, DecodeContext::default());
        assert!(bare.read::<Option<ObjectPrx>>().is_err());
    }

    #[tokio::test]
    async fn test_twoway_only_builtins() {
        let communicator = communicator();
        let proxy = communicator
            .string_to_proxy("hello -o:tcp -h 127.0.0.1 -p 10000")
            .unwrap();
        assert!(matches!(proxy.ice_is_a("::X").await, Err(Error::TwowayOnly { .. })));
        assert!(matches!(proxy.ice_id().await, Err(Error::TwowayOnly { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_encoding_rejected_locally() {
        let communicator = communicator();
        let proxy = communicator
            .string_to_proxy("hello -e 2.0:tcp -h 127.0.0.1 -p 10000")
            .unwrap();
        assert!(matches!(proxy.ice_ping().await, Err(Error::UnsupportedEncoding { .. })));
    }
}
