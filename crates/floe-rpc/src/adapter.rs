//! Object adapters: servant registry, listening endpoints and dispatch.
//!
//! An adapter maps identities (and facets) to servants, optionally falls back
//! to default servants and servant locators per category, listens on its
//! endpoints once activated, and turns every incoming request into exactly
//! one [`ReplyBody`]. Servant failures, including panics, never reach the
//! connection's read loop.
//!
//! Lifecycle: `Created -> Active -> Deactivating -> Deactivated -> Destroyed`.
//! Deactivation stops the accept loops and ignores new requests, so their
//! senders retry elsewhere. It then waits for in-flight dispatches, warning
//! when they outlast the drain timeout, and gracefully closes the incoming
//! connections. The adapter stays `Deactivating` until its last dispatch
//! has finished.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{DecodeContext, Encapsulation, OutputStream, UserException};
use crate::communicator::{Communicator, WeakCommunicator};
use crate::config::AdapterConfig;
use crate::connection::{CloseMode, Connection};
use crate::drain::{DispatchGate, DrainOutcome};
use crate::endpoint::{parse_endpoint_list, Endpoint};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{ReplyBody, Request};
use crate::proxy::ObjectPrx;
use crate::reference::ReferenceData;
use crate::servant::{Cookie, Current, Servant, ServantLocator};
use crate::transport::{Acceptor, Channel};
use crate::version::EncodingVersion;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdapterState {
    /// Servants can be added; nothing is listening yet.
    Created,
    /// Accepting connections and dispatching.
    Active,
    /// Refusing new requests while in-flight dispatches finish.
    Deactivating,
    /// No dispatch is running and the connections are closed.
    Deactivated,
    /// Servants released.
    Destroyed,
}

tokio::task_local! {
    /// Identifies the adapter whose dispatch the current task is running.
    static DISPATCHING: usize;
}

type FacetMap = HashMap<String, Arc<dyn Servant>>;

struct AdapterInner {
    name: String,
    communicator: WeakCommunicator,
    config: AdapterConfig,
    /// Endpoints to listen on.
    endpoints: Vec<Endpoint>,
    /// Configured published endpoints, if any.
    published: Option<Vec<Endpoint>>,
    /// Endpoints as bound by `activate`.
    bound: RwLock<Vec<Endpoint>>,
    state: watch::Sender<AdapterState>,
    activation: AsyncMutex<()>,
    servants: RwLock<HashMap<Identity, FacetMap>>,
    default_servants: RwLock<HashMap<String, Arc<dyn Servant>>>,
    locators: RwLock<HashMap<String, Arc<dyn ServantLocator>>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    connections: Mutex<Vec<Weak<Connection>>>,
    gate: DispatchGate,
}

/// A handle to an object adapter. Clones share the adapter.
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("endpoints", &self.inner.endpoints.len())
            .finish()
    }
}

/// Where a request's servant came from.
enum Located {
    Servant(Arc<dyn Servant>),
    FromLocator {
        servant: Arc<dyn Servant>,
        locator: Arc<dyn ServantLocator>,
        cookie: Cookie,
    },
}

fn check_identity(id: &Identity) -> Result<()> {
    if id.name.is_empty() {
        return Err(Error::IdentityParse {
            input: id.to_string(),
            reason: "identity has an empty name".to_string(),
        });
    }
    Ok(())
}

fn describe(id: &Identity, facet: &str) -> String {
    if facet.is_empty() {
        id.to_string()
    } else {
        format!("{id} -f {facet}")
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "servant panicked".to_string()
    }
}

fn encode_user_exception(e: &dyn UserException, encoding: EncodingVersion) -> Result<Encapsulation> {
    let mut out = OutputStream::new(encoding);
    out.write_user_exception(e);
    Ok(Encapsulation::new(encoding, out.finished()?))
}

impl ObjectAdapter {
    pub(crate) fn new(name: String, communicator: &Communicator, config: AdapterConfig) -> Result<Self> {
        let defaults = communicator.config();
        let endpoints = parse_endpoint_list(&config.endpoints, defaults.default_protocol, &defaults.default_host)?;
        let published = config
            .published_endpoints
            .as_deref()
            .map(|s| parse_endpoint_list(s, defaults.default_protocol, &defaults.default_host))
            .transpose()?;
        let (state, _) = watch::channel(AdapterState::Created);
        let gate = DispatchGate::new(config.drain_timeout);
        Ok(ObjectAdapter {
            inner: Arc::new(AdapterInner {
                name,
                communicator: communicator.downgrade(),
                config,
                endpoints,
                published,
                bound: RwLock::new(Vec::new()),
                state,
                activation: AsyncMutex::new(()),
                servants: RwLock::new(HashMap::new()),
                default_servants: RwLock::new(HashMap::new()),
                locators: RwLock::new(HashMap::new()),
                accept_tasks: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                gate,
            }),
        })
    }

    /// The adapter name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The adapter id put into indirect proxies; empty for direct ones.
    pub fn adapter_id(&self) -> &str {
        &self.inner.config.adapter_id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.inner.state.borrow()
    }

    /// The owning communicator, unless it was dropped.
    pub fn communicator(&self) -> Result<Communicator> {
        self.inner
            .communicator
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)
    }

    /// Factories and limits for decoding request parameters.
    pub fn decode_context(&self) -> DecodeContext {
        self.inner
            .communicator
            .upgrade()
            .map(|c| c.decode_context())
            .unwrap_or_default()
    }

    fn check_not_deactivated(&self) -> Result<()> {
        if self.state() >= AdapterState::Deactivating {
            return Err(Error::AdapterDeactivated {
                name: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    /// Registers `servant` for the default facet of `id`.
    pub fn add(&self, servant: Arc<dyn Servant>, id: Identity) -> Result<ObjectPrx> {
        self.add_facet(servant, id, "")
    }

    /// Registers `servant` for one facet of `id` and returns a proxy to it.
    pub fn add_facet(&self, servant: Arc<dyn Servant>, id: Identity, facet: &str) -> Result<ObjectPrx> {
        self.check_not_deactivated()?;
        check_identity(&id)?;
        {
            let mut servants = write_lock(&self.inner.servants);
            let facets = servants.entry(id.clone()).or_default();
            if self.inner.config.strict && facets.contains_key(facet) {
                return Err(Error::AlreadyRegistered {
                    kind: "servant",
                    id: describe(&id, facet),
                });
            }
            facets.insert(facet.to_string(), servant);
        }
        debug!(adapter = %self.inner.name, identity = %id, facet, "servant added");
        Ok(self.create_proxy(id)?.with_facet(facet))
    }

    /// Registers `servant` under a fresh UUID identity.
    pub fn add_with_uuid(&self, servant: Arc<dyn Servant>) -> Result<ObjectPrx> {
        self.add(servant, Identity::random())
    }

    /// Serves every identity of `category` that has no explicit servant.
    pub fn add_default_servant(&self, servant: Arc<dyn Servant>, category: &str) -> Result<()> {
        self.check_not_deactivated()?;
        let mut defaults = write_lock(&self.inner.default_servants);
        if self.inner.config.strict && defaults.contains_key(category) {
            return Err(Error::AlreadyRegistered {
                kind: "default servant",
                id: category.to_string(),
            });
        }
        defaults.insert(category.to_string(), servant);
        Ok(())
    }

    /// Registers a servant locator for `category`; the empty category matches all.
    pub fn add_servant_locator(&self, locator: Arc<dyn ServantLocator>, category: &str) -> Result<()> {
        self.check_not_deactivated()?;
        let mut locators = write_lock(&self.inner.locators);
        if self.inner.config.strict && locators.contains_key(category) {
            return Err(Error::AlreadyRegistered {
                kind: "servant locator",
                id: category.to_string(),
            });
        }
        locators.insert(category.to_string(), locator);
        Ok(())
    }

    /// Removes the servant registered for `id` with no facet.
    pub fn remove(&self, id: &Identity) -> Result<Arc<dyn Servant>> {
        self.remove_facet(id, "")
    }

    /// Removes one facet of `id`.
    pub fn remove_facet(&self, id: &Identity, facet: &str) -> Result<Arc<dyn Servant>> {
        let mut servants = write_lock(&self.inner.servants);
        let removed = servants.get_mut(id).and_then(|facets| facets.remove(facet));
        if servants.get(id).is_some_and(HashMap::is_empty) {
            servants.remove(id);
        }
        removed.ok_or_else(|| Error::NotRegistered {
            kind: "servant",
            id: describe(id, facet),
        })
    }

    /// Removes every facet of `id`.
    pub fn remove_all_facets(&self, id: &Identity) -> Result<HashMap<String, Arc<dyn Servant>>> {
        write_lock(&self.inner.servants)
            .remove(id)
            .ok_or_else(|| Error::NotRegistered {
                kind: "servant",
                id: id.to_string(),
            })
    }

    /// Removes the default servant of `category`.
    pub fn remove_default_servant(&self, category: &str) -> Result<Arc<dyn Servant>> {
        write_lock(&self.inner.default_servants)
            .remove(category)
            .ok_or_else(|| Error::NotRegistered {
                kind: "default servant",
                id: category.to_string(),
            })
    }

    /// Removes the locator of `category` without deactivating it.
    pub fn remove_servant_locator(&self, category: &str) -> Result<Arc<dyn ServantLocator>> {
        write_lock(&self.inner.locators)
            .remove(category)
            .ok_or_else(|| Error::NotRegistered {
                kind: "servant locator",
                id: category.to_string(),
            })
    }

    /// The servant registered for `id` with no facet.
    pub fn find(&self, id: &Identity) -> Option<Arc<dyn Servant>> {
        self.find_facet(id, "")
    }

    /// The servant that would serve `id`/`facet`: explicit servant, then the
    /// default servant of the category, then the default servant for `""`.
    pub fn find_facet(&self, id: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let explicit = read_lock(&self.inner.servants)
            .get(id)
            .and_then(|facets| facets.get(facet))
            .cloned();
        explicit.or_else(|| {
            let defaults = read_lock(&self.inner.default_servants);
            defaults
                .get(&id.category)
                .or_else(|| defaults.get(""))
                .cloned()
        })
    }

    /// Every facet registered for `id`.
    pub fn find_all_facets(&self, id: &Identity) -> HashMap<String, Arc<dyn Servant>> {
        read_lock(&self.inner.servants)
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// The default servant of `category`.
    pub fn find_default_servant(&self, category: &str) -> Option<Arc<dyn Servant>> {
        read_lock(&self.inner.default_servants).get(category).cloned()
    }

    /// The locator registered for `category`.
    pub fn find_servant_locator(&self, category: &str) -> Option<Arc<dyn ServantLocator>> {
        read_lock(&self.inner.locators).get(category).cloned()
    }

    /// Endpoints put into direct proxies: the configured published
    /// endpoints, else the bound ones, else the configured ones.
    pub fn published_endpoints(&self) -> Vec<Endpoint> {
        if let Some(published) = &self.inner.published {
            return published.clone();
        }
        let bound = read_lock(&self.inner.bound);
        if bound.is_empty() {
            self.inner.endpoints.clone()
        } else {
            bound.clone()
        }
    }

    /// A proxy for `id`: indirect when the adapter has an adapter id, direct
    /// otherwise.
    pub fn create_proxy(&self, id: Identity) -> Result<ObjectPrx> {
        if self.inner.config.adapter_id.is_empty() {
            self.create_direct_proxy(id)
        } else {
            self.create_indirect_proxy(id)
        }
    }

    /// A proxy carrying the adapter endpoints, even when it has an adapter id.
    pub fn create_direct_proxy(&self, id: Identity) -> Result<ObjectPrx> {
        check_identity(&id)?;
        let communicator = self.communicator()?;
        let mut data = ReferenceData::new(communicator.config(), id);
        data.endpoints = self.published_endpoints();
        Ok(ObjectPrx::from_data(&communicator, data))
    }

    /// A proxy carrying the adapter id instead of endpoints.
    pub fn create_indirect_proxy(&self, id: Identity) -> Result<ObjectPrx> {
        check_identity(&id)?;
        let communicator = self.communicator()?;
        let mut data = ReferenceData::new(communicator.config(), id);
        data.adapter_id = self.inner.config.adapter_id.clone();
        Ok(ObjectPrx::from_data(&communicator, data))
    }

    /// Binds every endpoint and starts accepting connections.
    pub async fn activate(&self) -> Result<()> {
        let _activation = self.inner.activation.lock().await;
        match self.state() {
            AdapterState::Created => {}
            AdapterState::Active => return Ok(()),
            _ => {
                return Err(Error::AdapterDeactivated {
                    name: self.inner.name.clone(),
                })
            }
        }
        let communicator = self.communicator()?;
        let mut acceptors: Vec<Box<dyn Acceptor>> = Vec::with_capacity(self.inner.endpoints.len());
        for endpoint in &self.inner.endpoints {
            acceptors.push(communicator.transports().listen(endpoint).await?);
        }
        let bound: Vec<Endpoint> = acceptors.iter().map(|a| a.endpoint()).collect();
        *write_lock(&self.inner.bound) = bound.clone();

        let mut tasks = self.inner.accept_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for acceptor in acceptors {
            tasks.push(tokio::spawn(self.clone().accept_loop(acceptor)));
        }
        drop(tasks);
        self.inner.state.send_replace(AdapterState::Active);
        let endpoints: Vec<String> = bound.iter().map(ToString::to_string).collect();
        info!(adapter = %self.inner.name, endpoints = ?endpoints, "adapter activated");
        Ok(())
    }

    async fn accept_loop(self, acceptor: Box<dyn Acceptor>) {
        let endpoint = acceptor.endpoint();
        loop {
            match acceptor.accept().await {
                Ok(channel) => {
                    let adapter = self.clone();
                    let endpoint = endpoint.clone();
                    tokio::spawn(async move { adapter.serve(channel, endpoint).await });
                }
                Err(e) => {
                    warn!(adapter = %self.inner.name, endpoint = %endpoint, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn serve(&self, channel: Channel, endpoint: Endpoint) {
        let Ok(communicator) = self.communicator() else {
            return;
        };
        let options = communicator.connection_options(true, endpoint, String::new(), Some(self.clone()));
        let connection = match Connection::accept(channel, options).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(adapter = %self.inner.name, error = %e, "incoming connection failed validation");
                return;
            }
        };
        if self.state() >= AdapterState::Deactivating {
            connection.close(CloseMode::Gracefully).await;
            return;
        }
        let mut connections = self.inner.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
        connections.push(Arc::downgrade(&connection));
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether the calling task is inside one of this adapter's dispatches.
    fn in_own_dispatch(&self) -> bool {
        DISPATCHING.try_with(|key| *key == self.key()).unwrap_or(false)
    }

    /// Stops accepting, waits for in-flight dispatches and closes incoming
    /// connections gracefully. Concurrent calls wait for the first one.
    ///
    /// Called from one of the adapter's own dispatches, it starts the
    /// deactivation in the background and returns at once.
    pub async fn deactivate(&self) {
        if self.in_own_dispatch() {
            let adapter = self.clone();
            tokio::spawn(async move { adapter.deactivate_now().await });
            return;
        }
        self.deactivate_now().await;
    }

    async fn deactivate_now(&self) {
        let began = self.inner.state.send_if_modified(|state| {
            if *state < AdapterState::Deactivating {
                *state = AdapterState::Deactivating;
                true
            } else {
                false
            }
        });
        if !began {
            self.wait_for_deactivate().await;
            return;
        }
        for task in self
            .inner
            .accept_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if let DrainOutcome::Abandoned { remaining } = self.inner.gate.drain().await {
            warn!(adapter = %self.inner.name, remaining, "dispatches still running after drain timeout");
            self.inner.gate.wait_idle().await;
            info!(adapter = %self.inner.name, "late dispatches finished");
        }
        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        join_all(connections.iter().map(|c| c.close(CloseMode::Gracefully))).await;
        for connection in &connections {
            connection.set_adapter(None);
        }
        self.inner.state.send_replace(AdapterState::Deactivated);
        info!(adapter = %self.inner.name, "adapter deactivated");
    }

    /// Resolves once deactivation has completed.
    pub async fn wait_for_deactivate(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s >= AdapterState::Deactivated).await;
    }

    /// Deactivates, releases every servant and forgets the adapter's name.
    /// Calling it again has no effect. Like [`ObjectAdapter::deactivate`],
    /// it runs in the background when called from the adapter's own
    /// dispatch.
    pub async fn destroy(&self) {
        if self.in_own_dispatch() {
            let adapter = self.clone();
            tokio::spawn(async move { adapter.destroy_now().await });
            return;
        }
        self.destroy_now().await;
    }

    async fn destroy_now(&self) {
        self.deactivate_now().await;
        let destroyed = self.inner.state.send_if_modified(|state| {
            if *state == AdapterState::Deactivated {
                *state = AdapterState::Destroyed;
                true
            } else {
                false
            }
        });
        if !destroyed {
            return;
        }
        write_lock(&self.inner.servants).clear();
        write_lock(&self.inner.default_servants).clear();
        let locators: Vec<(String, Arc<dyn ServantLocator>)> =
            write_lock(&self.inner.locators).drain().collect();
        for (category, locator) in locators {
            locator.deactivate(&category).await;
        }
        if let Some(communicator) = self.inner.communicator.upgrade() {
            communicator.remove_adapter(&self.inner.name);
        }
        info!(adapter = %self.inner.name, "adapter destroyed");
    }

    /// Whether a proxy with `data` can be served by this adapter directly.
    pub(crate) fn is_local(&self, data: &ReferenceData) -> bool {
        if self.state() >= AdapterState::Deactivating {
            return false;
        }
        if !data.adapter_id.is_empty() {
            return data.adapter_id == self.inner.config.adapter_id;
        }
        if data.endpoints.is_empty() {
            return self.find_facet(&data.identity, &data.facet).is_some();
        }
        let ours = self.published_endpoints();
        let bound = read_lock(&self.inner.bound);
        data.endpoints.iter().any(|candidate| {
            let Some(candidate) = candidate.as_ip() else {
                return false;
            };
            ours.iter().chain(bound.iter()).filter_map(Endpoint::as_ip).any(|own| {
                own.transport == candidate.transport
                    && own.host == candidate.host
                    && own.port == candidate.port
            })
        })
    }

    /// Dispatches one request and produces its reply, or `None` when the
    /// adapter is deactivating and the request was not dispatched.
    pub(crate) async fn dispatch(&self, request: Request, connection: Option<Arc<Connection>>) -> Option<ReplyBody> {
        let Request { header, params } = request;
        let Some(_permit) = self.inner.gate.enter() else {
            debug!(adapter = %self.inner.name, operation = %header.operation, "adapter deactivating, request ignored");
            return None;
        };
        let current = Current {
            adapter: self.clone(),
            connection,
            id: header.identity,
            facet: header.facet,
            operation: header.operation,
            mode: header.mode,
            context: header.context,
            request_id: header.request_id,
            encoding: params.encoding,
        };
        let outcome = DISPATCHING
            .scope(self.key(), AssertUnwindSafe(self.dispatch_current(&current, params)).catch_unwind())
            .await;
        let body = match outcome {
            Ok(Ok(result)) => ReplyBody::Ok(result),
            Ok(Err(Error::User(e))) => {
                debug!(operation = %current.operation, exception = e.ice_id(), "user exception");
                match encode_user_exception(e.as_ref(), current.encoding) {
                    Ok(encaps) => ReplyBody::UserException(encaps),
                    Err(err) => {
                        warn!(operation = %current.operation, error = %err, "cannot encode user exception");
                        ReplyBody::UnknownUserException(e.ice_id().to_string())
                    }
                }
            }
            Ok(Err(e)) => {
                match e.kind() {
                    crate::error::ErrorKind::Dispatch => {
                        debug!(identity = %current.id, operation = %current.operation, error = %e, "dispatch fault")
                    }
                    _ => warn!(identity = %current.id, operation = %current.operation, error = %e, "dispatch failed"),
                }
                ReplyBody::from_error(&e)
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(identity = %current.id, operation = %current.operation, reason = %reason, "servant panicked");
                ReplyBody::UnknownException(reason)
            }
        };
        Some(body)
    }

    async fn dispatch_current(&self, current: &Current, params: Encapsulation) -> Result<Encapsulation> {
        match self.locate(current).await? {
            Some(Located::Servant(servant)) => invoke_servant(&servant, current, params).await,
            Some(Located::FromLocator {
                servant,
                locator,
                cookie,
            }) => {
                let result = invoke_servant(&servant, current, params).await;
                locator.finished(current, &servant, cookie).await;
                result
            }
            None => Err(self.not_found(current)),
        }
    }

    async fn locate(&self, current: &Current) -> Result<Option<Located>> {
        if let Some(servant) = self.find_facet(&current.id, &current.facet) {
            return Ok(Some(Located::Servant(servant)));
        }
        let mut categories = vec![current.id.category.as_str()];
        if !current.id.category.is_empty() {
            categories.push("");
        }
        for category in categories {
            let Some(locator) = self.find_servant_locator(category) else {
                continue;
            };
            if let Some((servant, cookie)) = locator.locate(current).await? {
                return Ok(Some(Located::FromLocator {
                    servant,
                    locator,
                    cookie,
                }));
            }
        }
        Ok(None)
    }

    fn not_found(&self, current: &Current) -> Error {
        let has_other_facets = read_lock(&self.inner.servants)
            .get(&current.id)
            .is_some_and(|facets| !facets.is_empty());
        if has_other_facets {
            Error::FacetNotExist {
                identity: current.id.clone(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
            }
        } else {
            Error::ObjectNotExist {
                identity: current.id.clone(),
                facet: current.facet.clone(),
                operation: current.operation.clone(),
            }
        }
    }
}

/// Answers the built-in operations, forwards the rest to the servant.
async fn invoke_servant(servant: &Arc<dyn Servant>, current: &Current, params: Encapsulation) -> Result<Encapsulation> {
    match current.operation.as_str() {
        "ice_ping" => Ok(current.empty()),
        "ice_isA" => {
            let mut input = current.reader(&params);
            let type_id = input.read_string()?;
            let is_a = servant.ice_is_a(&type_id);
            current.ok(|out| out.write_bool(is_a))
        }
        "ice_ids" => {
            let ids = servant.ice_ids();
            current.ok(|out| out.write_string_seq(&ids))
        }
        "ice_id" => {
            let id = servant.ice_id();
            current.ok(|out| out.write_string(&id))
        }
        _ => servant.dispatch(current, params).await,
    }
}
