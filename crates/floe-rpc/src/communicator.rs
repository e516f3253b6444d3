//! The communicator: root object of the runtime.
//!
//! It owns the configuration, the transports, the outgoing connection pool,
//! the value and exception factories, the default locator and every object
//! adapter. Proxies and adapters hold it; connections only hold a
//! [`WeakCommunicator`] so dropping the last handle tears everything down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info};

use crate::adapter::ObjectAdapter;
use crate::batch::BatchInterceptor;
use crate::codec::{DecodeContext, ExceptionFactoryRegistry, ValueFactoryRegistry};
use crate::config::{AdapterConfig, CommunicatorConfig, Properties};
use crate::connection::{CloseMode, Connection, ConnectionConfig, ConnectionOptions};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::locator::{Locator, LocatorInfo};
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::proxy::ObjectPrx;
use crate::reference::ReferenceData;
use crate::retry::RetryExecutor;
use crate::transport::{TransportConfig, TransportRegistry};

struct CommunicatorInner {
    config: CommunicatorConfig,
    transports: TransportRegistry,
    pool: ConnectionPool,
    metrics: Arc<Metrics>,
    values: Arc<ValueFactoryRegistry>,
    exceptions: Arc<ExceptionFactoryRegistry>,
    retry: RetryExecutor,
    adapters: RwLock<HashMap<String, ObjectAdapter>>,
    locator: RwLock<Option<Arc<LocatorInfo>>>,
    batch_interceptor: RwLock<Option<BatchInterceptor>>,
    destroyed: AtomicBool,
}

/// A handle to the runtime. Clones share it.
#[derive(Clone)]
pub struct Communicator {
    inner: Arc<CommunicatorInner>,
}

/// A non-owning handle held by connections and adapters.
#[derive(Clone, Default)]
pub(crate) struct WeakCommunicator(Weak<CommunicatorInner>);

impl WeakCommunicator {
    /// The communicator, while it is alive.
    pub fn upgrade(&self) -> Option<Communicator> {
        self.0.upgrade().map(|inner| Communicator { inner })
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("transports", &self.inner.transports)
            .field("pool", &self.inner.pool)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Communicator {
    /// Creates a communicator with the built-in transports.
    pub fn new(config: CommunicatorConfig) -> Result<Self> {
        let transport_config = TransportConfig {
            connect_timeout: config.connect_timeout,
            message_size_max: config.message_size_max,
            network_proxy: config.network_proxy.clone(),
            ..TransportConfig::default()
        };
        let transports = TransportRegistry::with_defaults(transport_config, config.tls.clone())?;
        Ok(Self::with_transports(config, transports))
    }

    /// Reads the configuration from `properties`.
    pub fn with_properties(properties: Properties) -> Result<Self> {
        Self::new(CommunicatorConfig::from_properties(properties)?)
    }

    /// Creates a communicator using exactly `transports`.
    pub fn with_transports(config: CommunicatorConfig, transports: TransportRegistry) -> Self {
        info!(transports = ?transports, "communicator created");
        Communicator {
            inner: Arc::new(CommunicatorInner {
                retry: RetryExecutor::new(config.retry.clone()),
                config,
                transports,
                pool: ConnectionPool::new(),
                metrics: Arc::new(Metrics::new()),
                values: Arc::new(ValueFactoryRegistry::default()),
                exceptions: Arc::new(ExceptionFactoryRegistry::default()),
                adapters: RwLock::new(HashMap::new()),
                locator: RwLock::new(None),
                batch_interceptor: RwLock::new(None),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCommunicator {
        WeakCommunicator(Arc::downgrade(&self.inner))
    }

    /// Settings read at creation.
    pub fn config(&self) -> &CommunicatorConfig {
        &self.inner.config
    }

    /// The properties the communicator was created with.
    pub fn properties(&self) -> &Properties {
        &self.inner.config.properties
    }

    /// Transports available to proxies and adapters.
    pub fn transports(&self) -> &TransportRegistry {
        &self.inner.transports
    }

    /// Outgoing connections shared by all proxies.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Counters shared by every connection and invocation.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Factories for classes decoded by this communicator's streams.
    pub fn value_factories(&self) -> &Arc<ValueFactoryRegistry> {
        &self.inner.values
    }

    /// Factories for user exceptions decoded by this communicator's streams.
    pub fn exception_factories(&self) -> &Arc<ExceptionFactoryRegistry> {
        &self.inner.exceptions
    }

    /// Everything an input stream needs to decode classes, exceptions and
    /// proxies for this communicator.
    pub fn decode_context(&self) -> DecodeContext {
        DecodeContext {
            values: self.inner.values.clone(),
            exceptions: self.inner.exceptions.clone(),
            communicator: Some(self.clone()),
            slice_values: true,
        }
    }

    pub(crate) fn retry_executor(&self) -> &RetryExecutor {
        &self.inner.retry
    }

    /// The interceptor new batch queues are created with.
    pub fn batch_interceptor(&self) -> Option<BatchInterceptor> {
        read(&self.inner.batch_interceptor).clone()
    }

    /// Installs the interceptor consulted by batch queues created from now on.
    pub fn set_batch_interceptor(&self, interceptor: Option<BatchInterceptor>) {
        *write(&self.inner.batch_interceptor) = interceptor;
    }

    pub(crate) fn connection_options(
        &self,
        incoming: bool,
        endpoint: Endpoint,
        connection_id: String,
        adapter: Option<ObjectAdapter>,
    ) -> ConnectionOptions {
        let mut config = ConnectionConfig::from_communicator(&self.inner.config);
        if config.connect_timeout.is_none() {
            config.connect_timeout = u64::try_from(endpoint.timeout_ms())
                .ok()
                .map(Duration::from_millis);
        }
        ConnectionOptions {
            incoming,
            endpoint,
            connection_id,
            adapter,
            config,
            metrics: self.inner.metrics.clone(),
            communicator: self.downgrade(),
            batch_interceptor: self.batch_interceptor(),
        }
    }

    pub(crate) async fn get_connection(&self, endpoints: &[Endpoint], connection_id: &str) -> Result<Arc<Connection>> {
        self.inner.pool.get(self, endpoints, connection_id).await
    }

    /// Whether `destroy` has started.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn check_destroyed(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::CommunicatorDestroyed)
        } else {
            Ok(())
        }
    }

    /// Parses a stringified proxy.
    pub fn string_to_proxy(&self, s: &str) -> Result<ObjectPrx> {
        self.check_destroyed()?;
        if s.trim().is_empty() {
            return Err(Error::ProxyParse {
                input: s.to_string(),
                reason: "empty proxy string".to_string(),
            });
        }
        let data = ReferenceData::parse(s, &self.inner.config)?;
        Ok(ObjectPrx::from_data(self, data))
    }

    /// The stringified form of `proxy`; `""` for none.
    pub fn proxy_to_string(&self, proxy: Option<&ObjectPrx>) -> String {
        proxy.map(ToString::to_string).unwrap_or_default()
    }

    /// Reads a proxy from the property `key`.
    pub fn property_to_proxy(&self, key: &str) -> Result<Option<ObjectPrx>> {
        match self.properties().get(key) {
            Some(value) if !value.trim().is_empty() => self.string_to_proxy(value).map(Some),
            _ => Ok(None),
        }
    }

    /// Creates an adapter configured from the `<name>.*` properties. An
    /// empty name creates an anonymous adapter without endpoints, e.g. for
    /// collocated or bidirectional use.
    pub fn create_object_adapter(&self, name: &str) -> Result<ObjectAdapter> {
        let config = AdapterConfig::from_properties(name, self.properties())?;
        self.register_adapter(name, config)
    }

    /// Like [`create_object_adapter`](Self::create_object_adapter) with the
    /// endpoints given here instead of `<name>.Endpoints`.
    pub fn create_object_adapter_with_endpoints(&self, name: &str, endpoints: &str) -> Result<ObjectAdapter> {
        let mut config = AdapterConfig::from_properties(name, self.properties())?;
        config.endpoints = endpoints.trim().to_string();
        self.register_adapter(name, config)
    }

    fn register_adapter(&self, name: &str, config: AdapterConfig) -> Result<ObjectAdapter> {
        self.check_destroyed()?;
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            name.to_string()
        };
        let mut adapters = write(&self.inner.adapters);
        if adapters.contains_key(&name) {
            return Err(Error::AlreadyRegistered {
                kind: "object adapter",
                id: name,
            });
        }
        let adapter = ObjectAdapter::new(name.clone(), self, config)?;
        adapters.insert(name.clone(), adapter.clone());
        debug!(adapter = %name, "object adapter created");
        Ok(adapter)
    }

    pub(crate) fn remove_adapter(&self, name: &str) {
        write(&self.inner.adapters).remove(name);
    }

    /// The adapter registered under `name`.
    pub fn find_object_adapter(&self, name: &str) -> Option<ObjectAdapter> {
        read(&self.inner.adapters).get(name).cloned()
    }

    /// An adapter of this communicator that serves `data` directly.
    pub(crate) fn find_collocated_adapter(&self, data: &ReferenceData) -> Option<ObjectAdapter> {
        read(&self.inner.adapters)
            .values()
            .find(|adapter| adapter.is_local(data))
            .cloned()
    }

    /// Sets the locator used to resolve indirect proxies; `None` removes it.
    /// Replacing the locator drops its cache.
    pub fn set_default_locator(&self, locator: Option<Arc<dyn Locator>>) {
        *write(&self.inner.locator) = locator.map(|l| Arc::new(LocatorInfo::new(l)));
    }

    /// The locator used for indirect proxies.
    pub fn default_locator(&self) -> Option<Arc<dyn Locator>> {
        read(&self.inner.locator).as_ref().map(|info| info.locator().clone())
    }

    pub(crate) fn locator_info(&self) -> Option<Arc<LocatorInfo>> {
        read(&self.inner.locator).clone()
    }

    /// Sends the batch queues of every outgoing connection. Queues held by
    /// proxies are flushed with [`ObjectPrx::ice_flush_batch_requests`].
    pub async fn flush_batch_requests(&self) -> Result<()> {
        self.check_destroyed()?;
        self.inner.pool.flush_batch_requests().await
    }

    /// Destroys every adapter and closes every connection. Later calls do
    /// nothing; later invocations fail with `CommunicatorDestroyed`.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let adapters: Vec<ObjectAdapter> = read(&self.inner.adapters).values().cloned().collect();
        join_all(adapters.iter().map(ObjectAdapter::destroy)).await;
        self.inner.pool.close_all(CloseMode::Gracefully).await;
        write(&self.inner.locator).take();
        info!("communicator destroyed");
    }
}
