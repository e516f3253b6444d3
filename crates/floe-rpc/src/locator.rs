//! Endpoint resolution for indirect proxies.
//!
//! A [`Locator`] maps adapter ids and well-known object identities to
//! proxies carrying endpoints. [`LocatorInfo`] fronts the communicator's
//! default locator with a cache honouring each proxy's locator cache
//! timeout, and lets only one lookup per key run at a time so concurrent
//! invocations resolve once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::codec::OutputStream;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::OperationMode;
use crate::proxy::ObjectPrx;
use crate::reference::ReferenceData;

/// Type id of the locator interface.
pub const LOCATOR_TYPE_ID: &str = "::Ice::Locator";
const OBJECT_NOT_FOUND: &str = "::Ice::ObjectNotFoundException";
const ADAPTER_NOT_FOUND: &str = "::Ice::AdapterNotFoundException";

/// Resolves indirect proxies.
#[async_trait]
pub trait Locator: Send + Sync + 'static {
    /// A proxy for the well-known object `id`, or `None` if unknown.
    async fn find_object_by_id(&self, id: &Identity) -> Result<Option<ObjectPrx>>;

    /// A proxy whose endpoints reach the adapter, or `None` if unknown.
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<ObjectPrx>>;
}

/// A locator service reached through a proxy.
#[derive(Debug, Clone)]
pub struct RemoteLocator {
    proxy: ObjectPrx,
}

impl RemoteLocator {
    /// Wraps a proxy to a locator object.
    pub fn new(proxy: ObjectPrx) -> Self {
        RemoteLocator { proxy }
    }

    /// The locator object's proxy.
    pub fn proxy(&self) -> &ObjectPrx {
        &self.proxy
    }

    async fn find<W>(&self, operation: &str, not_found: &str, write: W) -> Result<Option<ObjectPrx>>
    where
        W: FnOnce(&mut OutputStream) + Send,
    {
        let result = self
            .proxy
            .invoke_typed(operation, OperationMode::Nonmutating, write, |input| {
                input.read::<Option<ObjectPrx>>()
            })
            .await;
        match result {
            Err(Error::User(e)) if e.ice_id() == not_found => Ok(None),
            Err(Error::UnknownUser { reason }) if reason == not_found => Ok(None),
            other => other,
        }
    }
}

#[async_trait]
impl Locator for RemoteLocator {
    async fn find_object_by_id(&self, id: &Identity) -> Result<Option<ObjectPrx>> {
        self.find("findObjectById", OBJECT_NOT_FOUND, |out| out.write(id))
            .await
    }

    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<ObjectPrx>> {
        self.find("findAdapterById", ADAPTER_NOT_FOUND, |out| out.write_string(adapter_id))
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Adapter(String),
    Object(Identity),
}

/// What a lookup yielded: endpoints, or for objects possibly an adapter id.
#[derive(Debug, Clone)]
struct Resolved {
    endpoints: Vec<Endpoint>,
    adapter_id: String,
}

struct CacheEntry {
    resolved: Resolved,
    inserted: Instant,
}

/// Lookup results with per-read time-to-live.
#[derive(Default)]
struct LocatorCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl LocatorCache {
    /// Entry for `key` if younger than `ttl` seconds; negative means forever,
    /// zero never hits.
    fn get(&self, key: &CacheKey, ttl: i32) -> Option<Resolved> {
        if ttl == 0 {
            return None;
        }
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        let fresh = match u64::try_from(ttl) {
            Ok(secs) => entry.inserted.elapsed() < Duration::from_secs(secs),
            Err(_) => true,
        };
        fresh.then(|| entry.resolved.clone())
    }

    fn insert(&self, key: CacheKey, resolved: Resolved) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(
            key,
            CacheEntry {
                resolved,
                inserted: Instant::now(),
            },
        );
    }

    fn remove(&self, key: &CacheKey) -> Option<Resolved> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|e| e.resolved)
    }
}

type Gates = Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>;

/// One lookup's hold on the gate of its key. Dropping it forgets the gate
/// once no other lookup uses it.
struct GateTurn<'a> {
    gates: &'a Gates,
    key: &'a CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateTurn<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if gates.get(self.key).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(self.key);
        }
    }
}

/// The default locator plus its cache.
pub(crate) struct LocatorInfo {
    locator: Arc<dyn Locator>,
    cache: LocatorCache,
    /// Serializes lookups per key while any is in progress.
    gates: Gates,
}

impl fmt::Debug for LocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache.entries.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("LocatorInfo").field("cached", &cached).finish()
    }
}

impl LocatorInfo {
    /// Fronts `locator` with an empty cache.
    pub fn new(locator: Arc<dyn Locator>) -> Self {
        LocatorInfo {
            locator,
            cache: LocatorCache::default(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// The locator being fronted.
    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.locator
    }

    /// Endpoints for an indirect proxy.
    pub async fn resolve(&self, data: &ReferenceData) -> Result<Vec<Endpoint>> {
        let ttl = data.locator_cache_timeout;
        if !data.adapter_id.is_empty() {
            return self.resolve_adapter(&data.adapter_id, ttl).await;
        }
        let key = CacheKey::Object(data.identity.clone());
        let resolved = self.lookup(key, ttl).await?.ok_or_else(|| Error::NotRegistered {
            kind: "object",
            id: data.identity.to_string(),
        })?;
        if resolved.endpoints.is_empty() && !resolved.adapter_id.is_empty() {
            return self.resolve_adapter(&resolved.adapter_id, ttl).await;
        }
        Ok(resolved.endpoints)
    }

    async fn resolve_adapter(&self, adapter_id: &str, ttl: i32) -> Result<Vec<Endpoint>> {
        let key = CacheKey::Adapter(adapter_id.to_string());
        let resolved = self.lookup(key, ttl).await?.ok_or_else(|| Error::NotRegistered {
            kind: "object adapter",
            id: adapter_id.to_string(),
        })?;
        Ok(resolved.endpoints)
    }

    async fn turn<'a>(&'a self, key: &'a CacheKey) -> GateTurn<'a> {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        GateTurn {
            gates: &self.gates,
            key,
            guard: Some(gate.lock_owned().await),
        }
    }

    async fn lookup(&self, key: CacheKey, ttl: i32) -> Result<Option<Resolved>> {
        if let Some(resolved) = self.cache.get(&key, ttl) {
            return Ok(Some(resolved));
        }
        let _turn = self.turn(&key).await;
        if let Some(resolved) = self.cache.get(&key, ttl) {
            return Ok(Some(resolved));
        }

        let found = match &key {
            CacheKey::Adapter(id) => self.locator.find_adapter_by_id(id).await?,
            CacheKey::Object(id) => self.locator.find_object_by_id(id).await?,
        };
        let Some(proxy) = found else {
            debug!(key = ?key, "locator lookup found nothing");
            return Ok(None);
        };
        let resolved = Resolved {
            endpoints: proxy.endpoints().to_vec(),
            adapter_id: proxy.adapter_id().to_string(),
        };
        debug!(key = ?key, endpoints = resolved.endpoints.len(), "locator lookup resolved");
        if ttl != 0 {
            self.cache.insert(key.clone(), resolved.clone());
        }
        Ok(Some(resolved))
    }

    /// Forgets what was cached for `data`, after its endpoints failed.
    pub fn invalidate(&self, data: &ReferenceData) {
        if !data.adapter_id.is_empty() {
            self.cache.remove(&CacheKey::Adapter(data.adapter_id.clone()));
            return;
        }
        if let Some(resolved) = self.cache.remove(&CacheKey::Object(data.identity.clone())) {
            if !resolved.adapter_id.is_empty() {
                self.cache.remove(&CacheKey::Adapter(resolved.adapter_id));
            }
        }
    }
}
