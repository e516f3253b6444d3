//! Outgoing connection pool.
//!
//! Connections are shared by every proxy of a communicator that targets the
//! same endpoint with the same connection id. Establishing a connection for
//! one key is serialized so concurrent invocations reuse the first result
//! instead of racing to open several.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use tracing::{debug, info};

use crate::communicator::Communicator;
use crate::connection::{CloseMode, Connection};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Statistics about the connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections held by the pool.
    pub open_connections: usize,
    /// Distinct (endpoint, connection id) keys seen.
    pub keys: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    endpoint: Endpoint,
    connection_id: String,
}

/// Per-key state: the current connection and the lock serializing its
/// establishment.
#[derive(Default)]
struct Slot {
    connection: Option<Arc<Connection>>,
    connecting: Arc<tokio::sync::Mutex<()>>,
}

/// Outgoing connections by endpoint and connection id.
#[derive(Default)]
pub struct ConnectionPool {
    slots: Mutex<HashMap<PoolKey, Slot>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}

impl ConnectionPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An active connection for `key`, or the lock to hold while opening one.
    fn lookup(&self, key: &PoolKey) -> std::result::Result<Arc<Connection>, Arc<tokio::sync::Mutex<()>>> {
        let mut slots = self.lock();
        let slot = slots.entry(key.clone()).or_default();
        match &slot.connection {
            Some(connection) if connection.is_active() => Ok(connection.clone()),
            _ => {
                slot.connection = None;
                Err(slot.connecting.clone())
            }
        }
    }

    fn store(&self, key: PoolKey, connection: Arc<Connection>) {
        self.lock().entry(key).or_default().connection = Some(connection);
    }

    /// The first endpoint, in order, that yields a validated connection.
    /// Active connections are reused; closing or closed ones are never
    /// handed out.
    /// Fails with the last endpoint's error.
    pub(crate) async fn get(
        &self,
        communicator: &Communicator,
        endpoints: &[Endpoint],
        connection_id: &str,
    ) -> Result<Arc<Connection>> {
        let keys: Vec<PoolKey> = endpoints
            .iter()
            .map(|endpoint| PoolKey {
                endpoint: endpoint.clone(),
                connection_id: connection_id.to_string(),
            })
            .collect();

        for key in &keys {
            if let Ok(connection) = self.lookup(key) {
                return Ok(connection);
            }
        }

        let mut last_error = Error::NoEndpoint {
            proxy: connection_id.to_string(),
        };
        for key in keys {
            match self.connect(communicator, key).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!(error = %e, "endpoint unusable, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect(&self, communicator: &Communicator, key: PoolKey) -> Result<Arc<Connection>> {
        let connecting = match self.lookup(&key) {
            Ok(connection) => return Ok(connection),
            Err(connecting) => connecting,
        };
        let _turn = connecting.lock().await;
        if let Ok(connection) = self.lookup(&key) {
            return Ok(connection);
        }
        communicator.check_destroyed()?;

        let channel = communicator.transports().connect(&key.endpoint).await?;
        let options = communicator.connection_options(false, key.endpoint.clone(), key.connection_id.clone(), None);
        let connection = Connection::connect(channel, options).await?;
        info!(
            endpoint = %key.endpoint,
            connection_id = %key.connection_id,
            "connection established"
        );
        self.store(key, connection.clone());
        Ok(connection)
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let slots = self.lock();
        PoolStats {
            open_connections: slots
                .values()
                .filter(|s| s.connection.as_ref().is_some_and(|c| !c.is_closed()))
                .count(),
            keys: slots.len(),
        }
    }

    /// Closes every pooled connection and forgets them.
    pub async fn close_all(&self, mode: CloseMode) {
        let connections: Vec<Arc<Connection>> = self
            .lock()
            .drain()
            .filter_map(|(_, slot)| slot.connection)
            .collect();
        if connections.is_empty() {
            return;
        }
        debug!(count = connections.len(), "closing pooled connections");
        join_all(connections.iter().map(|c| c.close(mode))).await;
    }

    /// Sends the batch queues of all pooled connections.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let connections: Vec<Arc<Connection>> = self
            .lock()
            .values()
            .filter_map(|slot| slot.connection.clone())
            .filter(|c| !c.is_closed())
            .collect();
        let results = join_all(connections.iter().map(|c| c.flush_batch_requests())).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }
}
