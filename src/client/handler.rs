//! Client Facade
//!
//! [`Client`] is the entry point: it validates keys, routes them through
//! the ring and runs each operation on the owning server's connection.
//!
//! ## Example
//!
//! ```no_run
//! use flashmc::{Client, ClientConfig};
//!
//! # async fn demo() -> flashmc::Result<()> {
//! let client = Client::new(ClientConfig::with_servers(["cache1:11211", "cache2:11211:2"]))?;
//! client.set("user:1", "alice", 300).await?;
//! let item = client.get("user:1").await?;
//! assert_eq!(item.map(|i| i.value), Some("alice".into()));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::batch::{Batch, BatchOutcome};
use crate::client::keys::KeyManager;
use crate::client::pipeline::PipelinedGetter;
use crate::config::{ClientConfig, ConnectionOptions};
use crate::connection::{Connection, Connector, Health, TcpConnector};
use crate::error::{Error, Result};
use crate::protocol::{sanitize_ttl, ArithMode, ParseError, Protocol, Request, Response, StoreMode};
use crate::ring::{Ring, RingMember};
use crate::server::ServerAddr;

/// A cached value with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub value: Bytes,
    /// Client flags stored alongside the value
    pub flags: u32,
    /// Compare-and-swap token
    pub cas: u64,
}

impl From<Response> for Item {
    fn from(response: Response) -> Self {
        Self {
            value: response.value,
            flags: response.flags,
            cas: response.cas,
        }
    }
}

/// One configured server: its connection plus the health record the ring
/// reads without taking the connection lock.
#[derive(Debug)]
pub(crate) struct Backend {
    pub(crate) server: ServerAddr,
    pub(crate) name: String,
    pub(crate) health: Arc<Health>,
    pub(crate) conn: Mutex<Connection>,
}

impl Backend {
    fn new(server: ServerAddr, options: ConnectionOptions, connector: Arc<dyn Connector>) -> Self {
        let conn = Connection::new(server.clone(), options, connector);
        Self {
            name: conn.name().to_string(),
            health: conn.health().clone(),
            conn: Mutex::new(conn),
            server,
        }
    }
}

impl RingMember for Backend {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn weight(&self) -> u32 {
        self.server.weight
    }

    fn is_alive(&self) -> bool {
        self.health.is_alive()
    }
}

/// Shared state behind every clone of a [`Client`].
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) ring: Ring<Backend>,
    pub(crate) keys: KeyManager,
    pub(crate) config: ClientConfig,
}

/// A memcached client over one or more servers.
///
/// Cloning is cheap; clones share connections. Each server has one
/// connection, and operations on the same server are serialized.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl Client {
    /// Creates a client that connects over TCP or UNIX sockets. Nothing is
    /// connected until the first operation.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(TcpConnector))
    }

    /// Creates a client that opens its sockets through `connector`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let servers = config.server_addrs()?;
        let options = config.connection_options();

        let backends: Vec<Backend> = servers
            .into_iter()
            .map(|server| {
                if server.credentials.is_some() {
                    warn!(
                        server = %server,
                        "Ignoring credentials: SASL authentication is not supported"
                    );
                }
                Backend::new(server, options, connector.clone())
            })
            .collect();

        let ring = Ring::new(backends, config.points_per_server, config.failover);
        info!(
            servers = ring.len(),
            protocol = %config.protocol,
            namespace = ?config.namespace,
            "Client created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                ring,
                keys: KeyManager::new(config.namespace.clone()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.config.protocol
    }

    /// Names of the configured servers, in configuration order.
    pub fn servers(&self) -> Vec<String> {
        self.inner.ring.servers().iter().map(|b| b.name.clone()).collect()
    }

    // ========================================================================
    // Single-key operations
    // ========================================================================

    /// Fetches `key`. A miss is `Ok(None)`.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Item>> {
        let key = self.inner.keys.validate(key.as_ref())?;
        let response = self.perform(&Request::Get { key: &key }).await?;
        Ok(hit(response))
    }

    /// Fetches `key` and its compare-and-swap token.
    pub async fn get_cas(&self, key: impl AsRef<[u8]>) -> Result<Option<(Bytes, u64)>> {
        Ok(self.get(key).await?.map(|item| (item.value, item.cas)))
    }

    /// Fetches `key` and resets its expiry to `ttl` seconds.
    pub async fn gat(&self, key: impl AsRef<[u8]>, ttl: u32) -> Result<Option<Item>> {
        let key = self.inner.keys.validate(key.as_ref())?;
        let request = Request::GetAndTouch {
            key: &key,
            ttl: sanitize_ttl(ttl),
        };
        Ok(hit(self.perform(&request).await?))
    }

    /// Resets the expiry of `key`. Returns false if the key is missing.
    pub async fn touch(&self, key: impl AsRef<[u8]>, ttl: u32) -> Result<bool> {
        let key = self.inner.keys.validate(key.as_ref())?;
        let request = Request::Touch {
            key: &key,
            ttl: sanitize_ttl(ttl),
        };
        Ok(self.perform(&request).await?.is_ok())
    }

    /// Stores `value` unconditionally and returns its new CAS token.
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: u32) -> Result<u64> {
        self.set_with_flags(key, value, 0, ttl).await
    }

    /// Stores `value` with client `flags`.
    pub async fn set_with_flags(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        ttl: u32,
    ) -> Result<u64> {
        let stored = self
            .store(StoreMode::Set, key.as_ref(), value.as_ref(), flags, ttl, 0)
            .await?;
        Ok(stored.unwrap_or_default())
    }

    /// Stores `value` only if `key` does not exist yet.
    pub async fn add(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: u32) -> Result<Option<u64>> {
        self.store(StoreMode::Add, key.as_ref(), value.as_ref(), 0, ttl, 0)
            .await
    }

    /// Stores `value` only if `key` already exists.
    pub async fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: u32,
    ) -> Result<Option<u64>> {
        self.store(StoreMode::Replace, key.as_ref(), value.as_ref(), 0, ttl, 0)
            .await
    }

    /// Stores `value` only if the item still carries `cas`. Returns the new
    /// token, or `None` if the item changed or disappeared.
    pub async fn cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        ttl: u32,
        cas: u64,
    ) -> Result<Option<u64>> {
        if cas == 0 {
            return Err(Error::Misuse("compare-and-swap needs a non-zero token"));
        }
        self.store(StoreMode::Set, key.as_ref(), value.as_ref(), 0, ttl, cas)
            .await
    }

    /// Appends to an existing value. Returns false if the key is missing.
    pub async fn append(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<bool> {
        let stored = self
            .store(StoreMode::Append, key.as_ref(), value.as_ref(), 0, 0, 0)
            .await?;
        Ok(stored.is_some())
    }

    /// Prepends to an existing value. Returns false if the key is missing.
    pub async fn prepend(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<bool> {
        let stored = self
            .store(StoreMode::Prepend, key.as_ref(), value.as_ref(), 0, 0, 0)
            .await?;
        Ok(stored.is_some())
    }

    /// Removes `key`. Returns false if it did not exist.
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.delete_cas(key, 0).await
    }

    /// Removes `key` if it still carries `cas` (0 matches anything).
    pub async fn delete_cas(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<bool> {
        let key = self.inner.keys.validate(key.as_ref())?;
        let response = self.perform(&Request::Delete { key: &key, cas }).await?;
        Ok(response.is_ok())
    }

    /// Increments a counter. With `initial` set, a missing counter is
    /// created with that value; otherwise a miss is `Ok(None)`.
    pub async fn incr(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        ttl: u32,
        initial: Option<u64>,
    ) -> Result<Option<u64>> {
        self.arith(ArithMode::Incr, key.as_ref(), delta, ttl, initial)
            .await
    }

    /// Decrements a counter; memcached stops at zero.
    pub async fn decr(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        ttl: u32,
        initial: Option<u64>,
    ) -> Result<Option<u64>> {
        self.arith(ArithMode::Decr, key.as_ref(), delta, ttl, initial)
            .await
    }

    async fn store(
        &self,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        flags: u32,
        ttl: u32,
        cas: u64,
    ) -> Result<Option<u64>> {
        let key = self.inner.keys.validate(key)?;
        self.check_value(value)?;

        let request = Request::Store {
            mode,
            key: &key,
            value,
            flags,
            ttl: sanitize_ttl(ttl),
            cas,
        };
        let response = self.perform(&request).await?;
        Ok(response.is_ok().then_some(response.cas))
    }

    async fn arith(
        &self,
        mode: ArithMode,
        key: &[u8],
        delta: u64,
        ttl: u32,
        initial: Option<u64>,
    ) -> Result<Option<u64>> {
        let key = self.inner.keys.validate(key)?;
        let request = Request::Arith {
            mode,
            key: &key,
            delta,
            initial,
            ttl: sanitize_ttl(ttl),
        };
        let response = self.perform(&request).await?;
        if !response.is_ok() {
            return Ok(None);
        }
        Ok(response.counter())
    }

    pub(crate) fn check_value(&self, value: &[u8]) -> Result<()> {
        let max = self.inner.config.value_max_bytes;
        if value.len() > max {
            return Err(Error::ValueTooLarge {
                size: value.len(),
                max,
            });
        }
        Ok(())
    }

    /// Runs a keyed request on the owning server, retrying once on a
    /// network error. The retry re-routes, so a server marked down by the
    /// first attempt is replaced by its failover.
    async fn perform(&self, request: &Request<'_>) -> Result<Response> {
        match self.perform_once(request).await {
            Err(e) if e.is_network() => {
                debug!(error = %e, "Retrying request");
                self.perform_once(request).await
            }
            other => other,
        }
    }

    async fn perform_once(&self, request: &Request<'_>) -> Result<Response> {
        let key = request.key().unwrap_or_default();
        let backend = self.inner.ring.server_for_key(key)?;
        let mut conn = backend.conn.lock().await;
        let response = conn.request(request).await?;
        let response = item_outcome(&backend.name, response)?;
        let arith = matches!(request, Request::Arith { .. });
        if arith && response.is_ok() && response.counter().is_none() {
            return Err(Error::protocol(
                &backend.name,
                ParseError::InvalidInteger(response.value_str()),
            ));
        }
        Ok(response)
    }

    // ========================================================================
    // Multi-key operations
    // ========================================================================

    /// Fetches many keys with one pipelined round trip per server. Misses
    /// are absent from the map; keys of unreachable servers are treated as
    /// misses.
    pub async fn get_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<HashMap<Bytes, Item>> {
        let mut found = HashMap::with_capacity(keys.len());
        self.get_multi_with(keys, |key, item| {
            found.insert(key, item);
        })
        .await?;
        Ok(found)
    }

    /// Like [`Client::get_multi`], but hands each hit to `on_hit` as soon as
    /// it is parsed.
    pub async fn get_multi_with<K, F>(&self, keys: &[K], on_hit: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnMut(Bytes, Item),
    {
        PipelinedGetter::new(&self.inner).process(keys, on_hit).await
    }

    /// Stores every pair with the same TTL.
    pub async fn set_multi<K, V>(&self, items: &[(K, V)], ttl: u32) -> Result<BatchOutcome>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut batch = self.batch();
        for (key, value) in items {
            batch = batch.set(key.as_ref(), value.as_ref(), ttl);
        }
        batch.execute().await
    }

    /// Removes every key.
    pub async fn delete_multi<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<BatchOutcome> {
        let mut batch = self.batch();
        for key in keys {
            batch = batch.delete(key.as_ref());
        }
        batch.execute().await
    }

    /// Starts a batch of quiet write operations.
    pub fn batch(&self) -> Batch {
        Batch::new(self.clone())
    }

    // ========================================================================
    // Per-server operations
    // ========================================================================

    /// Invalidates every item on every server, after `delay` seconds.
    /// All servers are attempted; the first error is returned.
    pub async fn flush(&self, delay: u32) -> Result<()> {
        let mut first_error = None;
        for backend in self.inner.ring.servers() {
            let result = {
                let mut conn = backend.conn.lock().await;
                conn.request(&Request::Flush { delay }).await
            };
            match result.and_then(|r| item_outcome(&backend.name, r)) {
                Ok(_) => debug!(server = %backend.name, delay, "Flushed"),
                Err(e) => {
                    warn!(server = %backend.name, error = %e, "Flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Collects statistics from every server. Unreachable servers map to
    /// `None`.
    pub async fn stats(&self, group: Option<&str>) -> HashMap<String, Option<HashMap<String, String>>> {
        let mut all = HashMap::new();
        for backend in self.inner.ring.servers() {
            let result = {
                let mut conn = backend.conn.lock().await;
                conn.request_all(&Request::Stats { group }).await
            };
            let stats = match result {
                Ok(responses) => collect_stats(&backend.name, responses),
                Err(e) => Err(e),
            };
            match stats {
                Ok(stats) => {
                    all.insert(backend.name.clone(), Some(stats));
                }
                Err(e) => {
                    debug!(server = %backend.name, error = %e, "Stats unavailable");
                    all.insert(backend.name.clone(), None);
                }
            }
        }
        all
    }

    /// Reports the version of every server. Unreachable servers map to
    /// `None`.
    pub async fn version(&self) -> HashMap<String, Option<String>> {
        let mut all = HashMap::new();
        for backend in self.inner.ring.servers() {
            let result = {
                let mut conn = backend.conn.lock().await;
                conn.request(&Request::Version).await
            };
            let version = match result {
                Ok(response) if response.is_ok() => Some(response.value_str()),
                Ok(response) => {
                    debug!(server = %backend.name, status = %response.status, "Version refused");
                    None
                }
                Err(e) => {
                    debug!(server = %backend.name, error = %e, "Version unavailable");
                    None
                }
            };
            all.insert(backend.name.clone(), version);
        }
        all
    }

    /// Succeeds if at least one server accepts a connection.
    pub async fn alive(&self) -> Result<()> {
        for backend in self.inner.ring.servers() {
            let mut conn = backend.conn.lock().await;
            if conn.ensure_connected().await.is_ok() {
                return Ok(());
            }
        }
        Err(Error::NoServerAvailable)
    }

    /// Closes every socket. The client stays usable and reconnects on the
    /// next operation.
    pub async fn close(&self) {
        for backend in self.inner.ring.servers() {
            backend.conn.lock().await.close();
        }
        debug!("Closed all connections");
    }
}

fn hit(response: Response) -> Option<Item> {
    response.is_ok().then(|| Item::from(response))
}

/// Passes replies that describe the item; anything else is the server
/// rejecting the request.
fn item_outcome(server: &str, response: Response) -> Result<Response> {
    if response.status.is_item_outcome() {
        return Ok(response);
    }
    Err(Error::Server {
        server: server.to_string(),
        status: response.status,
        message: response.value_str(),
    })
}

fn collect_stats(server: &str, responses: Vec<Response>) -> Result<HashMap<String, String>> {
    let mut stats = HashMap::with_capacity(responses.len());
    for response in responses {
        let response = item_outcome(server, response)?;
        stats.insert(
            String::from_utf8_lossy(&response.key).into_owned(),
            response.value_str(),
        );
    }
    Ok(stats)
}
