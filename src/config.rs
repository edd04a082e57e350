//! Client Configuration
//!
//! All tunables live in one [`ClientConfig`] value that is handed to
//! [`Client::new`](crate::Client::new). Nothing is read from global state
//! after construction.

use std::time::Duration;

use crate::error::Result;
use crate::protocol::Protocol;
use crate::ring::DEFAULT_POINTS_PER_SERVER;
use crate::server::{parse_servers, ServerAddr};

/// Environment variable consulted when no servers are configured
pub const SERVERS_ENV: &str = "MEMCACHE_SERVERS";

/// Server used when neither the config nor the environment name one
pub const DEFAULT_SERVER: &str = "127.0.0.1:11211";

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server strings (`host[:port[:weight]]`, `/path[:weight]` or a
    /// `memcached://` URI). Empty means "use the environment".
    pub servers: Vec<String>,

    /// Prefix added to every key as `"<namespace>:<key>"`
    pub namespace: Option<String>,

    /// Wire dialect
    pub protocol: Protocol,

    /// Deadline for every socket read or write, and for a whole pipelined
    /// get batch
    pub socket_timeout: Duration,

    /// Deadline for establishing a connection
    pub connect_timeout: Duration,

    /// Consecutive failures after which a server is marked down
    pub socket_max_failures: u32,

    /// Pause before the single retry that follows a transient failure
    pub socket_failure_delay: Duration,

    /// How long a down server is skipped before reconnecting is attempted
    pub down_retry_delay: Duration,

    /// Route keys of a down server to an alternate server
    pub failover: bool,

    /// Largest value accepted by store operations
    pub value_max_bytes: usize,

    /// Continuum points per server
    pub points_per_server: usize,

    /// Keys per server above which get batches interleave sending with
    /// draining replies
    pub interleave_threshold: usize,

    /// Keys sent per chunk while interleaving
    pub interleave_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            namespace: None,
            protocol: Protocol::default(),
            socket_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            socket_max_failures: 2,
            socket_failure_delay: Duration::from_millis(100),
            down_retry_delay: Duration::from_secs(30),
            failover: true,
            value_max_bytes: 1024 * 1024,
            points_per_server: DEFAULT_POINTS_PER_SERVER,
            interleave_threshold: 10_000,
            interleave_chunk_size: 10_000,
        }
    }
}

impl ClientConfig {
    /// Creates a config for the given servers with default settings.
    pub fn with_servers<S: Into<String>>(servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Resolves the configured server strings, falling back to
    /// `MEMCACHE_SERVERS` and then to `127.0.0.1:11211`.
    pub fn server_addrs(&self) -> Result<Vec<ServerAddr>> {
        if !self.servers.is_empty() {
            return parse_servers(&self.servers);
        }

        match std::env::var(SERVERS_ENV) {
            Ok(value) if !value.trim().is_empty() => parse_servers(&[value]),
            _ => parse_servers(&[DEFAULT_SERVER]),
        }
    }

    /// Returns the per-connection settings.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            protocol: self.protocol,
            socket_timeout: self.socket_timeout,
            connect_timeout: self.connect_timeout,
            socket_max_failures: self.socket_max_failures.max(1),
            socket_failure_delay: self.socket_failure_delay,
            down_retry_delay: self.down_retry_delay,
        }
    }
}

/// The subset of [`ClientConfig`] a single connection needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub protocol: Protocol,
    pub socket_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_max_failures: u32,
    pub socket_failure_delay: Duration,
    pub down_retry_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ClientConfig::default().connection_options()
    }
}
