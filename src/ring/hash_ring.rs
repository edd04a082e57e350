//! Key to Server Routing
//!
//! [`Ring`] owns the server list and the continuum built from it, and
//! answers "which live server owns this key". Liveness is read through the
//! [`RingMember`] trait on every lookup; the ring itself never changes after
//! construction and can be shared across tasks without locking.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

use crate::ring::continuum::{key_hash, Continuum};

/// Number of alternate continuum points tried when the owner of a key is
/// down.
pub const MAX_LOOKUP_ATTEMPTS: usize = 20;

/// Default number of continuum points per server
pub const DEFAULT_POINTS_PER_SERVER: usize = 160;

/// Lookup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    /// Every candidate server for the key was down
    #[error("no server available")]
    NoServerAvailable,
}

/// A server the ring can route to.
pub trait RingMember {
    /// Stable name used to place the server on the continuum
    fn name(&self) -> String;

    /// Relative share of the key space
    fn weight(&self) -> u32;

    /// Whether requests may currently be routed to this server
    fn is_alive(&self) -> bool;
}

/// Consistent hashing ring over a fixed set of servers.
#[derive(Debug)]
pub struct Ring<S> {
    servers: Vec<S>,
    continuum: Continuum,
    failover: bool,
}

impl<S: RingMember> Ring<S> {
    /// Builds a ring. With fewer than two servers no continuum is needed.
    pub fn new(servers: Vec<S>, points_per_server: usize, failover: bool) -> Self {
        let continuum = if servers.len() > 1 {
            let names: Vec<(String, u32)> =
                servers.iter().map(|s| (s.name(), s.weight())).collect();
            Continuum::build(
                names.iter().map(|(name, weight)| (name.as_str(), *weight)),
                points_per_server,
            )
        } else {
            Continuum::default()
        };

        debug!(
            servers = servers.len(),
            points = continuum.len(),
            failover,
            "Built hash ring"
        );

        Self {
            servers,
            continuum,
            failover,
        }
    }

    /// Returns the index of the live server owning `key`.
    pub fn index_for_key(&self, key: &[u8]) -> Result<usize, RingError> {
        match self.servers.len() {
            0 => return Err(RingError::NoServerAvailable),
            1 => {
                return if self.servers[0].is_alive() {
                    Ok(0)
                } else {
                    Err(RingError::NoServerAvailable)
                };
            }
            _ => {}
        }

        if let Some(idx) = self.continuum.server_for(key_hash(key)) {
            if self.servers[idx].is_alive() {
                return Ok(idx);
            }
        }

        if !self.failover {
            return Err(RingError::NoServerAvailable);
        }

        let mut rehash = Vec::with_capacity(key.len() + 2);
        for attempt in 0..MAX_LOOKUP_ATTEMPTS {
            rehash.clear();
            rehash.extend_from_slice(attempt.to_string().as_bytes());
            rehash.extend_from_slice(key);

            if let Some(idx) = self.continuum.server_for(key_hash(&rehash)) {
                if self.servers[idx].is_alive() {
                    trace!(attempt, server = idx, "Failed over to alternate server");
                    return Ok(idx);
                }
            }
        }

        Err(RingError::NoServerAvailable)
    }

    /// Returns the live server owning `key`.
    pub fn server_for_key(&self, key: &[u8]) -> Result<&S, RingError> {
        self.index_for_key(key).map(|idx| &self.servers[idx])
    }

    /// Groups keys by owning server index. Keys without a live server are
    /// returned separately.
    pub fn group_keys<K>(&self, keys: impl IntoIterator<Item = K>) -> (HashMap<usize, Vec<K>>, Vec<K>)
    where
        K: AsRef<[u8]>,
    {
        let mut groups: HashMap<usize, Vec<K>> = HashMap::new();
        let mut unrouted = Vec::new();

        for key in keys {
            match self.index_for_key(key.as_ref()) {
                Ok(idx) => groups.entry(idx).or_default().push(key),
                Err(RingError::NoServerAvailable) => unrouted.push(key),
            }
        }

        (groups, unrouted)
    }

    /// Returns all servers in configuration order.
    pub fn servers(&self) -> &[S] {
        &self.servers
    }

    /// Returns the server at `idx`.
    pub fn server(&self, idx: usize) -> Option<&S> {
        self.servers.get(idx)
    }

    pub fn continuum(&self) -> &Continuum {
        &self.continuum
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
