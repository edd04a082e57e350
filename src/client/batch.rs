//! Batched Writes
//!
//! A [`Batch`] collects store and delete operations and sends them as
//! quiet requests, one write per server, terminated by a no-op. Quiet
//! requests only answer on failure, so a batch that fully succeeds costs a
//! single reply per server.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::client::handler::Client;
use crate::error::Result;
use crate::protocol::{sanitize_ttl, Request, StoreMode};

#[derive(Debug, Clone)]
enum Op {
    Store {
        mode: StoreMode,
        key: Bytes,
        value: Bytes,
        flags: u32,
        ttl: u32,
    },
    Delete {
        key: Bytes,
    },
}

impl Op {
    fn key(&self) -> &[u8] {
        match self {
            Op::Store { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// What happened to the operations of an executed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Operations written to a server
    pub sent: usize,
    /// Sent operations the server answered with a failure (not stored, or
    /// a missing key on delete)
    pub rejected: usize,
    /// Operations whose key had no live server
    pub skipped: usize,
}

impl BatchOutcome {
    /// Operations the servers accepted.
    pub fn applied(&self) -> usize {
        self.sent.saturating_sub(self.rejected)
    }
}

/// A set of write operations executed together.
///
/// ```no_run
/// # async fn demo(client: flashmc::Client) -> flashmc::Result<()> {
/// let outcome = client
///     .batch()
///     .set("a", "1", 0)
///     .add("b", "2", 60)
///     .delete("c")
///     .execute()
///     .await?;
/// println!("{} applied", outcome.applied());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Batch {
    client: Client,
    ops: Vec<Op>,
}

impl Batch {
    pub(crate) fn new(client: Client) -> Self {
        Self {
            client,
            ops: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn set(self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: u32) -> Self {
        self.store(StoreMode::Set, key, value, 0, ttl)
    }

    pub fn set_with_flags(
        self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        ttl: u32,
    ) -> Self {
        self.store(StoreMode::Set, key, value, flags, ttl)
    }

    pub fn add(self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: u32) -> Self {
        self.store(StoreMode::Add, key, value, 0, ttl)
    }

    pub fn replace(self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, ttl: u32) -> Self {
        self.store(StoreMode::Replace, key, value, 0, ttl)
    }

    pub fn delete(mut self, key: impl AsRef<[u8]>) -> Self {
        self.ops.push(Op::Delete {
            key: Bytes::copy_from_slice(key.as_ref()),
        });
        self
    }

    fn store(
        mut self,
        mode: StoreMode,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        flags: u32,
        ttl: u32,
    ) -> Self {
        self.ops.push(Op::Store {
            mode,
            key: Bytes::copy_from_slice(key.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
            flags,
            ttl: sanitize_ttl(ttl),
        });
        self
    }

    /// Sends every operation. Keys and value sizes are checked before
    /// anything is written. Every server is attempted; if one fails, the
    /// first error is returned after the others have been written.
    pub async fn execute(self) -> Result<BatchOutcome> {
        let inner = &self.client.inner;

        let mut wire_keys = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            if let Op::Store { value, .. } = op {
                self.client.check_value(value)?;
            }
            wire_keys.push(inner.keys.validate(op.key())?);
        }

        let mut outcome = BatchOutcome::default();
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); inner.ring.len()];
        for (i, key) in wire_keys.iter().enumerate() {
            match inner.ring.index_for_key(key) {
                Ok(idx) => groups[idx].push(i),
                Err(_) => outcome.skipped += 1,
            }
        }
        if outcome.skipped > 0 {
            debug!(ops = outcome.skipped, "No server available, skipping operations");
        }

        let mut first_error = None;
        for (idx, group) in groups.iter().enumerate() {
            let Some(backend) = inner.ring.server(idx) else {
                continue;
            };
            if group.is_empty() {
                continue;
            }

            let requests: Vec<Request<'_>> = group
                .iter()
                .map(|&i| request(&self.ops[i], &wire_keys[i]))
                .collect();

            let mut conn = backend.conn.lock().await;
            let result = match conn.batch(&requests).await {
                Err(e) if e.is_retryable() => {
                    debug!(server = %backend.name, error = %e, "Retrying write batch");
                    conn.batch(&requests).await
                }
                other => other,
            };

            match result {
                Ok(failed) => {
                    outcome.sent += requests.len();
                    outcome.rejected += failed.len();
                    for response in failed.iter().filter(|r| !r.status.is_item_outcome()) {
                        warn!(
                            server = %backend.name,
                            status = %response.status,
                            message = %response.value_str(),
                            "Batched operation rejected"
                        );
                    }
                }
                Err(e) => {
                    warn!(server = %backend.name, error = %e, ops = requests.len(), "Write batch failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }
}

fn request<'a>(op: &'a Op, key: &'a [u8]) -> Request<'a> {
    match op {
        Op::Store {
            mode,
            value,
            flags,
            ttl,
            ..
        } => Request::Store {
            mode: *mode,
            key,
            value,
            flags: *flags,
            ttl: *ttl,
            cas: 0,
        },
        Op::Delete { .. } => Request::Delete { key, cas: 0 },
    }
}
