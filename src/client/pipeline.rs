//! Pipelined Multi-Get
//!
//! Fetches many keys with one round trip per server:
//!
//! ```text
//!   keys ──group by ring──> server A: GETQ k1, GETQ k4, ..., NOOP
//!                           server B: GETQ k2, GETQ k3, ..., NOOP
//!
//!   then, concurrently for all servers until each NOOP reply is seen:
//!     read ─> parse complete frames ─> hand hits to the caller
//! ```
//!
//! Misses produce no reply. A server that fails mid-batch only loses its
//! own keys; a transient failure while sending retries the whole batch
//! once.
//!
//! A very large batch for one server is sent in chunks, draining replies
//! between chunks. Otherwise the server's replies fill the socket buffers
//! while we are still writing, the server stops reading, and both sides
//! wait on each other.

use std::collections::HashMap;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::MutexGuard;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::client::handler::{Inner, Item};
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::Response;

/// Runs one multi-get against the servers of a client.
pub(crate) struct PipelinedGetter<'a> {
    inner: &'a Inner,
}

impl<'a> PipelinedGetter<'a> {
    pub(crate) fn new(inner: &'a Inner) -> Self {
        Self { inner }
    }

    /// Fetches `keys`, calling `on_hit` with the caller's key for every hit.
    pub(crate) async fn process<K, F>(&self, keys: &[K], mut on_hit: F) -> Result<()>
    where
        K: AsRef<[u8]>,
        F: FnMut(Bytes, Item),
    {
        // wire key -> key as the caller spelled it
        let mut wanted = HashMap::with_capacity(keys.len());
        for key in keys {
            let key = key.as_ref();
            wanted.insert(self.inner.keys.validate(key)?, Bytes::copy_from_slice(key));
        }
        if wanted.is_empty() {
            return Ok(());
        }

        match self.attempt(&wanted, &mut on_hit).await {
            Err(e) if e.is_retryable() => {
                debug!(error = %e, keys = wanted.len(), "Retrying get batch");
                self.attempt(&wanted, &mut on_hit).await
            }
            other => other,
        }
    }

    async fn attempt<F>(&self, wanted: &HashMap<Vec<u8>, Bytes>, on_hit: &mut F) -> Result<()>
    where
        F: FnMut(Bytes, Item),
    {
        let ring = &self.inner.ring;
        let (groups, unrouted) = ring.group_keys(wanted.keys());
        if !unrouted.is_empty() {
            debug!(keys = unrouted.len(), "No server available, skipping keys");
        }

        // Lock in index order so concurrent batches cannot deadlock.
        let mut order: Vec<usize> = groups.keys().copied().collect();
        order.sort_unstable();

        let mut active: Vec<(usize, MutexGuard<'_, Connection>)> = Vec::with_capacity(order.len());
        for idx in order {
            let Some(backend) = ring.server(idx) else {
                continue;
            };
            let mut conn = backend.conn.lock().await;
            let group = groups.get(&idx).map(Vec::as_slice).unwrap_or_default();

            match self.send_group(&mut conn, group, wanted, on_hit).await {
                Ok(()) => active.push((idx, conn)),
                Err(e) if e.is_retryable() => {
                    for (_, started) in active.iter_mut() {
                        started.pipeline_abort().await;
                    }
                    return Err(e);
                }
                Err(e) => {
                    debug!(server = %backend.name, error = %e, "Skipping server for this batch");
                }
            }
        }

        self.drain(active, wanted, on_hit).await;
        Ok(())
    }

    /// Sends the quiet gets for one server, followed by the terminator.
    async fn send_group<F>(
        &self,
        conn: &mut Connection,
        group: &[&Vec<u8>],
        wanted: &HashMap<Vec<u8>, Bytes>,
        on_hit: &mut F,
    ) -> Result<()>
    where
        F: FnMut(Bytes, Item),
    {
        let config = &self.inner.config;
        conn.pipeline_begin().await?;

        if group.len() <= config.interleave_threshold {
            conn.pipeline_send(group, false).await?;
        } else {
            trace!(server = conn.name(), keys = group.len(), "Interleaving large get batch");
            for chunk in group.chunks(config.interleave_chunk_size.max(1)) {
                conn.pipeline_send(chunk, true).await?;
                for response in conn.pipeline_drain()? {
                    deliver(response, wanted, on_hit);
                }
            }
        }

        conn.pipeline_response_setup().await
    }

    /// Reads replies from every server concurrently until each batch is
    /// terminated, a server fails, or the socket timeout passes.
    async fn drain<F>(
        &self,
        mut active: Vec<(usize, MutexGuard<'_, Connection>)>,
        wanted: &HashMap<Vec<u8>, Bytes>,
        on_hit: &mut F,
    ) where
        F: FnMut(Bytes, Item),
    {
        let deadline = Instant::now() + self.inner.config.socket_timeout;
        let mut timed_out = false;

        {
            let mut pending = FuturesUnordered::new();
            for (idx, conn) in active.iter_mut() {
                pending.push(next_responses(*idx, &mut **conn));
            }

            loop {
                let (idx, conn, result) = match timeout_at(deadline, pending.next()).await {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                };

                match result {
                    Ok(hits) => {
                        for response in hits {
                            deliver(response, wanted, on_hit);
                        }
                        if !conn.pipeline_complete() {
                            pending.push(next_responses(idx, conn));
                        }
                    }
                    Err(e) => {
                        debug!(server = conn.name(), error = %e, "Dropping server from get batch");
                    }
                }
            }
        }

        if timed_out {
            for (_, conn) in active.iter_mut() {
                if conn.pipeline_complete() || !conn.is_connected() {
                    continue;
                }
                warn!(server = conn.name(), "Get batch timed out, aborting");
                conn.pipeline_abort().await;
            }
        }
    }
}

async fn next_responses(
    idx: usize,
    conn: &mut Connection,
) -> (usize, &mut Connection, Result<Vec<Response>>) {
    let result = conn.pipeline_next_responses().await;
    (idx, conn, result)
}

fn deliver<F>(response: Response, wanted: &HashMap<Vec<u8>, Bytes>, on_hit: &mut F)
where
    F: FnMut(Bytes, Item),
{
    match wanted.get(&response.key[..]) {
        Some(key) => on_hit(key.clone(), Item::from(response)),
        None => debug!(key = ?response.key, "Discarding reply for a key not in the batch"),
    }
}
