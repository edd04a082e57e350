//! Server Liveness Tracking
//!
//! [`Health`] is the part of a connection's state the hash ring needs to
//! see: whether the server may receive requests right now. It is shared
//! between the connection (which records failures) and the ring (which only
//! reads), so it is lock-free.
//!
//! ```text
//!          connect ok                      failures >= max
//!   Up  <-------------  Down(since)  <-------------------  Up
//!                          |
//!                          | down_retry_delay elapsed
//!                          v
//!                    eligible again (one reconnect attempt)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

/// Liveness of one server.
#[derive(Debug)]
pub struct Health {
    name: String,
    /// Reference point for the millisecond timestamps below
    epoch: Instant,
    failures: AtomicU32,
    /// Milliseconds since `epoch` plus one when marked down, zero when up
    down_since: AtomicU64,
    /// Same encoding, survives recovery for diagnostics
    last_down: AtomicU64,
    connected: AtomicBool,
    down_retry_delay: Duration,
}

impl Health {
    pub fn new(name: impl Into<String>, down_retry_delay: Duration) -> Self {
        Self {
            name: name.into(),
            epoch: Instant::now(),
            failures: AtomicU32::new(0),
            down_since: AtomicU64::new(0),
            last_down: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            down_retry_delay,
        }
    }

    /// Returns true if requests may be routed to this server: it is
    /// connected, was never marked down, or has been down long enough to
    /// deserve another connection attempt.
    pub fn is_alive(&self) -> bool {
        self.connected.load(Ordering::Acquire) || self.retry_after().is_none()
    }

    /// Returns how much longer a down server must be left alone, or `None`
    /// if a connection attempt is allowed now.
    pub fn retry_after(&self) -> Option<Duration> {
        let since = self.down_since.load(Ordering::Acquire);
        if since == 0 {
            return None;
        }

        let elapsed = self.now_millis().saturating_sub(since - 1);
        let delay = self.down_retry_delay.as_millis() as u64;
        if elapsed >= delay {
            None
        } else {
            Some(Duration::from_millis(delay - elapsed))
        }
    }

    /// Returns true while the server is marked down.
    pub fn is_down(&self) -> bool {
        self.down_since.load(Ordering::Acquire) != 0
    }

    /// Returns how long ago the server was last marked down, if ever.
    pub fn last_down_ago(&self) -> Option<Duration> {
        match self.last_down.load(Ordering::Acquire) {
            0 => None,
            at => Some(Duration::from_millis(
                self.now_millis().saturating_sub(at - 1),
            )),
        }
    }

    /// Consecutive failures since the last successful exchange
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Records a socket failure and returns the new consecutive count.
    pub fn record_failure(&self) -> u32 {
        self.connected.store(false, Ordering::Release);
        self.failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Marks the server down as of now.
    pub fn mark_down(&self) {
        let now = self.now_millis() + 1;
        self.down_since.store(now, Ordering::Release);
        self.last_down.store(now, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }

    /// Records a successful connect, clearing any down mark.
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        if self.down_since.swap(0, Ordering::AcqRel) != 0 {
            info!(
                server = %self.name,
                down_for = ?self.last_down_ago().unwrap_or_default(),
                "Server is back up"
            );
        }
    }

    /// Records a completed exchange, resetting the failure count.
    pub fn record_success(&self) {
        if self.failures.load(Ordering::Relaxed) != 0 {
            self.failures.store(0, Ordering::Release);
        }
    }

    /// Records that the socket was closed without a failure.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
