//! # flashmc - An Async Memcached Client
//!
//! flashmc talks to a pool of memcached servers over the binary or the meta
//! text protocol. Keys are spread across servers with consistent hashing,
//! and multi-key operations are pipelined: one write and one stream of
//! replies per server, no matter how many keys.
//!
//! ## Features
//!
//! - **Consistent Hashing**: ketama-style continuum with weights; keys of a
//!   failed server move to a live alternate
//! - **Pipelined Multi-Get**: quiet gets plus a no-op terminator, replies
//!   read from all servers concurrently and handed out as they arrive
//! - **Failure Handling**: timeouts on every socket operation, a retry for
//!   transient errors, and a cool-down for servers that keep failing
//! - **Two Dialects**: the binary protocol and the meta text protocol
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Client                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────┐     │
//! │  │ KeyManager  │───>│    Ring     │───>│  PipelinedGetter / Batch │     │
//! │  │ (namespace) │    │ (continuum) │    │  (multi-key operations)  │     │
//! │  └─────────────┘    └──────┬──────┘    └────────────┬─────────────┘     │
//! │                            │                        │                   │
//! │                            ▼                        ▼                   │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                Connection (one per server)                       │   │
//! │  │   state machine ── FrameReader (BytesMut) ── ResponseParser      │   │
//! │  └──────────────────────────────┬───────────────────────────────────┘   │
//! │                                 │ Connector (TCP / UNIX)                │
//! └─────────────────────────────────┼───────────────────────────────────────┘
//!                                   ▼
//!                        memcached servers
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use flashmc::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> flashmc::Result<()> {
//!     let client = Client::new(ClientConfig::with_servers(["127.0.0.1:11211"]))?;
//!
//!     client.set("greeting", "hello", 60).await?;
//!     if let Some(item) = client.get("greeting").await? {
//!         println!("{:?}", item.value);
//!     }
//!
//!     let found = client.get_multi(&["greeting", "missing"]).await?;
//!     println!("{} hits", found.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`client`]: the [`Client`] facade, key handling and multi-key engines
//! - [`ring`]: continuum construction and key to server routing
//! - [`connection`]: per-server socket state machine and health tracking
//! - [`protocol`]: binary and meta request encoding and reply parsing
//! - [`server`]: server address parsing
//! - [`config`]: client settings
//!
//! ## Design Highlights
//!
//! ### Incremental Parsing
//!
//! Replies are parsed straight out of the receive buffer. A frame that has
//! not fully arrived is left untouched until the next read, so TCP
//! fragmentation never corrupts a batch.
//!
//! ### Interleaved Sending
//!
//! Very large batches are written in chunks while reading replies, so the
//! client and server can never both block on full socket buffers.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod ring;
pub mod server;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use client::{Batch, BatchOutcome, Client, Item};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use protocol::Protocol;
pub use server::{ServerAddr, DEFAULT_PORT};

/// Version of flashmc
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
