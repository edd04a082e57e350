//! Server Connections
//!
//! This module manages the client side of one memcached socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Connection                             │
//! │   state machine: Idle / Request / Pipeline                  │
//! │   failure escalation, fork detection                        │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Connector  │───>│ FrameReader │───>│   Parser    │      │
//! │  │ (TCP/UNIX)  │    │ (BytesMut)  │    │ (protocol)  │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │ shares
//!                                v
//!                        ┌───────────────┐
//!                        │    Health     │ <── read by the hash ring
//!                        └───────────────┘
//! ```
//!
//! ## Features
//!
//! - **Lazy connect**: sockets are opened on first use and reopened after
//!   any failure
//! - **Timeouts**: every read, write and connect is bounded
//! - **Backoff**: servers failing repeatedly are skipped for a while
//! - **Pipelining**: incremental reply parsing for batched gets

pub mod buffer;
pub mod handler;
pub mod health;
pub mod transport;

// Re-export commonly used types
pub use buffer::FrameReader;
pub use handler::{Connection, ConnectionError, State};
pub use health::Health;
pub use transport::{BoxStream, Connector, Stream, TcpConnector};
