//! Memcached Client
//!
//! The public face of the crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Client                           │
//! │   KeyManager: namespace + long-key digests               │
//! │                                                          │
//! │   get / set / ...        get_multi         batch         │
//! │         │                    │               │           │
//! │         v                    v               v           │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │          Ring<Backend>: key -> live server       │   │
//! │   └──────────────────────────────────────────────────┘   │
//! └─────────┬──────────────────┬──────────────────┬──────────┘
//!           v                  v                  v
//!     Mutex<Connection>  Mutex<Connection>  Mutex<Connection>
//!        server A           server B           server C
//! ```
//!
//! Single-key operations lock one connection for one exchange and retry
//! once on a network error. Multi-key operations group keys by server and
//! pipeline each group; see [`pipeline`] and [`batch`].

pub mod batch;
pub mod handler;
pub mod keys;
mod pipeline;

// Re-export commonly used types
pub use batch::{Batch, BatchOutcome};
pub use handler::{Client, Item};
pub use keys::KeyManager;
