//! Server Configuration
//!
//! Turns the configured server strings into [`ServerAddr`] values. Each
//! address carries its endpoint (TCP host/port or UNIX socket path) and a
//! weight that decides its share of the hash ring.

pub mod address;

pub use address::{parse_servers, Credentials, Endpoint, ServerAddr, DEFAULT_PORT};
