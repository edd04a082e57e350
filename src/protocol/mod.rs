//! Memcached Wire Protocols
//!
//! This module implements both memcached dialects the client can speak.
//!
//! ## Overview
//!
//! A logical operation is described once as a typed [`Request`]. Encoding
//! is a method on the request, parameterised by the [`Protocol`] in use, and
//! every reply is decoded into the same [`Response`] structure. The rest of
//! the crate never deals with opcodes or reply codes directly.
//!
//! ## Modules
//!
//! - `types`: `Request`, `Response`, `Status` and the dialect switch
//! - `binary`: 24-byte-header binary frames
//! - `meta`: line-oriented meta commands (`mg`, `ms`, `md`, `ma`, `mn`)
//! - `parser`: non-blocking incremental parser over a receive buffer
//!
//! ## Example
//!
//! ```
//! use flashmc::protocol::{Protocol, Request, ResponseParser};
//!
//! // Encoding a quiet get for a pipeline
//! let bytes = Request::Get { key: b"user:101" }.to_bytes(Protocol::Meta, true);
//! assert_eq!(&bytes[..], b"mg user:101 v f c k q\r\n");
//!
//! // Parsing a reply
//! let parser = ResponseParser::new(Protocol::Meta);
//! let (response, consumed) = parser.parse(b"VA 4 kuser:101\r\nAriz\r\n").unwrap().unwrap();
//! assert_eq!(&response.value[..], b"Ariz");
//! assert_eq!(consumed, 22);
//! ```

pub mod binary;
pub mod meta;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{ParseError, ParseResult, ResponseParser};
pub use types::{
    sanitize_ttl, ArithMode, Protocol, Request, Response, Status, StoreMode, MAX_KEY_LENGTH,
};
