//! Client Error Types
//!
//! Every public operation returns [`Result<T>`]. The variants follow how a
//! caller should react:
//!
//! - `Network`: a socket-level failure. Below the failure threshold the
//!   connection is closed and one retry with a fresh connection is
//!   worthwhile; once the server is marked down the error is terminal.
//! - `NoServerAvailable`: the ring found no live server for the key, even
//!   after trying alternate continuum points.
//! - `Protocol`: the server sent bytes that are not a valid reply. The
//!   connection is closed since the stream cannot be resynchronised.
//! - `ValueTooLarge`: rejected before anything was sent.
//!
//! Misses are never errors: they surface as `Ok(None)` / `Ok(false)`.

use crate::protocol::{ParseError, Status};
use crate::ring::RingError;
use thiserror::Error;

/// Result type used throughout the client.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the client.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure talking to `server`
    #[error("{server}: {message}")]
    Network {
        server: String,
        message: String,
        /// The server has been marked down as a result
        down: bool,
    },

    /// No live server could be found for the key
    #[error("no server available")]
    NoServerAvailable,

    /// Malformed or unexpected reply from `server`
    #[error("{server}: protocol error: {source}")]
    Protocol {
        server: String,
        #[source]
        source: ParseError,
    },

    /// The value exceeds `value_max_bytes`
    #[error("value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// The key cannot be sent to memcached
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A server address could not be parsed
    #[error("invalid server address: {0}")]
    InvalidServer(String),

    /// The server rejected the request
    #[error("{server} replied {status}: {message}")]
    Server {
        server: String,
        status: Status,
        message: String,
    },

    /// The connection API was driven out of order; this is a bug in the
    /// calling code, not a runtime condition
    #[error("connection misuse: {0}")]
    Misuse(&'static str),
}

impl Error {
    /// Wraps a decoding failure with the server that sent the bytes.
    pub fn protocol(server: impl Into<String>, source: ParseError) -> Self {
        Error::Protocol {
            server: server.into(),
            source,
        }
    }

    /// Returns true for network errors that are worth one retry with a
    /// fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { down: false, .. })
    }

    /// Returns true for any socket-level failure.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
}

impl From<RingError> for Error {
    fn from(err: RingError) -> Self {
        match err {
            RingError::NoServerAvailable => Error::NoServerAvailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let transient = Error::Network {
            server: "a:11211".to_string(),
            message: "timed out".to_string(),
            down: false,
        };
        let down = Error::Network {
            server: "a:11211".to_string(),
            message: "is down".to_string(),
            down: true,
        };
        assert!(transient.is_retryable());
        assert!(!down.is_retryable());
        assert!(down.is_network());
        assert!(!Error::NoServerAvailable.is_retryable());
    }

    #[test]
    fn test_ring_error_conversion() {
        let err: Error = RingError::NoServerAvailable.into();
        assert!(matches!(err, Error::NoServerAvailable));
    }

    #[test]
    fn test_display() {
        let err = Error::ValueTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "value too large: 10 bytes (max: 5)");

        let err = Error::protocol("a:11211", ParseError::InvalidMagic(0x80));
        assert_eq!(err.to_string(), "a:11211: protocol error: invalid magic byte: 0x80");
        assert!(!err.is_network());
    }
}
