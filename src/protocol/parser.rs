//! Incremental Response Parser
//!
//! The parser works directly on a byte buffer of data received from a
//! server and never blocks. Like the rest of the crate it follows a simple
//! contract:
//!
//! - `Ok(Some((response, consumed)))` - a complete reply was parsed and
//!   `consumed` bytes can be dropped from the front of the buffer
//! - `Ok(None)` - the reply is incomplete; nothing was consumed
//! - `Err(ParseError)` - the peer sent something that is not a reply
//!
//! This is what lets the pipelined get path resume exactly where it left
//! off after a partial socket read: a frame whose header has arrived but
//! whose body has not is left untouched until the rest shows up.

use crate::protocol::types::{Protocol, Response, CRLF};
use crate::protocol::{binary, meta};
use thiserror::Error;

/// Errors that can occur while decoding server replies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A binary frame did not start with the response magic byte
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// A meta reply line started with an unknown code
    #[error("unknown response: {0}")]
    UnknownResponse(String),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 where text was expected
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// A base64 key returned by the server could not be decoded
    #[error("invalid base64 key: {0}")]
    InvalidBase64(String),

    /// Protocol violation (length mismatch, missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The announced value exceeds the maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Largest value a reply may announce (memcached's own ceiling is 1 GB)
pub const MAX_VALUE_SIZE: usize = 1024 * 1024 * 1024;

/// Parses replies of one protocol dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseParser {
    protocol: Protocol,
}

impl ResponseParser {
    /// Creates a parser for `protocol`.
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    /// Returns the dialect this parser understands.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Attempts to parse one reply from the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Response, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match self.protocol {
            Protocol::Binary => binary::parse_response(buf),
            Protocol::Meta => meta::parse_response(buf),
        }
    }

    /// Parses every complete reply in `buf`, returning them with the total
    /// number of bytes consumed. A trailing partial reply is left alone.
    pub fn parse_all(&self, buf: &[u8]) -> ParseResult<(Vec<Response>, usize)> {
        let mut responses = Vec::new();
        let mut consumed = 0;

        while let Some((response, n)) = self.parse(&buf[consumed..])? {
            responses.push(response);
            consumed += n;
        }

        Ok((responses, consumed))
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
