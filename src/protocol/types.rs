//! Memcached Request and Response Types
//!
//! This module defines the protocol-independent shape of everything that goes
//! over the wire. A [`Request`] is a typed operation; each dialect
//! (`binary`, `meta`) knows how to encode every variant, so there is no
//! runtime lookup table that could miss an operation.
//!
//! ## Operations
//!
//! | Request        | Binary opcode (quiet)  | Meta command      |
//! |----------------|------------------------|-------------------|
//! | `Get`          | `0x00` (`0x0D` GETKQ)  | `mg <key> v f c k`|
//! | `GetAndTouch`  | `0x1D` (`0x1E`)        | `mg <key> T<ttl>` |
//! | `Touch`        | `0x1C`                 | `mg <key> T<ttl>` |
//! | `Store`        | `0x01..0x03`, `0x0E/F` | `ms <key> <len>`  |
//! | `Delete`       | `0x04` (`0x14`)        | `md <key>`        |
//! | `Arith`        | `0x05/0x06`            | `ma <key>`        |
//! | `Flush`        | `0x08` (`0x18`)        | `flush_all`       |
//! | `Stats`        | `0x10`                 | `stats`           |
//! | `Version`      | `0x0B`                 | `version`         |
//! | `Noop`         | `0x0A`                 | `mn`              |
//!
//! Responses from both dialects are decoded into the same [`Response`]
//! structure: a [`Status`] plus the key, value, client flags and CAS token.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::{binary, meta};

/// The CRLF terminator used by the text protocols
pub const CRLF: &[u8] = b"\r\n";

/// Longest key memcached accepts
pub const MAX_KEY_LENGTH: usize = 250;

/// TTLs above this many seconds are interpreted by memcached as absolute
/// unix timestamps rather than relative offsets.
pub const MAX_RELATIVE_TTL: u32 = 60 * 60 * 24 * 30;

/// The wire dialect spoken to the servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// The 24-byte-header binary protocol
    Binary,
    /// The line-oriented meta text protocol
    #[default]
    Meta,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Protocol::Binary),
            "meta" => Ok(Protocol::Meta),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Binary => write!(f, "binary"),
            Protocol::Meta => write!(f, "meta"),
        }
    }
}

/// How a store request treats an existing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally
    Set,
    /// Store only if the key does not exist
    Add,
    /// Store only if the key already exists
    Replace,
    /// Append the data to an existing item
    Append,
    /// Prepend the data to an existing item
    Prepend,
}

/// Direction of an arithmetic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithMode {
    Incr,
    Decr,
}

/// A single logical memcached operation.
///
/// Keys are passed already validated and namespaced; the encoders only deal
/// with the dialect-specific key escaping (base64 for meta).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// Fetch an item
    Get { key: &'a [u8] },

    /// Fetch an item and update its TTL
    GetAndTouch { key: &'a [u8], ttl: u32 },

    /// Update the TTL of an item without fetching it
    Touch { key: &'a [u8], ttl: u32 },

    /// Store data; `cas` of zero means "no compare"
    Store {
        mode: StoreMode,
        key: &'a [u8],
        value: &'a [u8],
        flags: u32,
        ttl: u32,
        cas: u64,
    },

    /// Remove an item; `cas` of zero means "no compare"
    Delete { key: &'a [u8], cas: u64 },

    /// Increment or decrement a counter. With `initial` set, a missing
    /// counter is created with that value instead of reporting a miss.
    Arith {
        mode: ArithMode,
        key: &'a [u8],
        delta: u64,
        initial: Option<u64>,
        ttl: u32,
    },

    /// Invalidate every item, optionally after `delay` seconds
    Flush { delay: u32 },

    /// Request server statistics, optionally a named group
    Stats { group: Option<&'a str> },

    /// Request the server version string
    Version,

    /// No-op; its reply marks the end of a pipelined batch
    Noop,
}

impl<'a> Request<'a> {
    /// Returns the key this request addresses, if any.
    pub fn key(&self) -> Option<&'a [u8]> {
        match *self {
            Request::Get { key }
            | Request::GetAndTouch { key, .. }
            | Request::Touch { key, .. }
            | Request::Store { key, .. }
            | Request::Delete { key, .. }
            | Request::Arith { key, .. } => Some(key),
            Request::Flush { .. } | Request::Stats { .. } | Request::Version | Request::Noop => {
                None
            }
        }
    }

    /// Returns the payload size of a store request.
    pub fn value_len(&self) -> usize {
        match self {
            Request::Store { value, .. } => value.len(),
            _ => 0,
        }
    }

    /// Encodes this request for `protocol` into `buf`.
    ///
    /// Quiet requests suppress the "uninteresting" reply (a miss for gets,
    /// success for writes) so they can be pipelined behind a [`Request::Noop`].
    pub fn encode(&self, protocol: Protocol, quiet: bool, buf: &mut BytesMut) {
        match protocol {
            Protocol::Binary => binary::encode_request(self, quiet, buf),
            Protocol::Meta => meta::encode_request(self, quiet, buf),
        }
    }

    /// Encodes this request into a freshly allocated buffer.
    pub fn to_bytes(&self, protocol: Protocol, quiet: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.value_len());
        self.encode(protocol, quiet, &mut buf);
        buf.freeze()
    }
}

/// Outcome of a request, shared by both dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    /// Miss (`EN`/`NF`, binary 0x0001)
    NotFound,
    /// CAS mismatch (`EX`, binary 0x0002)
    Exists,
    ValueTooLarge,
    InvalidArguments,
    /// Conditional store refused (`NS`, binary 0x0005)
    NotStored,
    NonNumeric,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    /// A binary status code this client does not know
    Other(u16),
}

impl Status {
    /// Maps a binary protocol status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => Status::Ok,
            0x0001 => Status::NotFound,
            0x0002 => Status::Exists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::NotStored,
            0x0006 => Status::NonNumeric,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }

    /// Returns the binary protocol status code.
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 0x0000,
            Status::NotFound => 0x0001,
            Status::Exists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::NotStored => 0x0005,
            Status::NonNumeric => 0x0006,
            Status::AuthError => 0x0020,
            Status::AuthContinue => 0x0021,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::Other(code) => *code,
        }
    }

    /// Returns true for the statuses that describe the item rather than a
    /// failure of the request itself.
    pub fn is_item_outcome(&self) -> bool {
        matches!(
            self,
            Status::Ok | Status::NotFound | Status::Exists | Status::NotStored
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::NotFound => write!(f, "not found"),
            Status::Exists => write!(f, "exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::NotStored => write!(f, "not stored"),
            Status::NonNumeric => write!(f, "incr/decr on non-numeric value"),
            Status::AuthError => write!(f, "authentication error"),
            Status::AuthContinue => write!(f, "authentication continue"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "out of memory"),
            Status::NotSupported => write!(f, "not supported"),
            Status::InternalError => write!(f, "internal error"),
            Status::Busy => write!(f, "busy"),
            Status::TemporaryFailure => write!(f, "temporary failure"),
            Status::Other(code) => write!(f, "status {:#06x}", code),
        }
    }
}

/// One decoded reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub status: Status,
    /// Key echoed by the server; empty when the reply carries none
    pub key: Bytes,
    /// Item data, stat value, version string or error message
    pub value: Bytes,
    /// Client flags stored with the item
    pub flags: u32,
    pub cas: u64,
    /// Counter value of a binary incr/decr reply
    pub counter: Option<u64>,
}

impl Response {
    /// Creates an empty response with the given status.
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Returns true if the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Returns true for the reply that closes a pipelined batch: no key and
    /// an ok status (the no-op echo, or the end of a stats listing).
    pub fn is_terminator(&self) -> bool {
        self.key.is_empty() && self.status == Status::Ok
    }

    /// Returns the counter carried by an arithmetic reply.
    pub fn counter(&self) -> Option<u64> {
        self.counter.or_else(|| {
            std::str::from_utf8(&self.value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
        })
    }

    /// Returns the value as text, lossily.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Converts a relative TTL into what memcached expects: relative seconds up
/// to 30 days, an absolute unix timestamp beyond that.
pub fn sanitize_ttl(ttl: u32) -> u32 {
    if ttl <= MAX_RELATIVE_TTL {
        return ttl;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(now.saturating_add(u64::from(ttl))).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("meta".parse::<Protocol>(), Ok(Protocol::Meta));
        assert_eq!("BINARY".parse::<Protocol>(), Ok(Protocol::Binary));
        assert!("ascii".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_status_code_mapping() {
        for code in [0x00u16, 0x01, 0x02, 0x05, 0x06, 0x81, 0x86] {
            assert_eq!(Status::from_code(code).code(), code);
        }
        assert_eq!(Status::from_code(0x1234), Status::Other(0x1234));
    }

    #[test]
    fn test_request_key() {
        assert_eq!(Request::Get { key: b"foo" }.key(), Some(&b"foo"[..]));
        assert_eq!(Request::Noop.key(), None);
        assert_eq!(Request::Stats { group: Some("slabs") }.key(), None);
    }

    #[test]
    fn test_terminator_detection() {
        assert!(Response::with_status(Status::Ok).is_terminator());
        assert!(!Response::with_status(Status::NotFound).is_terminator());

        let hit = Response {
            key: Bytes::from("k"),
            ..Default::default()
        };
        assert!(!hit.is_terminator());
    }

    #[test]
    fn test_counter_from_text_value() {
        let resp = Response {
            value: Bytes::from("42"),
            ..Default::default()
        };
        assert_eq!(resp.counter(), Some(42));

        let binary = Response {
            counter: Some(7),
            ..Default::default()
        };
        assert_eq!(binary.counter(), Some(7));
    }

    #[test]
    fn test_sanitize_ttl() {
        assert_eq!(sanitize_ttl(0), 0);
        assert_eq!(sanitize_ttl(3600), 3600);
        assert_eq!(sanitize_ttl(MAX_RELATIVE_TTL), MAX_RELATIVE_TTL);

        let absolute = sanitize_ttl(MAX_RELATIVE_TTL + 1);
        assert!(absolute > 1_600_000_000);
    }
}
