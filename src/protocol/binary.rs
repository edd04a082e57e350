//! Memcached Binary Protocol
//!
//! Every binary frame starts with a fixed 24-byte header:
//!
//! ```text
//!   Byte/     0       |       1       |       2       |       3       |
//!      /              |               |               |               |
//!     |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
//!     +---------------+---------------+---------------+---------------+
//!    0| Magic         | Opcode        | Key length                    |
//!     +---------------+---------------+---------------+---------------+
//!    4| Extras length | Data type     | Status / vbucket id           |
//!     +---------------+---------------+---------------+---------------+
//!    8| Total body length                                             |
//!     +---------------+---------------+---------------+---------------+
//!   12| Opaque                                                        |
//!     +---------------+---------------+---------------+---------------+
//!   16| CAS                                                           |
//!     |                                                               |
//!     +---------------+---------------+---------------+---------------+
//! ```
//!
//! followed by `extras`, `key` and `value`, whose sizes are given by the
//! header. All multi-byte fields, CAS included, are big-endian.
//!
//! Quiet opcodes (`GETKQ`, `SETQ`, ...) only produce a reply when there is
//! something interesting to say, which is what makes pipelining possible.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::parser::{ParseError, ParseResult, MAX_VALUE_SIZE};
use crate::protocol::types::{ArithMode, Request, Response, Status, StoreMode};

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 24;

/// Magic byte of a request frame
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte of a response frame
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Expiry value telling the server not to create a missing counter
const NO_AUTO_CREATE: u32 = 0xFFFF_FFFF;

/// Binary protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0A,
    Version = 0x0B,
    GetK = 0x0C,
    GetKQ = 0x0D,
    Append = 0x0E,
    Prepend = 0x0F,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1A,
    Touch = 0x1C,
    Gat = 0x1D,
    GatQ = 0x1E,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
}

impl Opcode {
    /// Decodes an opcode byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Opcode::*;
        let op = match byte {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x07 => Quit,
            0x08 => Flush,
            0x09 => GetQ,
            0x0A => Noop,
            0x0B => Version,
            0x0C => GetK,
            0x0D => GetKQ,
            0x0E => Append,
            0x0F => Prepend,
            0x10 => Stat,
            0x11 => SetQ,
            0x12 => AddQ,
            0x13 => ReplaceQ,
            0x14 => DeleteQ,
            0x15 => IncrementQ,
            0x16 => DecrementQ,
            0x17 => QuitQ,
            0x18 => FlushQ,
            0x19 => AppendQ,
            0x1A => PrependQ,
            0x1C => Touch,
            0x1D => Gat,
            0x1E => GatQ,
            0x20 => SaslListMechs,
            0x21 => SaslAuth,
            0x22 => SaslStep,
            _ => return None,
        };
        Some(op)
    }

    /// Returns the quiet counterpart of this opcode, if one exists.
    pub fn quiet(self) -> Self {
        use Opcode::*;
        match self {
            Get => GetQ,
            GetK => GetKQ,
            Set => SetQ,
            Add => AddQ,
            Replace => ReplaceQ,
            Delete => DeleteQ,
            Increment => IncrementQ,
            Decrement => DecrementQ,
            Quit => QuitQ,
            Flush => FlushQ,
            Append => AppendQ,
            Prepend => PrependQ,
            Gat => GatQ,
            other => other,
        }
    }

    /// Returns true for the arithmetic opcodes, whose reply body is a
    /// 64-bit counter.
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Opcode::Increment | Opcode::Decrement | Opcode::IncrementQ | Opcode::DecrementQ
        )
    }
}

/// The fixed 24-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extra_length: u8,
    pub data_type: u8,
    /// Status in a response, vbucket id in a request
    pub status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Builds a request header for a body of the given shape.
    pub fn request(opcode: Opcode, key_len: usize, extra_len: usize, value_len: usize) -> Self {
        Self {
            magic: REQUEST_MAGIC,
            opcode: opcode as u8,
            key_length: key_len as u16,
            extra_length: extra_len as u8,
            data_type: 0,
            status: 0,
            total_body_length: (key_len + extra_len + value_len) as u32,
            opaque: 0,
            cas: 0,
        }
    }

    /// Writes the header in network byte order.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extra_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status);
        buf.put_u32(self.total_body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Reads a header from the first [`HEADER_SIZE`] bytes of `buf`.
    ///
    /// The magic byte is not checked here; see [`Header::decode_response`].
    pub fn decode(buf: &[u8]) -> ParseResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ParseError::ProtocolError(format!(
                "short header: {} bytes",
                buf.len()
            )));
        }

        let total_body_length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let max = MAX_VALUE_SIZE + HEADER_SIZE;
        if total_body_length as usize > max {
            return Err(ParseError::MessageTooLarge {
                size: total_body_length as usize,
                max,
            });
        }

        Ok(Self {
            magic: buf[0],
            opcode: buf[1],
            key_length: u16::from_be_bytes([buf[2], buf[3]]),
            extra_length: buf[4],
            data_type: buf[5],
            status: u16::from_be_bytes([buf[6], buf[7]]),
            total_body_length,
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Reads a header and checks that it belongs to a response frame.
    pub fn decode_response(buf: &[u8]) -> ParseResult<Self> {
        let header = Self::decode(buf)?;
        if header.magic != RESPONSE_MAGIC {
            return Err(ParseError::InvalidMagic(header.magic));
        }
        if (header.extra_length as u32 + header.key_length as u32) > header.total_body_length {
            return Err(ParseError::ProtocolError(format!(
                "body length {} smaller than extras {} + key {}",
                header.total_body_length, header.extra_length, header.key_length
            )));
        }
        Ok(header)
    }

    /// Total size of the frame this header announces.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.total_body_length as usize
    }
}

/// Encodes `request` as a binary frame.
pub fn encode_request(request: &Request<'_>, quiet: bool, buf: &mut BytesMut) {
    let pick = |op: Opcode| if quiet { op.quiet() } else { op };

    match *request {
        Request::Get { key } => {
            // quiet gets must echo the key so hits can be correlated
            let opcode = if quiet { Opcode::GetKQ } else { Opcode::Get };
            write_frame(buf, opcode, key, &[], &[], 0);
        }
        Request::GetAndTouch { key, ttl } => {
            write_frame(buf, pick(Opcode::Gat), key, &ttl.to_be_bytes(), &[], 0);
        }
        Request::Touch { key, ttl } => {
            write_frame(buf, Opcode::Touch, key, &ttl.to_be_bytes(), &[], 0);
        }
        Request::Store {
            mode,
            key,
            value,
            flags,
            ttl,
            cas,
        } => match mode {
            StoreMode::Append | StoreMode::Prepend => {
                let opcode = if mode == StoreMode::Append {
                    Opcode::Append
                } else {
                    Opcode::Prepend
                };
                write_frame(buf, pick(opcode), key, &[], value, cas);
            }
            StoreMode::Set | StoreMode::Add | StoreMode::Replace => {
                let opcode = match mode {
                    StoreMode::Add => Opcode::Add,
                    StoreMode::Replace => Opcode::Replace,
                    _ => Opcode::Set,
                };
                let mut extras = [0u8; 8];
                extras[..4].copy_from_slice(&flags.to_be_bytes());
                extras[4..].copy_from_slice(&ttl.to_be_bytes());
                write_frame(buf, pick(opcode), key, &extras, value, cas);
            }
        },
        Request::Delete { key, cas } => {
            write_frame(buf, pick(Opcode::Delete), key, &[], &[], cas);
        }
        Request::Arith {
            mode,
            key,
            delta,
            initial,
            ttl,
        } => {
            let opcode = match mode {
                ArithMode::Incr => Opcode::Increment,
                ArithMode::Decr => Opcode::Decrement,
            };
            let (initial, expiry) = match initial {
                Some(initial) => (initial, ttl),
                None => (0, NO_AUTO_CREATE),
            };
            let mut extras = [0u8; 20];
            extras[..8].copy_from_slice(&delta.to_be_bytes());
            extras[8..16].copy_from_slice(&initial.to_be_bytes());
            extras[16..].copy_from_slice(&expiry.to_be_bytes());
            write_frame(buf, pick(opcode), key, &extras, &[], 0);
        }
        Request::Flush { delay } => {
            if delay > 0 {
                write_frame(buf, pick(Opcode::Flush), &[], &delay.to_be_bytes(), &[], 0);
            } else {
                write_frame(buf, pick(Opcode::Flush), &[], &[], &[], 0);
            }
        }
        Request::Stats { group } => {
            let key = group.map(str::as_bytes).unwrap_or_default();
            write_frame(buf, Opcode::Stat, key, &[], &[], 0);
        }
        Request::Version => write_frame(buf, Opcode::Version, &[], &[], &[], 0),
        Request::Noop => write_frame(buf, Opcode::Noop, &[], &[], &[], 0),
    }
}

/// Writes one complete request frame.
fn write_frame(buf: &mut BytesMut, opcode: Opcode, key: &[u8], extras: &[u8], value: &[u8], cas: u64) {
    let mut header = Header::request(opcode, key.len(), extras.len(), value.len());
    header.cas = cas;

    buf.reserve(HEADER_SIZE + extras.len() + key.len() + value.len());
    header.encode(buf);
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Decodes a response body once its header is known.
pub fn decode_body(header: &Header, body: &[u8]) -> ParseResult<Response> {
    let extra_len = header.extra_length as usize;
    let key_len = header.key_length as usize;
    if body.len() != header.total_body_length as usize || extra_len + key_len > body.len() {
        return Err(ParseError::ProtocolError(format!(
            "body of {} bytes does not match header",
            body.len()
        )));
    }

    let extras = &body[..extra_len];
    let key = &body[extra_len..extra_len + key_len];
    let value = &body[extra_len + key_len..];

    let flags = if extras.len() >= 4 {
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    } else {
        0
    };

    let status = Status::from_code(header.status);
    let counter = match Opcode::from_u8(header.opcode) {
        Some(op) if op.is_arithmetic() && status == Status::Ok => {
            let bytes: [u8; 8] = value.try_into().map_err(|_| {
                ParseError::ProtocolError(format!("counter reply of {} bytes", value.len()))
            })?;
            Some(u64::from_be_bytes(bytes))
        }
        _ => None,
    };

    Ok(Response {
        status,
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
        flags,
        cas: header.cas,
        counter,
    })
}

/// Attempts to parse one response frame from the front of `buf`.
///
/// - `Ok(Some((response, consumed)))` - a full frame was available
/// - `Ok(None)` - the header or body is still incomplete
/// - `Err(e)` - the bytes are not a valid response frame
pub fn parse_response(buf: &[u8]) -> ParseResult<Option<(Response, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = Header::decode_response(buf)?;
    let total = header.frame_len();
    if buf.len() < total {
        return Ok(None);
    }

    let response = decode_body(&header, &buf[HEADER_SIZE..total])?;
    Ok(Some((response, total)))
}
