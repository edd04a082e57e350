//! Memcached Meta Text Protocol
//!
//! The meta protocol is line oriented. Each command is a two-letter verb,
//! the key, and a list of single-letter flags, terminated by CRLF:
//!
//! ```text
//! mg foo v f c k q\r\n          get value, flags, cas and key; quiet on miss
//! ms foo 3 c F0 T60\r\nbar\r\n  store "bar" for 60 seconds
//! md foo q\r\n                  delete quietly
//! ma foo v D1\r\n               increment by one, return the new value
//! mn\r\n                        no-op, echoed as MN\r\n
//! ```
//!
//! Replies start with a two-letter code (`VA`, `HD`, `EN`, `NF`, `NS`, `EX`,
//! `MN`) followed by return flags. `VA <len>` is followed by a data block of
//! `len` bytes plus CRLF. The legacy `stats`, `version` and `flush_all`
//! commands reply with `STAT`/`END`, `VERSION` and `OK` lines.
//!
//! Keys containing whitespace, control or non-ASCII bytes are sent base64
//! encoded with the `b` flag; the server echoes them the same way.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::parser::{find_crlf, ParseError, ParseResult, MAX_VALUE_SIZE};
use crate::protocol::types::{ArithMode, Request, Response, Status, StoreMode, CRLF};

/// Returns true if `key` cannot be sent verbatim in a meta command.
pub fn needs_base64(key: &[u8]) -> bool {
    key.iter().any(|&b| b <= b' ' || b >= 0x7f)
}

/// Encodes `request` as a meta command line (plus data block for stores).
pub fn encode_request(request: &Request<'_>, quiet: bool, buf: &mut BytesMut) {
    match *request {
        Request::Get { key } => {
            let base64 = start_command(buf, b"mg", key);
            buf.extend_from_slice(b" v f c k");
            finish_command(buf, base64, quiet);
        }
        Request::GetAndTouch { key, ttl } => {
            let base64 = start_command(buf, b"mg", key);
            put_flag(buf, b'T', ttl as u64);
            buf.extend_from_slice(b" v f c k");
            finish_command(buf, base64, quiet);
        }
        Request::Touch { key, ttl } => {
            let base64 = start_command(buf, b"mg", key);
            put_flag(buf, b'T', ttl as u64);
            finish_command(buf, base64, quiet);
        }
        Request::Store {
            mode,
            key,
            value,
            flags,
            ttl,
            cas,
        } => {
            let base64 = start_command(buf, b"ms", key);
            buf.put_u8(b' ');
            buf.extend_from_slice(value.len().to_string().as_bytes());
            buf.extend_from_slice(b" c");
            put_flag(buf, b'F', flags as u64);
            put_flag(buf, b'T', ttl as u64);
            if cas != 0 {
                put_flag(buf, b'C', cas);
            }
            match mode {
                StoreMode::Set => {}
                StoreMode::Add => buf.extend_from_slice(b" ME"),
                StoreMode::Replace => buf.extend_from_slice(b" MR"),
                StoreMode::Append => buf.extend_from_slice(b" MA"),
                StoreMode::Prepend => buf.extend_from_slice(b" MP"),
            }
            finish_command(buf, base64, quiet);
            buf.extend_from_slice(value);
            buf.extend_from_slice(CRLF);
        }
        Request::Delete { key, cas } => {
            let base64 = start_command(buf, b"md", key);
            if cas != 0 {
                put_flag(buf, b'C', cas);
            }
            finish_command(buf, base64, quiet);
        }
        Request::Arith {
            mode,
            key,
            delta,
            initial,
            ttl,
        } => {
            let base64 = start_command(buf, b"ma", key);
            buf.extend_from_slice(b" v");
            if let Some(initial) = initial {
                put_flag(buf, b'N', ttl as u64);
                put_flag(buf, b'J', initial);
            }
            put_flag(buf, b'D', delta);
            if mode == ArithMode::Decr {
                buf.extend_from_slice(b" MD");
            }
            finish_command(buf, base64, quiet);
        }
        Request::Flush { delay } => {
            buf.extend_from_slice(b"flush_all");
            if delay > 0 {
                buf.put_u8(b' ');
                buf.extend_from_slice(delay.to_string().as_bytes());
            }
            if quiet {
                buf.extend_from_slice(b" noreply");
            }
            buf.extend_from_slice(CRLF);
        }
        Request::Stats { group } => {
            buf.extend_from_slice(b"stats");
            if let Some(group) = group {
                buf.put_u8(b' ');
                buf.extend_from_slice(group.as_bytes());
            }
            buf.extend_from_slice(CRLF);
        }
        Request::Version => buf.extend_from_slice(b"version\r\n"),
        Request::Noop => buf.extend_from_slice(b"mn\r\n"),
    }
}

/// Writes `<verb> <key>`; returns true if the key had to be base64 encoded.
fn start_command(buf: &mut BytesMut, verb: &[u8], key: &[u8]) -> bool {
    buf.extend_from_slice(verb);
    buf.put_u8(b' ');
    if needs_base64(key) {
        buf.extend_from_slice(STANDARD.encode(key).as_bytes());
        true
    } else {
        buf.extend_from_slice(key);
        false
    }
}

fn finish_command(buf: &mut BytesMut, base64: bool, quiet: bool) {
    if base64 {
        buf.extend_from_slice(b" b");
    }
    if quiet {
        buf.extend_from_slice(b" q");
    }
    buf.extend_from_slice(CRLF);
}

fn put_flag(buf: &mut BytesMut, flag: u8, value: u64) {
    buf.put_u8(b' ');
    buf.put_u8(flag);
    buf.extend_from_slice(value.to_string().as_bytes());
}

/// The decoded first line of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// The line is the whole reply
    Complete(Response),
    /// A `VA` line; `len` bytes of data plus CRLF follow
    Value { len: usize, response: Response },
}

/// Decodes a reply line (without its CRLF).
pub fn decode_head(line: &[u8]) -> ParseResult<Head> {
    let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
    let code = tokens
        .next()
        .ok_or_else(|| ParseError::ProtocolError("empty reply line".to_string()))?;

    let status = match code {
        b"VA" => {
            let len_token = tokens
                .next()
                .ok_or_else(|| ParseError::ProtocolError("VA without length".to_string()))?;
            let len = parse_number(len_token)? as usize;
            if len > MAX_VALUE_SIZE {
                return Err(ParseError::MessageTooLarge {
                    size: len,
                    max: MAX_VALUE_SIZE,
                });
            }
            let response = apply_return_flags(Response::with_status(Status::Ok), tokens)?;
            return Ok(Head::Value { len, response });
        }
        b"HD" | b"MN" | b"OK" | b"END" => Status::Ok,
        b"EN" | b"NF" => Status::NotFound,
        b"NS" => Status::NotStored,
        b"EX" => Status::Exists,
        b"STAT" => return decode_stat(line),
        b"VERSION" => {
            let mut response = Response::with_status(Status::Ok);
            response.value = Bytes::copy_from_slice(rest_after(line, 1));
            return Ok(Head::Complete(response));
        }
        b"ERROR" => Status::UnknownCommand,
        b"CLIENT_ERROR" => Status::InvalidArguments,
        b"SERVER_ERROR" => Status::InternalError,
        other => {
            return Err(ParseError::UnknownResponse(
                String::from_utf8_lossy(other).into_owned(),
            ))
        }
    };

    if matches!(
        status,
        Status::UnknownCommand | Status::InvalidArguments | Status::InternalError
    ) {
        let mut response = Response::with_status(status);
        response.value = Bytes::copy_from_slice(rest_after(line, 1));
        return Ok(Head::Complete(response));
    }

    let response = apply_return_flags(Response::with_status(status), tokens)?;
    Ok(Head::Complete(response))
}

/// Attaches the data block (including its trailing CRLF) to a `VA` head.
pub fn finish_value(mut response: Response, data: &[u8]) -> ParseResult<Response> {
    if data.len() < 2 || &data[data.len() - 2..] != CRLF {
        return Err(ParseError::ProtocolError(
            "value block missing trailing CRLF".to_string(),
        ));
    }
    response.value = Bytes::copy_from_slice(&data[..data.len() - 2]);
    Ok(response)
}

/// Attempts to parse one reply from the front of `buf`.
///
/// - `Ok(Some((response, consumed)))` - a full reply was available
/// - `Ok(None)` - the line or the data block is still incomplete
/// - `Err(e)` - the bytes are not a valid reply
pub fn parse_response(buf: &[u8]) -> ParseResult<Option<(Response, usize)>> {
    let line_end = match find_crlf(buf) {
        Some(pos) => pos,
        None => return Ok(None),
    };

    match decode_head(&buf[..line_end])? {
        Head::Complete(response) => Ok(Some((response, line_end + 2))),
        Head::Value { len, response } => {
            let data_start = line_end + 2;
            let total = data_start + len + 2;
            if buf.len() < total {
                return Ok(None);
            }
            let response = finish_value(response, &buf[data_start..total])?;
            Ok(Some((response, total)))
        }
    }
}

fn apply_return_flags<'a>(
    mut response: Response,
    tokens: impl Iterator<Item = &'a [u8]>,
) -> ParseResult<Response> {
    let mut base64 = false;

    for token in tokens {
        let (flag, arg) = (token[0], &token[1..]);
        match flag {
            b'f' => response.flags = parse_number(arg)? as u32,
            b'c' => response.cas = parse_number(arg)?,
            b'k' => response.key = Bytes::copy_from_slice(arg),
            b'b' => base64 = true,
            // opaque, ttl, size and friends are not requested
            _ => {}
        }
    }

    if base64 && !response.key.is_empty() {
        let decoded = STANDARD
            .decode(&response.key)
            .map_err(|e| ParseError::InvalidBase64(e.to_string()))?;
        response.key = Bytes::from(decoded);
    }

    Ok(response)
}

fn decode_stat(line: &[u8]) -> ParseResult<Head> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let _ = parts.next();
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ParseError::ProtocolError("STAT without a name".to_string()))?;

    let mut response = Response::with_status(Status::Ok);
    response.key = Bytes::copy_from_slice(name);
    response.value = Bytes::copy_from_slice(parts.next().unwrap_or_default());
    Ok(Head::Complete(response))
}

/// Returns the bytes after the first `skip` space-separated tokens.
fn rest_after(line: &[u8], skip: usize) -> &[u8] {
    let mut rest = line;
    for _ in 0..skip {
        match rest.iter().position(|&b| b == b' ') {
            Some(pos) => rest = &rest[pos + 1..],
            None => return &[],
        }
    }
    rest
}

fn parse_number(token: &[u8]) -> ParseResult<u64> {
    std::str::from_utf8(token)
        .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?
        .parse()
        .map_err(|e: std::num::ParseIntError| ParseError::InvalidInteger(e.to_string()))
}
