//! In-process memcached stand-in for the unit tests.
//!
//! [`MockMemcached`] speaks both dialects over `tokio::io::duplex` pipes with
//! a bounded buffer. It handles one request at a time and writes each reply
//! before reading the next request, like a real server under load, so a
//! client that writes without reading eventually stalls it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::client::Client;
use crate::config::{ClientConfig, ConnectionOptions};
use crate::connection::{BoxStream, Connector, Stream};
use crate::protocol::binary::tests::response_frame;
use crate::protocol::binary::{Header, Opcode, HEADER_SIZE};
use crate::protocol::parser::find_crlf;
use crate::protocol::{Protocol, Status};
use crate::server::ServerAddr;

/// Connection options with short timeouts and no retry pause.
pub(crate) fn test_options(protocol: Protocol) -> ConnectionOptions {
    ConnectionOptions {
        protocol,
        socket_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        socket_max_failures: 2,
        socket_failure_delay: Duration::ZERO,
        down_retry_delay: Duration::from_secs(30),
    }
}

/// Client config matching [`test_options`].
pub(crate) fn test_config(protocol: Protocol, servers: &[&str]) -> ClientConfig {
    ClientConfig {
        servers: servers.iter().map(|s| s.to_string()).collect(),
        protocol,
        socket_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        socket_failure_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Builds a client whose configured servers are all mock servers. The
/// mocks are returned in configuration order.
pub(crate) fn mock_client(config: ClientConfig) -> (Client, Vec<MockMemcached>, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::new());
    let mocks = config
        .servers
        .iter()
        .map(|name| {
            let mock = MockMemcached::new(config.protocol);
            connector.register(name, &mock);
            mock
        })
        .collect();
    let client = Client::with_connector(config, connector.clone()).expect("client");
    (client, mocks, connector)
}

#[derive(Debug, Clone)]
struct Item {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

#[derive(Debug, Default)]
struct Store {
    items: HashMap<Vec<u8>, Item>,
    next_cas: u64,
}

impl Store {
    fn next_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }
}

/// Outcome of a store command.
enum Stored {
    Ok(u64),
    NotStored,
    Exists,
    NotFound,
}

/// Outcome of an arithmetic command.
enum Counted {
    Ok(u64),
    NotFound,
    NonNumeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// A fake server with its own item store.
#[derive(Debug, Clone)]
pub(crate) struct MockMemcached {
    protocol: Protocol,
    capacity: usize,
    store: Arc<Mutex<Store>>,
    stalled: Arc<AtomicBool>,
    requests: Arc<AtomicUsize>,
}

impl MockMemcached {
    pub(crate) fn new(protocol: Protocol) -> Self {
        Self::with_capacity(protocol, 64 * 1024)
    }

    /// Creates a server whose pipes buffer at most `capacity` bytes in each
    /// direction.
    pub(crate) fn with_capacity(protocol: Protocol, capacity: usize) -> Self {
        Self {
            protocol,
            capacity,
            store: Arc::new(Mutex::new(Store::default())),
            stalled: Arc::new(AtomicBool::new(false)),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) {
        let mut store = self.store.lock().unwrap();
        let cas = store.next_cas();
        store.items.insert(
            key.to_vec(),
            Item {
                value: value.to_vec(),
                flags: 0,
                cas,
            },
        );
    }

    pub(crate) fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.lock().unwrap().items.get(key).map(|i| i.value.clone())
    }

    pub(crate) fn flags(&self, key: &[u8]) -> Option<u32> {
        self.store.lock().unwrap().items.get(key).map(|i| i.flags)
    }

    pub(crate) fn keys(&self) -> Vec<Vec<u8>> {
        self.store.lock().unwrap().items.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.store.lock().unwrap().items.len()
    }

    /// While stalled, requests are read and never answered.
    pub(crate) fn stall(&self, on: bool) {
        self.stalled.store(on, Ordering::SeqCst);
    }

    /// Number of requests handled so far
    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Opens a new client stream served by this server.
    pub(crate) fn open(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(self.capacity);
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.serve(server).await;
        });
        client
    }

    async fn serve(self, mut stream: DuplexStream) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            if self.stalled.load(Ordering::SeqCst) {
                buf.clear();
            }
            while let Some(reply) = self.handle(&mut buf) {
                self.requests.fetch_add(1, Ordering::SeqCst);
                if !reply.is_empty() {
                    stream.write_all(&reply).await?;
                }
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    /// Consumes one request from `buf` and returns its reply, which is
    /// empty for quiet requests that succeeded.
    fn handle(&self, buf: &mut BytesMut) -> Option<Vec<u8>> {
        match self.protocol {
            Protocol::Binary => self.handle_binary(buf),
            Protocol::Meta => self.handle_meta(buf),
        }
    }

    // ------------------------------------------------------------------
    // Shared item logic
    // ------------------------------------------------------------------

    fn fetch(&self, key: &[u8]) -> Option<Item> {
        self.store.lock().unwrap().items.get(key).cloned()
    }

    fn store(&self, mode: Mode, key: &[u8], value: &[u8], flags: u32, cas: u64) -> Stored {
        let mut store = self.store.lock().unwrap();
        let existing = store.items.get(key).cloned();

        match (&existing, cas) {
            (None, c) if c != 0 => return Stored::NotFound,
            (Some(item), c) if c != 0 && item.cas != c => return Stored::Exists,
            _ => {}
        }

        let data = match (mode, existing) {
            (Mode::Add, Some(_)) => return Stored::NotStored,
            (Mode::Replace | Mode::Append | Mode::Prepend, None) => return Stored::NotStored,
            (Mode::Append, Some(item)) => [item.value, value.to_vec()].concat(),
            (Mode::Prepend, Some(item)) => [value.to_vec(), item.value].concat(),
            _ => value.to_vec(),
        };

        let new_cas = store.next_cas();
        store.items.insert(
            key.to_vec(),
            Item {
                value: data,
                flags,
                cas: new_cas,
            },
        );
        Stored::Ok(new_cas)
    }

    fn delete(&self, key: &[u8], cas: u64) -> Status {
        let mut store = self.store.lock().unwrap();
        match store.items.get(key) {
            None => Status::NotFound,
            Some(item) if cas != 0 && item.cas != cas => Status::Exists,
            Some(_) => {
                store.items.remove(key);
                Status::Ok
            }
        }
    }

    fn arith(&self, key: &[u8], incr: bool, delta: u64, initial: Option<u64>) -> Counted {
        let mut store = self.store.lock().unwrap();
        let cas = store.next_cas();
        let current = match store.items.get(key) {
            None => match initial {
                Some(initial) => {
                    store.items.insert(
                        key.to_vec(),
                        Item {
                            value: initial.to_string().into_bytes(),
                            flags: 0,
                            cas,
                        },
                    );
                    return Counted::Ok(initial);
                }
                None => return Counted::NotFound,
            },
            Some(item) => match std::str::from_utf8(&item.value).ok().and_then(|s| s.parse::<u64>().ok()) {
                Some(n) => n,
                None => return Counted::NonNumeric,
            },
        };

        let next = if incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        if let Some(item) = store.items.get_mut(key) {
            item.value = next.to_string().into_bytes();
            item.cas = cas;
        }
        Counted::Ok(next)
    }

    fn flush(&self) {
        self.store.lock().unwrap().items.clear();
    }

    fn stats(&self) -> Vec<(String, String)> {
        vec![
            ("pid".to_string(), std::process::id().to_string()),
            ("curr_items".to_string(), self.len().to_string()),
            ("version".to_string(), "1.6.21".to_string()),
        ]
    }

    // ------------------------------------------------------------------
    // Binary dialect
    // ------------------------------------------------------------------

    fn handle_binary(&self, buf: &mut BytesMut) -> Option<Vec<u8>> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let header = Header::decode(buf).expect("request header");
        if buf.len() < header.frame_len() {
            return None;
        }
        let frame = buf.split_to(header.frame_len());
        let body = &frame[HEADER_SIZE..];
        let extras = &body[..header.extra_length as usize];
        let key = &body[extras.len()..extras.len() + header.key_length as usize];
        let value = &body[extras.len() + key.len()..];

        let opcode = Opcode::from_u8(header.opcode).expect("known opcode");
        let quiet = opcode_loud(opcode) != opcode;
        let reply = |status: Status, key: &[u8], extras: &[u8], value: &[u8], cas: u64| {
            response_frame(opcode, status, key, extras, value, cas).to_vec()
        };
        let status_only = |status: Status| {
            if quiet && status == Status::Ok {
                Vec::new()
            } else {
                reply(status, &[], &[], &[], 0)
            }
        };

        use Opcode::*;
        let out = match opcode {
            Get | GetQ | GetK | GetKQ | Gat | GatQ | Touch => {
                let echo_key: &[u8] = if matches!(opcode, GetK | GetKQ) { key } else { &[] };
                match self.fetch(key) {
                    Some(item) if opcode == Touch => reply(Status::Ok, &[], &[], &[], item.cas),
                    Some(item) => reply(Status::Ok, echo_key, &item.flags.to_be_bytes(), &item.value, item.cas),
                    None if quiet => Vec::new(),
                    None => reply(Status::NotFound, echo_key, &[], b"Not found", 0),
                }
            }
            Set | SetQ | Add | AddQ | Replace | ReplaceQ | Append | AppendQ | Prepend | PrependQ => {
                let mode = match opcode {
                    Add | AddQ => Mode::Add,
                    Replace | ReplaceQ => Mode::Replace,
                    Append | AppendQ => Mode::Append,
                    Prepend | PrependQ => Mode::Prepend,
                    _ => Mode::Set,
                };
                let flags = if extras.len() >= 4 { be_u32(extras) } else { 0 };
                match self.store(mode, key, value, flags, header.cas) {
                    Stored::Ok(_) if quiet => Vec::new(),
                    Stored::Ok(cas) => reply(Status::Ok, &[], &[], &[], cas),
                    Stored::NotStored => reply(Status::NotStored, &[], &[], &[], 0),
                    Stored::Exists => reply(Status::Exists, &[], &[], &[], 0),
                    Stored::NotFound => reply(Status::NotFound, &[], &[], &[], 0),
                }
            }
            Delete | DeleteQ => status_only(self.delete(key, header.cas)),
            Increment | IncrementQ | Decrement | DecrementQ => {
                let delta = be_u64(&extras[..8]);
                let initial = be_u64(&extras[8..16]);
                let expiry = be_u32(&extras[16..]);
                let initial = (expiry != u32::MAX).then_some(initial);
                let incr = matches!(opcode, Increment | IncrementQ);
                match self.arith(key, incr, delta, initial) {
                    Counted::Ok(_) if quiet => Vec::new(),
                    Counted::Ok(n) => reply(Status::Ok, &[], &[], &n.to_be_bytes(), 0),
                    Counted::NotFound => reply(Status::NotFound, &[], &[], &[], 0),
                    Counted::NonNumeric => reply(Status::NonNumeric, &[], &[], &[], 0),
                }
            }
            Flush | FlushQ => {
                self.flush();
                status_only(Status::Ok)
            }
            Noop => reply(Status::Ok, &[], &[], &[], 0),
            Version => reply(Status::Ok, &[], &[], b"1.6.21", 0),
            Stat => {
                let mut out = Vec::new();
                for (name, value) in self.stats() {
                    out.extend(reply(Status::Ok, name.as_bytes(), &[], value.as_bytes(), 0));
                }
                out.extend(reply(Status::Ok, &[], &[], &[], 0));
                out
            }
            _ => reply(Status::UnknownCommand, &[], &[], &[], 0),
        };
        Some(out)
    }

    // ------------------------------------------------------------------
    // Meta dialect
    // ------------------------------------------------------------------

    fn handle_meta(&self, buf: &mut BytesMut) -> Option<Vec<u8>> {
        let line_end = find_crlf(buf)?;
        let line = buf[..line_end].to_vec();
        let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect();
        let verb = tokens.first().copied().unwrap_or_default();

        let mut data = Vec::new();
        if verb == b"ms" {
            let len: usize = ascii(tokens[2]).parse().expect("ms length");
            if buf.len() < line_end + 2 + len + 2 {
                return None;
            }
            data = buf[line_end + 2..line_end + 2 + len].to_vec();
            buf.advance(line_end + 2 + len + 2);
        } else {
            buf.advance(line_end + 2);
        }

        let out = match verb {
            b"mg" | b"ms" | b"md" | b"ma" => {
                let sent_key = tokens[1];
                let flag_start = if verb == b"ms" { 3 } else { 2 };
                let flags = MetaFlags::parse(&tokens[flag_start..]);
                let key = if flags.base64 {
                    STANDARD.decode(sent_key).expect("base64 key")
                } else {
                    sent_key.to_vec()
                };
                match verb {
                    b"mg" => self.meta_get(&key, sent_key, &flags),
                    b"ms" => self.meta_set(&key, &data, &flags),
                    b"md" => self.meta_delete(&key, &flags),
                    _ => self.meta_arith(&key, &flags),
                }
            }
            b"mn" => b"MN\r\n".to_vec(),
            b"version" => b"VERSION 1.6.21\r\n".to_vec(),
            b"flush_all" => {
                self.flush();
                if tokens.last() == Some(&&b"noreply"[..]) {
                    Vec::new()
                } else {
                    b"OK\r\n".to_vec()
                }
            }
            b"stats" => {
                let mut out = Vec::new();
                for (name, value) in self.stats() {
                    out.extend_from_slice(format!("STAT {} {}\r\n", name, value).as_bytes());
                }
                out.extend_from_slice(b"END\r\n");
                out
            }
            _ => b"ERROR\r\n".to_vec(),
        };
        Some(out)
    }

    fn meta_get(&self, key: &[u8], sent_key: &[u8], flags: &MetaFlags) -> Vec<u8> {
        let item = match self.fetch(key) {
            Some(item) => item,
            None if flags.quiet => return Vec::new(),
            None => return b"EN\r\n".to_vec(),
        };

        let mut ret = String::new();
        if flags.return_flags {
            ret.push_str(&format!(" f{}", item.flags));
        }
        if flags.return_cas {
            ret.push_str(&format!(" c{}", item.cas));
        }
        if flags.return_key {
            ret.push_str(&format!(" k{}", ascii(sent_key)));
            if flags.base64 {
                ret.push_str(" b");
            }
        }

        if flags.return_value {
            let mut out = format!("VA {}{}\r\n", item.value.len(), ret).into_bytes();
            out.extend_from_slice(&item.value);
            out.extend_from_slice(b"\r\n");
            out
        } else {
            format!("HD{}\r\n", ret).into_bytes()
        }
    }

    fn meta_set(&self, key: &[u8], data: &[u8], flags: &MetaFlags) -> Vec<u8> {
        let mode = match flags.mode {
            Some(b'E') => Mode::Add,
            Some(b'R') => Mode::Replace,
            Some(b'A') => Mode::Append,
            Some(b'P') => Mode::Prepend,
            _ => Mode::Set,
        };
        match self.store(mode, key, data, flags.client_flags, flags.compare_cas) {
            Stored::Ok(_) if flags.quiet => Vec::new(),
            Stored::Ok(cas) if flags.return_cas => format!("HD c{}\r\n", cas).into_bytes(),
            Stored::Ok(_) => b"HD\r\n".to_vec(),
            Stored::NotStored => b"NS\r\n".to_vec(),
            Stored::Exists => b"EX\r\n".to_vec(),
            Stored::NotFound => b"NF\r\n".to_vec(),
        }
    }

    fn meta_delete(&self, key: &[u8], flags: &MetaFlags) -> Vec<u8> {
        match self.delete(key, flags.compare_cas) {
            Status::Ok | Status::NotFound if flags.quiet => Vec::new(),
            Status::Ok => b"HD\r\n".to_vec(),
            Status::NotFound => b"NF\r\n".to_vec(),
            _ => b"EX\r\n".to_vec(),
        }
    }

    fn meta_arith(&self, key: &[u8], flags: &MetaFlags) -> Vec<u8> {
        let incr = flags.mode != Some(b'D');
        let initial = flags.autovivify.then_some(flags.initial);
        match self.arith(key, incr, flags.delta, initial) {
            Counted::Ok(_) if flags.quiet => Vec::new(),
            Counted::Ok(n) if flags.return_value => {
                let n = n.to_string();
                format!("VA {}\r\n{}\r\n", n.len(), n).into_bytes()
            }
            Counted::Ok(_) => b"HD\r\n".to_vec(),
            Counted::NotFound => b"NF\r\n".to_vec(),
            Counted::NonNumeric => {
                b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec()
            }
        }
    }
}

/// Request flags of a meta command.
#[derive(Debug, Default)]
struct MetaFlags {
    base64: bool,
    quiet: bool,
    return_value: bool,
    return_flags: bool,
    return_cas: bool,
    return_key: bool,
    client_flags: u32,
    compare_cas: u64,
    mode: Option<u8>,
    autovivify: bool,
    initial: u64,
    delta: u64,
}

impl MetaFlags {
    fn parse(tokens: &[&[u8]]) -> Self {
        let mut flags = MetaFlags {
            delta: 1,
            ..Default::default()
        };
        for token in tokens {
            let arg = ascii(&token[1..]);
            match token[0] {
                b'b' => flags.base64 = true,
                b'q' => flags.quiet = true,
                b'v' => flags.return_value = true,
                b'f' => flags.return_flags = true,
                b'c' => flags.return_cas = true,
                b'k' => flags.return_key = true,
                b'F' => flags.client_flags = arg.parse().unwrap_or(0),
                b'C' => flags.compare_cas = arg.parse().unwrap_or(0),
                b'M' => flags.mode = token.get(1).copied(),
                b'N' => flags.autovivify = true,
                b'J' => flags.initial = arg.parse().unwrap_or(0),
                b'D' => flags.delta = arg.parse().unwrap_or(1),
                _ => {}
            }
        }
        flags
    }
}

/// Returns the loud counterpart of a quiet opcode.
fn opcode_loud(opcode: Opcode) -> Opcode {
    use Opcode::*;
    match opcode {
        GetQ => Get,
        GetKQ => GetK,
        SetQ => Set,
        AddQ => Add,
        ReplaceQ => Replace,
        DeleteQ => Delete,
        IncrementQ => Increment,
        DecrementQ => Decrement,
        QuitQ => Quit,
        FlushQ => Flush,
        AppendQ => Append,
        PrependQ => Prepend,
        GatQ => Gat,
        other => other,
    }
}

fn ascii(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).expect("ascii token")
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes"))
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"))
}

/// Routes connections to mock servers by server name.
#[derive(Debug, Default)]
pub(crate) struct MockConnector {
    servers: Mutex<HashMap<String, MockMemcached>>,
    refused: Mutex<HashSet<String>>,
    refuse_all: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `server` under a generated name and returns its address.
    pub(crate) fn add(&self, server: &MockMemcached) -> ServerAddr {
        let mut servers = self.servers.lock().unwrap();
        let addr = ServerAddr::tcp(format!("mock{}", servers.len()), 11211);
        servers.insert(addr.name(), server.clone());
        addr
    }

    /// Registers `server` under `name` (`host:port`).
    pub(crate) fn register(&self, name: &str, server: &MockMemcached) {
        self.servers
            .lock()
            .unwrap()
            .insert(name.to_string(), server.clone());
    }

    /// Refuses every connection attempt while set.
    pub(crate) fn refuse(&self, on: bool) {
        self.refuse_all.store(on, Ordering::SeqCst);
    }

    /// Refuses connections to one server while set.
    pub(crate) fn refuse_server(&self, name: &str, on: bool) {
        let mut refused = self.refused.lock().unwrap();
        if on {
            refused.insert(name.to_string());
        } else {
            refused.remove(name);
        }
    }

    /// Number of connection attempts, refused ones included
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect<'a>(&'a self, server: &'a ServerAddr) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let name = server.name();
            if self.refuse_all.load(Ordering::SeqCst) || self.refused.lock().unwrap().contains(&name) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let mock = self.servers.lock().unwrap().get(&name).cloned();
            match mock {
                Some(mock) => Ok(Box::new(mock.open()) as BoxStream),
                None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }
        })
    }
}

/// Hands out one prepared stream, then refuses.
pub(crate) struct OnceConnector {
    stream: Mutex<Option<BoxStream>>,
}

impl OnceConnector {
    pub(crate) fn new(stream: impl Stream + 'static) -> Self {
        Self {
            stream: Mutex::new(Some(Box::new(stream))),
        }
    }
}

impl fmt::Debug for OnceConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceConnector").finish_non_exhaustive()
    }
}

impl Connector for OnceConnector {
    fn connect<'a>(&'a self, _server: &'a ServerAddr) -> BoxFuture<'a, io::Result<BoxStream>> {
        let stream = self.stream.lock().unwrap().take();
        Box::pin(async move { stream.ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused)) })
    }
}
