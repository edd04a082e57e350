//! Connection State Machine
//!
//! A [`Connection`] owns at most one socket to one server and guards it with
//! a small state machine, so a socket whose last exchange was interrupted is
//! never reused:
//!
//! ```text
//!                     ensure_connected()
//!   Disconnected ─────────────────────────────> Idle
//!        ^                                      │  │
//!        │ close() / socket error / fork        │  │ pipeline_begin()
//!        │                                      │  v
//!        │                           request()  │  Pipeline { complete: false }
//!        │                                      │  │
//!        │                                      v  │ terminator parsed
//!        └──────────────────────────────── Request │
//!                                               │  v
//!                                   reply read  │  Pipeline { complete: true }
//!                                               v
//!                                              Idle
//! ```
//!
//! ## Failure Escalation
//!
//! Every socket-level error closes the socket and bumps the failure count
//! kept in the shared [`Health`]. Below `socket_max_failures` the caller gets
//! a retryable `Network` error after a short `socket_failure_delay`; at the
//! threshold the server is marked down and the error is terminal. A down
//! server is not contacted again until `down_retry_delay` has passed.
//!
//! Malformed replies close the socket too but are reported as `Protocol`
//! errors: the stream cannot be resynchronised, but the server is reachable.
//!
//! ## Pipelined Reads
//!
//! Batched gets send one quiet get per key followed by a no-op. Misses
//! produce no reply at all, so the no-op's reply is the only way to know the
//! batch is finished. Replies are assembled incrementally: a frame whose
//! body has not fully arrived is left in the buffer untouched.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionOptions;
use crate::connection::buffer::FrameReader;
use crate::connection::health::Health;
use crate::connection::transport::Connector;
use crate::error::{Error, Result};
use crate::protocol::binary::{self, Header, HEADER_SIZE};
use crate::protocol::meta::{self, Head};
use crate::protocol::{ParseError, Protocol, Request, Response, ResponseParser};
use crate::server::ServerAddr;

/// Socket-level failures, before they are folded into [`Error`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The reply could not be decoded
    #[error("parse error: {0}")]
    ParseError(#[from] ParseError),

    /// A read, write or connect exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server closed the stream
    #[error("connection closed by server")]
    Closed,

    /// A pipelined read was given up before its terminator arrived
    #[error("pipelined request abandoned")]
    Abandoned,
}

/// Where the connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No exchange in flight
    Idle,
    /// An ordinary request was sent and its reply not yet fully read
    Request,
    /// A pipelined get batch is open on this socket
    Pipeline { complete: bool },
}

/// One socket to one server.
#[derive(Debug)]
pub struct Connection {
    server: ServerAddr,
    name: String,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    health: Arc<Health>,
    reader: Option<FrameReader>,
    parser: ResponseParser,
    state: State,
    /// Process id at connect time
    pid: Option<u32>,
}

impl Connection {
    /// Creates an unconnected connection; the socket is opened lazily.
    pub fn new(server: ServerAddr, options: ConnectionOptions, connector: Arc<dyn Connector>) -> Self {
        let name = server.name();
        Self {
            health: Arc::new(Health::new(name.clone(), options.down_retry_delay)),
            parser: ResponseParser::new(options.protocol),
            server,
            name,
            options,
            connector,
            reader: None,
            state: State::Idle,
            pid: None,
        }
    }

    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    /// Returns the `host:port` (or socket path) name of the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.options.protocol
    }

    /// Returns the liveness record shared with the hash ring.
    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    /// Returns true if requests may be sent to this server.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens the socket if it is not open yet.
    ///
    /// A server marked down is not contacted until `down_retry_delay` has
    /// passed; until then this fails immediately.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }

        if let Some(wait) = self.health.retry_after() {
            trace!(server = %self.name, retry_in = ?wait, "Server still down");
            return Err(Error::Network {
                server: self.name.clone(),
                message: format!("server is down, next attempt in {:?}", wait),
                down: true,
            });
        }

        let limit = self.options.connect_timeout;
        let connected = tokio::time::timeout(limit, self.connector.connect(&self.server)).await;
        match connected {
            Ok(Ok(stream)) => {
                self.reader = Some(FrameReader::new(stream, self.options.socket_timeout));
                self.pid = Some(std::process::id());
                self.state = State::Idle;
                self.health.mark_connected();
                debug!(server = %self.name, "Connected");
                Ok(())
            }
            Ok(Err(e)) => Err(self.failure(e.into()).await),
            Err(_) => Err(self.failure(ConnectionError::Timeout(limit)).await),
        }
    }

    /// Closes the socket. Not counted as a failure.
    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!(server = %self.name, "Connection closed");
        }
        self.state = State::Idle;
        self.pid = None;
        self.health.mark_disconnected();
    }

    /// Makes the connection safe for a new exchange.
    ///
    /// A previous exchange that never finished (typically a caller-level
    /// timeout dropped the future mid-frame) leaves unread bytes behind, and
    /// a socket inherited across a fork is shared with the parent. Either
    /// way the socket is closed so the next request reconnects.
    pub fn confirm_ready(&mut self) {
        match self.state {
            State::Idle | State::Pipeline { complete: true } => self.state = State::Idle,
            state => {
                warn!(server = %self.name, ?state, "Previous request did not finish, reconnecting");
                self.close();
            }
        }

        if self.forked() {
            debug!(server = %self.name, "Process id changed, reconnecting");
            self.close();
        }
    }

    /// Checks that a pipelined read is open before continuing it.
    pub fn confirm_in_progress(&mut self) -> Result<()> {
        if !matches!(self.state, State::Pipeline { .. }) {
            return Err(Error::Misuse("no pipelined request in progress"));
        }

        if self.forked() {
            self.close();
            return Err(Error::Network {
                server: self.name.clone(),
                message: "process forked during a pipelined request".to_string(),
                down: false,
            });
        }

        Ok(())
    }

    fn forked(&self) -> bool {
        matches!(self.pid, Some(pid) if pid != std::process::id())
    }

    #[cfg(test)]
    pub(crate) fn set_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Records a socket failure and converts it into the caller's error.
    async fn failure(&mut self, err: ConnectionError) -> Error {
        let message = err.to_string();
        warn!(server = %self.name, error = %message, "Socket failure");
        self.close();

        let failures = self.health.record_failure();
        if failures >= self.options.socket_max_failures {
            self.health.mark_down();
            info!(
                server = %self.name,
                failures,
                retry_in = ?self.options.down_retry_delay,
                "Marking server down"
            );
            return Error::Network {
                server: self.name.clone(),
                message,
                down: true,
            };
        }

        if !self.options.socket_failure_delay.is_zero() {
            tokio::time::sleep(self.options.socket_failure_delay).await;
        }
        Error::Network {
            server: self.name.clone(),
            message,
            down: false,
        }
    }

    /// Converts an internal error, closing the socket in every case.
    async fn handle_error(&mut self, err: ConnectionError) -> Error {
        match err {
            ConnectionError::ParseError(e) => self.protocol_error(e),
            other => self.failure(other).await,
        }
    }

    fn protocol_error(&mut self, err: ParseError) -> Error {
        warn!(server = %self.name, error = %err, "Malformed reply, closing connection");
        self.close();
        Error::protocol(&self.name, err)
    }

    /// Maps the error of an intermediate step.
    async fn check<T>(&mut self, result: std::result::Result<T, ConnectionError>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.handle_error(e).await),
        }
    }

    /// Maps the result of a whole exchange, returning to idle on success.
    async fn finish<T>(&mut self, result: std::result::Result<T, ConnectionError>) -> Result<T> {
        let value = self.check(result).await?;
        self.state = State::Idle;
        self.health.record_success();
        Ok(value)
    }

    fn reader_mut(&mut self) -> std::result::Result<&mut FrameReader, ConnectionError> {
        self.reader.as_mut().ok_or(ConnectionError::Closed)
    }

    // ========================================================================
    // Ordinary requests
    // ========================================================================

    /// Sends `request` and reads its single reply.
    pub async fn request(&mut self, request: &Request<'_>) -> Result<Response> {
        self.confirm_ready();
        self.ensure_connected().await?;
        self.state = State::Request;

        let result = self.exchange(request).await;
        self.finish(result).await
    }

    /// Sends `request` and reads replies up to and including the
    /// terminator (used for stats listings). The terminator is not returned.
    pub async fn request_all(&mut self, request: &Request<'_>) -> Result<Vec<Response>> {
        self.confirm_ready();
        self.ensure_connected().await?;
        self.state = State::Request;

        let result = self.exchange_all(request).await;
        self.finish(result).await
    }

    /// Sends `requests` quietly followed by a no-op and reads until the
    /// no-op's reply. Quiet requests only answer when something went wrong,
    /// so every reply returned is a failed request.
    pub async fn batch(&mut self, requests: &[Request<'_>]) -> Result<Vec<Response>> {
        self.confirm_ready();
        self.ensure_connected().await?;
        self.state = State::Request;

        let result = self.exchange_batch(requests).await;
        self.finish(result).await
    }

    async fn exchange(&mut self, request: &Request<'_>) -> std::result::Result<Response, ConnectionError> {
        let protocol = self.options.protocol;
        let mut buf = BytesMut::with_capacity(64 + request.value_len());
        request.encode(protocol, false, &mut buf);

        let reader = self.reader_mut()?;
        reader.write_all(&buf).await?;
        read_response(reader, protocol).await
    }

    async fn exchange_all(
        &mut self,
        request: &Request<'_>,
    ) -> std::result::Result<Vec<Response>, ConnectionError> {
        let protocol = self.options.protocol;
        let bytes = request.to_bytes(protocol, false);

        let reader = self.reader_mut()?;
        reader.write_all(&bytes).await?;

        let mut responses = Vec::new();
        loop {
            let response = read_response(reader, protocol).await?;
            // a failed stats request answers with a single error reply
            if response.is_terminator() || !response.is_ok() {
                if !response.is_ok() {
                    responses.push(response);
                }
                return Ok(responses);
            }
            responses.push(response);
        }
    }

    async fn exchange_batch(
        &mut self,
        requests: &[Request<'_>],
    ) -> std::result::Result<Vec<Response>, ConnectionError> {
        let protocol = self.options.protocol;
        let size: usize = requests.iter().map(|r| 64 + r.value_len()).sum();
        let mut buf = BytesMut::with_capacity(size + 32);
        for request in requests {
            request.encode(protocol, true, &mut buf);
        }
        Request::Noop.encode(protocol, false, &mut buf);

        let reader = self.reader_mut()?;
        reader.write_draining(&buf).await?;

        let mut failed = Vec::new();
        loop {
            let response = read_response(reader, protocol).await?;
            if response.is_terminator() {
                return Ok(failed);
            }
            trace!(status = %response.status, "Quiet request failed");
            failed.push(response);
        }
    }

    // ========================================================================
    // Pipelined reads
    // ========================================================================

    /// Opens a pipelined get batch: the connection must be usable, and the
    /// response buffer starts out empty.
    pub async fn pipeline_begin(&mut self) -> Result<()> {
        self.confirm_ready();
        self.ensure_connected().await?;
        if let Some(reader) = self.reader.as_mut() {
            reader.clear();
        }
        self.state = State::Pipeline { complete: false };
        Ok(())
    }

    /// Sends one quiet get per key.
    ///
    /// With `draining` set, replies that arrive while writing are read into
    /// the buffer; this is required once the batch is large enough to fill
    /// the socket buffers in both directions.
    pub async fn pipeline_send<K: AsRef<[u8]>>(&mut self, keys: &[K], draining: bool) -> Result<()> {
        self.confirm_in_progress()?;

        let protocol = self.options.protocol;
        let mut buf = BytesMut::with_capacity(keys.len() * 32);
        for key in keys {
            Request::Get { key: key.as_ref() }.encode(protocol, true, &mut buf);
        }

        let result = match self.reader_mut() {
            Ok(reader) if draining => reader.write_draining(&buf).await.map(|_| ()),
            Ok(reader) => reader.write_all(&buf).await,
            Err(e) => Err(e),
        };
        self.check(result).await?;

        trace!(server = %self.name, keys = keys.len(), "Sent quiet gets");
        Ok(())
    }

    /// Sends the no-op whose reply terminates the batch.
    pub async fn pipeline_response_setup(&mut self) -> Result<()> {
        self.confirm_in_progress()?;

        let noop = Request::Noop.to_bytes(self.options.protocol, false);
        let result = match self.reader_mut() {
            Ok(reader) => reader.write_draining(&noop).await.map(|_| ()),
            Err(e) => Err(e),
        };
        self.check(result).await
    }

    /// Reads once from the socket into the response buffer.
    pub async fn pipeline_fill(&mut self) -> Result<usize> {
        self.confirm_in_progress()?;
        if self.pipeline_complete() {
            return Ok(0);
        }

        let result = match self.reader_mut() {
            Ok(reader) => reader.fill().await,
            Err(e) => Err(e),
        };
        self.check(result).await
    }

    /// Parses every complete reply in the response buffer and returns the
    /// hits. A trailing partial frame stays buffered. Parsing the
    /// terminator completes the pipeline and discards the buffer.
    pub fn pipeline_drain(&mut self) -> Result<Vec<Response>> {
        self.confirm_in_progress()?;
        if self.pipeline_complete() {
            return Ok(Vec::new());
        }

        let parser = self.parser;
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(Error::Misuse("pipelined read on a closed connection")),
        };

        let mut hits = Vec::new();
        let mut complete = false;
        loop {
            match parser.parse(reader.buffered()) {
                Ok(Some((response, consumed))) => {
                    reader.consume(consumed);
                    if response.is_terminator() {
                        reader.clear();
                        complete = true;
                        break;
                    }
                    if response.key.is_empty() {
                        debug!(status = %response.status, "Discarding keyless reply in get batch");
                        continue;
                    }
                    hits.push(response);
                }
                Ok(None) => break,
                Err(e) => return Err(self.protocol_error(e)),
            }
        }

        if complete {
            self.state = State::Pipeline { complete: true };
            self.health.record_success();
            trace!(server = %self.name, "Pipeline complete");
        }
        Ok(hits)
    }

    /// Returns the hits available now, reading from the socket first if the
    /// buffer holds no complete reply.
    pub async fn pipeline_next_responses(&mut self) -> Result<Vec<Response>> {
        let hits = self.pipeline_drain()?;
        if !hits.is_empty() || self.pipeline_complete() {
            return Ok(hits);
        }

        self.pipeline_fill().await?;
        self.pipeline_drain()
    }

    /// True once the terminator of the current batch has been consumed.
    pub fn pipeline_complete(&self) -> bool {
        self.state == State::Pipeline { complete: true }
    }

    /// Gives up on the current batch. The rest of its replies may still be
    /// in flight, so the socket is closed and counted as a failure. Errors
    /// are swallowed; this runs on cleanup paths.
    pub async fn pipeline_abort(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.clear();
        }
        self.state = State::Idle;

        if self.reader.is_some() {
            let err = self.failure(ConnectionError::Abandoned).await;
            debug!(server = %self.name, error = %err, "Aborted pipelined request");
        }
    }
}

/// Reads one complete reply for an ordinary request.
async fn read_response(
    reader: &mut FrameReader,
    protocol: Protocol,
) -> std::result::Result<Response, ConnectionError> {
    match protocol {
        Protocol::Binary => {
            let head = reader.read_exact(HEADER_SIZE).await?;
            let header = Header::decode_response(&head)?;
            let body = reader.read_exact(header.total_body_length as usize).await?;
            Ok(binary::decode_body(&header, &body)?)
        }
        Protocol::Meta => {
            let line = reader.read_line().await?;
            match meta::decode_head(&line)? {
                Head::Complete(response) => Ok(response),
                Head::Value { len, response } => {
                    let data = reader.read_exact(len + 2).await?;
                    Ok(meta::finish_value(response, &data)?)
                }
            }
        }
    }
}
