//! Buffered Frame Reader
//!
//! Wraps a server stream with a growable receive buffer. TCP delivers bytes
//! in arbitrary chunks, so replies are assembled here:
//!
//! ```text
//!   socket ──read──> [ consumed | buffered, unparsed bytes | spare ]
//!                               ^
//!                               front: next reply starts here
//! ```
//!
//! Ordinary requests use [`FrameReader::read_line`] and
//! [`FrameReader::read_exact`], which refill transparently. The pipelined
//! path instead calls [`FrameReader::fill`] once per readiness event and lets
//! the incremental parser work on [`FrameReader::buffered`].
//!
//! Every socket operation is bounded by the configured timeout; a draining
//! write is bounded per stall rather than as a whole.

use std::fmt;
use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::io::poll_read_buf;
use tracing::trace;

use crate::connection::handler::ConnectionError;
use crate::connection::transport::BoxStream;
use crate::protocol::parser::find_crlf;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 16 * 1024;

/// Spare capacity kept available before each read
const MIN_READ_SPACE: usize = 4096;

/// A server stream plus its receive buffer.
pub struct FrameReader {
    stream: BoxStream,
    buffer: BytesMut,
    timeout: Duration,
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("buffered", &self.buffer.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FrameReader {
    pub fn new(stream: BoxStream, timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            timeout,
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Drops `n` bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Performs one read from the socket, appending to the buffer.
    ///
    /// A server closing the stream is an error: the client never expects
    /// end-of-stream while waiting for a reply.
    pub async fn fill(&mut self) -> Result<usize, ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < MIN_READ_SPACE {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = timeout(self.timeout, self.stream.read_buf(&mut self.buffer))
            .await
            .map_err(|_| ConnectionError::Timeout(self.timeout))??;

        if n == 0 {
            return Err(ConnectionError::Closed);
        }

        trace!(bytes = n, buffered = self.buffer.len(), "Read data");
        Ok(n)
    }

    /// Returns the next CRLF-terminated line, without the CRLF.
    pub async fn read_line(&mut self) -> Result<Bytes, ConnectionError> {
        let mut searched = 0;
        loop {
            if let Some(pos) = find_crlf(&self.buffer[searched..]) {
                let end = searched + pos;
                let mut line = self.buffer.split_to(end + 2);
                line.truncate(end);
                return Ok(line.freeze());
            }
            // a CR at the very end may pair with the next byte
            searched = self.buffer.len().saturating_sub(1);
            self.fill().await?;
        }
    }

    /// Returns exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, ConnectionError> {
        if self.buffer.len() < n {
            self.buffer.reserve(n - self.buffer.len());
        }
        while self.buffer.len() < n {
            self.fill().await?;
        }
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Writes and flushes `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let stream = &mut self.stream;
        timeout(self.timeout, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout(self.timeout))??;

        trace!(bytes = data.len(), "Sent request");
        Ok(())
    }

    /// Writes and flushes `data` while reading whatever replies arrive in
    /// the meantime into the buffer. Returns the number of bytes read.
    ///
    /// A plain write of a large batch can stall forever: the server stops
    /// reading once its output is full, and its output only empties when we
    /// read. Reading while writing keeps both directions moving.
    ///
    /// The timeout restarts whenever a read or write makes progress, so only
    /// a peer that stops moving in both directions times out.
    pub async fn write_draining(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        let Self {
            stream,
            buffer,
            timeout: limit,
        } = self;
        let limit = *limit;
        let mut written = 0;
        let mut drained = 0;

        let idle = sleep(limit);
        tokio::pin!(idle);

        poll_fn(|cx| -> Poll<Result<(), ConnectionError>> {
            let mut progressed = false;
            let outcome: Poll<Result<(), ConnectionError>> = loop {
                loop {
                    if buffer.capacity() - buffer.len() < MIN_READ_SPACE {
                        buffer.reserve(INITIAL_BUFFER_SIZE);
                    }
                    match poll_read_buf(Pin::new(&mut *stream), cx, &mut *buffer) {
                        Poll::Ready(Ok(0)) => return Poll::Ready(Err(ConnectionError::Closed)),
                        Poll::Ready(Ok(n)) => {
                            drained += n;
                            progressed = true;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                        Poll::Pending => break,
                    }
                }

                if written == data.len() {
                    break Pin::new(&mut *stream).poll_flush(cx).map_err(Into::into);
                }

                match Pin::new(&mut *stream).poll_write(cx, &data[written..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()))
                    }
                    Poll::Ready(Ok(n)) => {
                        written += n;
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => break Poll::Pending,
                }
            };
            if outcome.is_ready() {
                return outcome;
            }

            if progressed {
                idle.as_mut().reset(Instant::now() + limit);
            }
            match idle.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(ConnectionError::Timeout(limit))),
                Poll::Pending => Poll::Pending,
            }
        })
        .await?;

        trace!(
            bytes = data.len(),
            drained,
            buffered = buffer.len(),
            "Sent request while draining"
        );
        Ok(drained)
    }
}
