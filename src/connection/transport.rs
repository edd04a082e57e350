//! Socket Establishment
//!
//! A [`Connector`] turns a [`ServerAddr`] into a byte stream. The default
//! [`TcpConnector`] opens TCP or UNIX domain sockets; tests inject in-memory
//! pipes through the same trait.

use std::fmt;
use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use crate::server::{Endpoint, ServerAddr};

/// A bidirectional byte stream to one server.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Owned, type-erased stream
pub type BoxStream = Box<dyn Stream>;

/// Opens streams to servers.
pub trait Connector: Send + Sync + fmt::Debug {
    fn connect<'a>(&'a self, server: &'a ServerAddr) -> BoxFuture<'a, io::Result<BoxStream>>;
}

/// Connects over TCP or UNIX domain sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, server: &'a ServerAddr) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(async move {
            match &server.endpoint {
                Endpoint::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port)).await?;
                    // requests are small and latency bound
                    stream.set_nodelay(true)?;
                    trace!(server = %server, "TCP connection established");
                    Ok(Box::new(stream) as BoxStream)
                }
                Endpoint::Unix { path } => connect_unix(path).await,
            }
        })
    }
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> io::Result<BoxStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    trace!(path = %path.display(), "UNIX socket connection established");
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_unix(path: &std::path::Path) -> io::Result<BoxStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("UNIX sockets are not supported here: {}", path.display()),
    ))
}
