//! Transport module - the byte stream under a connection.
//!
//! Establishing and negotiating the stream (TLS, proxies) belongs to the
//! caller. The connection only asks a [`StreamFactory`] for a ready stream
//! when it is opened.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::description::ServerAddress;

/// A bidirectional byte stream usable by a connection.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Produces streams for a server address.
#[async_trait]
pub trait StreamFactory: Send + Sync + 'static {
    type Stream: Stream;

    /// Create a connected stream to `address`.
    async fn create(&self, address: &ServerAddress) -> std::io::Result<Self::Stream>;
}

/// Plain TCP streams.
#[derive(Debug, Clone)]
pub struct TcpStreamFactory {
    nodelay: bool,
}

impl TcpStreamFactory {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Enable or disable Nagle's algorithm (disabled by default).
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamFactory for TcpStreamFactory {
    type Stream = TcpStream;

    async fn create(&self, address: &ServerAddress) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}
