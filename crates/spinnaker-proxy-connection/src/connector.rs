//! Dialers used by [`Remote`](crate::Remote) to (re)open its connection

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Opens new connections to one fixed endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The byte stream produced by a successful dial
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Make one connection attempt
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human-readable endpoint, used for logging
    fn target(&self) -> String;
}

/// Plain TCP dialer for `host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
