//! Connection and listener abstractions shared by every transport

use crate::error::{OnrampError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A bidirectional byte stream
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased connection
pub type BoxedConn = Box<dyn Connection>;

/// Stream listener
///
/// Implemented by every transport's listener and by the TLS wrapper, so the
/// relay and HTTP-style servers can treat them uniformly.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection, returning it with the peer's address
    async fn accept(&self) -> Result<(BoxedConn, String)>;

    /// Address peers use to reach this listener
    fn addr(&self) -> String;

    /// Stop accepting. Pending and later `accept` calls return `Closed`.
    async fn close(&self) -> Result<()>;
}

/// Plain TCP listener
pub struct LocalListener {
    inner: tokio::net::TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl LocalListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Self::from_tokio(inner)
    }

    pub fn from_tokio(inner: tokio::net::TcpListener) -> Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(LocalListener {
            inner,
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for LocalListener {
    async fn accept(&self) -> Result<(BoxedConn, String)> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(OnrampError::Closed),
            accepted = self.inner.accept() => {
                let (stream, peer) = accepted?;
                Ok((Box::new(stream) as BoxedConn, peer.to_string()))
            }
        }
    }

    fn addr(&self) -> String {
        self.local_addr.to_string()
    }

    async fn close(&self) -> Result<()> {
        debug!(addr = %self.local_addr, "Closing local listener");
        self.closed.cancel();
        Ok(())
    }
}

/// Dial a plain TCP connection
pub async fn dial_tcp(addr: &str) -> Result<BoxedConn> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| OnrampError::dial(addr, e))?;
    stream.set_nodelay(true).ok();
    Ok(Box::new(stream))
}
