//! Listener behind a published onion service

use async_trait::async_trait;
use onramp_core::{BoxedConn, Listener, LocalListener, Result};
use std::net::SocketAddr;

/// Local TCP listener that Tor forwards the onion service's virtual port to.
///
/// `addr()` reports the `.onion` name peers dial, not the loopback socket.
pub struct OnionListener {
    inner: LocalListener,
    onion_addr: String,
}

impl OnionListener {
    pub fn new(inner: LocalListener, onion_addr: String) -> Self {
        OnionListener { inner, onion_addr }
    }

    /// Loopback address Tor forwards to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

#[async_trait]
impl Listener for OnionListener {
    async fn accept(&self) -> Result<(BoxedConn, String)> {
        self.inner.accept().await
    }

    fn addr(&self) -> String {
        self.onion_addr.clone()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
