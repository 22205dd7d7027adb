//! Raw byte relay from a listener to a remote destination
//!
//! Every accepted connection is piped, untouched, to a fresh connection to
//! the remote address. Put a local service behind an onion or garlic
//! listener, or expose a hidden service on a local port.

use onramp_core::{addr, BoxedConn, Dialer, Listener, OnrampError, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Which dialer a relayed connection uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRoute {
    Garlic,
    Onion,
    Direct,
}

impl RelayRoute {
    /// `.i2p` hosts to Garlic, `.onion` hosts to Onion, anything else direct
    pub fn for_addr(remote_addr: &str) -> Result<Self> {
        let host = addr::hostname(remote_addr)?;
        Ok(if host.ends_with(addr::I2P_SUFFIX) {
            RelayRoute::Garlic
        } else if host.ends_with(addr::ONION_SUFFIX) {
            RelayRoute::Onion
        } else {
            RelayRoute::Direct
        })
    }
}

#[derive(Clone)]
pub struct RelayProxy {
    garlic: Arc<dyn Dialer>,
    onion: Arc<dyn Dialer>,
    direct: Arc<dyn Dialer>,
}

impl RelayProxy {
    pub fn new(garlic: Arc<dyn Dialer>, onion: Arc<dyn Dialer>, direct: Arc<dyn Dialer>) -> Self {
        RelayProxy {
            garlic,
            onion,
            direct,
        }
    }

    /// Accept forever, relaying each connection to `remote_addr` in its own
    /// task. Returns the accept error that ends the loop.
    pub async fn serve(&self, listener: Arc<dyn Listener>, remote_addr: &str) -> Result<()> {
        let route = RelayRoute::for_addr(remote_addr)?;
        info!(listen = %listener.addr(), remote = %remote_addr, route = ?route, "Relay started");

        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(listen = %listener.addr(), error = %e, "Relay accept loop ended");
                    return Err(e);
                }
            };

            let dialer = self.dialer(route);
            let remote_addr = remote_addr.to_string();
            tokio::spawn(async move {
                if let Err(e) = relay_one(dialer, conn, &peer, &remote_addr).await {
                    warn!(peer = %peer, remote = %remote_addr, error = %e, "Relay connection failed");
                }
            });
        }
    }

    fn dialer(&self, route: RelayRoute) -> Arc<dyn Dialer> {
        match route {
            RelayRoute::Garlic => self.garlic.clone(),
            RelayRoute::Onion => self.onion.clone(),
            RelayRoute::Direct => self.direct.clone(),
        }
    }
}

async fn relay_one(
    dialer: Arc<dyn Dialer>,
    local: BoxedConn,
    peer: &str,
    remote_addr: &str,
) -> Result<()> {
    let remote = dialer
        .dial("tcp", remote_addr)
        .await
        .map_err(|e| OnrampError::Relay(format!("cannot dial {}: {}", remote_addr, e)))?;
    debug!(peer = %peer, remote = %remote_addr, "Relaying connection");

    pipe(local, remote)
        .await
        .map_err(|e| OnrampError::Relay(format!("copy failed: {}", e)))
}

/// Copy both directions until either one finishes, then shut both down
pub async fn pipe(local: BoxedConn, remote: BoxedConn) -> std::io::Result<()> {
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let result = tokio::select! {
        copied = tokio::io::copy(&mut local_read, &mut remote_write) => copied,
        copied = tokio::io::copy(&mut remote_read, &mut local_write) => copied,
    };

    local_write.shutdown().await.ok();
    remote_write.shutdown().await.ok();
    result.map(|_| ())
}
