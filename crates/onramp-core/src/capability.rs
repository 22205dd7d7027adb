//! Capability traits implemented by transport sessions
//!
//! Sessions expose what they can do through these small traits instead of
//! one large interface, so the relay only needs a `Dialer` and the registry
//! only needs a `Closer`.

use crate::conn::{dial_tcp, BoxedConn};
use crate::error::Result;
use async_trait::async_trait;

/// Opens outbound connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConn>;
}

/// Owns a persistent identity
#[async_trait]
pub trait KeyProvider: Send + Sync {
    type Keys: Send;

    /// Load the identity, generating and persisting one if none exists
    async fn keys(&self) -> Result<Self::Keys>;

    /// Remove the persisted identity. Open sessions are not affected.
    fn delete_keys(&self) -> Result<()>;
}

/// Releases held resources
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Dials plain TCP, ignoring the network argument
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, _network: &str, addr: &str) -> Result<BoxedConn> {
        dial_tcp(addr).await
    }
}
