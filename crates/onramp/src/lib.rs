//! Onramp
//!
//! Dial and listen over I2P ("garlic") and Tor ("onion") with persistent
//! identities. Destinations ending in `.i2p` go over I2P, everything else
//! over the onion transport.
//!
//! Applications can construct `GarlicSession`/`OnionSession` themselves, or
//! use an `Onramp` access point (or the process-wide one behind the free
//! functions in this crate), which keeps named sessions in registries so
//! they can be reused and closed together.

pub mod config;
pub mod registry;
pub mod relay;
pub mod router;

pub use config::OnrampConfig;
pub use onramp_core::{
    BoxedConn, Closer, Connection, Dialer, DirectDialer, KeyProvider, Keystore, KeystoreConfig,
    KeystoreKind, ListenKind, Listener, OnrampError, Result, Stage, TlsBootstrap, TlsIdentity,
    TlsListener,
};
pub use onramp_garlic::{GarlicConfig, GarlicSession, I2pKeys, DEFAULT_GARLIC_NAME};
pub use onramp_onion::{OnionConfig, OnionKeys, OnionSession, DEFAULT_ONION_NAME};
pub use registry::SessionRegistry;
pub use relay::{RelayProxy, RelayRoute};
pub use router::{route_dial, route_listen, Transport};

use once_cell::sync::Lazy;
use onramp_core::addr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Process-wide access point, configured from the default config path
static GLOBAL: Lazy<Onramp> = Lazy::new(|| {
    let path = OnrampConfig::default_config_path();
    let config = OnrampConfig::load_or_default(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Ignoring unusable configuration file");
        OnrampConfig::default()
    });
    Onramp::new(config)
});

/// Registry-backed entry point for dialing, listening and relaying
pub struct Onramp {
    config: OnrampConfig,
    keystore: Keystore,
    garlics: SessionRegistry<GarlicSession>,
    onions: SessionRegistry<OnionSession>,
}

impl Onramp {
    pub fn new(config: OnrampConfig) -> Self {
        let keystore = Keystore::new(config.keystore.clone());
        Onramp {
            config,
            keystore,
            garlics: SessionRegistry::new(),
            onions: SessionRegistry::new(),
        }
    }

    /// The access point used by this crate's free functions
    pub fn global() -> &'static Onramp {
        &GLOBAL
    }

    pub fn config(&self) -> &OnrampConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub fn garlics(&self) -> &SessionRegistry<GarlicSession> {
        &self.garlics
    }

    pub fn onions(&self) -> &SessionRegistry<OnionSession> {
        &self.onions
    }

    /// Registered garlic session `name`, created on first use
    pub async fn garlic(&self, name: &str) -> Arc<GarlicSession> {
        self.garlics
            .get_or_create(name, || {
                GarlicSession::new(name, self.config.garlic.clone(), self.keystore.clone())
            })
            .await
    }

    /// Registered onion session `name`, created on first use
    pub async fn onion(&self, name: &str) -> Arc<OnionSession> {
        self.onions
            .get_or_create(name, || {
                OnionSession::new(name, self.config.onion.clone(), self.keystore.clone())
            })
            .await
    }

    /// Dial `addr` over the transport its hostname selects
    pub async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        match route_dial(addr)? {
            Transport::Garlic => self.dial_garlic(network, addr).await,
            Transport::Onion => self.dial_onion(network, addr).await,
        }
    }

    /// Listen on the transport `network` names (`i2p`, `garlic`, `tor`,
    /// `onion`), or the one `keys` routes to. `keys` names the session.
    pub async fn listen(&self, network: &str, keys: &str) -> Result<Arc<dyn Listener>> {
        let transport = route_listen(network, keys);
        debug!(network = %network, keys = %keys, transport = %transport, "Routed listener");
        match transport {
            Transport::Garlic => self.listen_garlic(network, keys).await,
            Transport::Onion => self.listen_onion(network, keys).await,
        }
    }

    /// Dial through the garlic session owned by the destination's hostname
    pub async fn dial_garlic(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        let name = addr::hostname(addr)?;
        self.garlic(&name).await.dial(network, addr).await
    }

    /// Listener of garlic session `keys`. Datagram networks (`udp`, `dg`, ...)
    /// get a datagram listener.
    pub async fn listen_garlic(&self, network: &str, keys: &str) -> Result<Arc<dyn Listener>> {
        self.garlic(keys)
            .await
            .listen(ListenKind::from_network(network))
            .await
    }

    /// Dial through the onion session owned by the destination's hostname
    pub async fn dial_onion(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        let name = addr::hostname(addr)?;
        self.onion(&name).await.dial(network, addr).await
    }

    pub async fn listen_onion(&self, network: &str, keys: &str) -> Result<Arc<dyn Listener>> {
        self.onion(keys)
            .await
            .listen(ListenKind::from_network(network))
            .await
    }

    /// Relay every connection accepted on `listener` to `remote_addr`, using
    /// the default garlic and onion sessions for hidden destinations
    pub async fn proxy(&self, listener: Arc<dyn Listener>, remote_addr: &str) -> Result<()> {
        let garlic: Arc<dyn Dialer> = self.garlic(DEFAULT_GARLIC_NAME).await;
        let onion: Arc<dyn Dialer> = self.onion(DEFAULT_ONION_NAME).await;
        RelayProxy::new(garlic, onion, Arc::new(DirectDialer))
            .serve(listener, remote_addr)
            .await
    }

    /// Close registered garlic session `name`; the entry stays registered
    pub async fn close_garlic(&self, name: &str) -> Result<()> {
        self.garlics.close_one(name).await
    }

    pub async fn close_all_garlic(&self) {
        self.garlics.close_all().await
    }

    /// Close registered onion session `name`; the entry stays registered
    pub async fn close_onion(&self, name: &str) -> Result<()> {
        self.onions.close_one(name).await
    }

    pub async fn close_all_onion(&self) {
        self.onions.close_all().await
    }

    pub async fn close_all(&self) {
        self.close_all_garlic().await;
        self.close_all_onion().await;
    }
}

/// `Onramp::dial` on the global access point
pub async fn dial(network: &str, addr: &str) -> Result<BoxedConn> {
    Onramp::global().dial(network, addr).await
}

/// `Onramp::listen` on the global access point
pub async fn listen(network: &str, keys: &str) -> Result<Arc<dyn Listener>> {
    Onramp::global().listen(network, keys).await
}

pub async fn dial_garlic(network: &str, addr: &str) -> Result<BoxedConn> {
    Onramp::global().dial_garlic(network, addr).await
}

pub async fn listen_garlic(network: &str, keys: &str) -> Result<Arc<dyn Listener>> {
    Onramp::global().listen_garlic(network, keys).await
}

pub async fn dial_onion(network: &str, addr: &str) -> Result<BoxedConn> {
    Onramp::global().dial_onion(network, addr).await
}

pub async fn listen_onion(network: &str, keys: &str) -> Result<Arc<dyn Listener>> {
    Onramp::global().listen_onion(network, keys).await
}

/// `Onramp::proxy` on the global access point
pub async fn proxy(listener: Arc<dyn Listener>, remote_addr: &str) -> Result<()> {
    Onramp::global().proxy(listener, remote_addr).await
}

pub async fn close_garlic(name: &str) -> Result<()> {
    Onramp::global().close_garlic(name).await
}

pub async fn close_all_garlic() {
    Onramp::global().close_all_garlic().await
}

pub async fn close_onion(name: &str) -> Result<()> {
    Onramp::global().close_onion(name).await
}

pub async fn close_all_onion() {
    Onramp::global().close_all_onion().await
}

/// Close every session the global access point created
pub async fn close_all() {
    Onramp::global().close_all().await
}
