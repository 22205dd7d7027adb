//! Onion: a ready-made Tor session manager
//!
//! An `OnionSession` owns one persistent Ed25519 identity. Listening
//! publishes it as an onion service through the control port and forwards
//! the virtual port to a loopback listener; dialing goes through Tor's
//! SOCKS port for `.onion` hosts.

use crate::config::OnionConfig;
use crate::control::TorControl;
use crate::keys::OnionKeys;
use crate::listener::OnionListener;
use crate::socks;
use async_trait::async_trait;
use onramp_core::{
    addr, dial_tcp, BoxedConn, Closer, Dialer, KeyProvider, Keystore, KeystoreKind, ListenKind,
    Listener, LocalListener, OnrampError, Phase, Result, Stage, TlsBootstrap, TlsIdentity,
    TlsListener,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunnel name used when none is given
pub const DEFAULT_ONION_NAME: &str = "onramp-onion";

#[derive(Default)]
struct State {
    closed: bool,
    listener: Option<Arc<dyn Listener>>,
    /// Service id Tor reported for our ADD_ONION
    service_id: Option<String>,
}

/// Tor onion service and SOCKS dialer with a persistent identity
pub struct OnionSession {
    name: String,
    config: OnionConfig,
    keystore: Keystore,
    controller: OnceCell<Mutex<TorControl>>,
    identity: OnceCell<OnionKeys>,
    state: Mutex<State>,
}

impl OnionSession {
    /// Create a session without touching the network
    pub fn new(name: &str, config: OnionConfig, keystore: Keystore) -> Self {
        let name = if name.is_empty() {
            DEFAULT_ONION_NAME
        } else {
            name
        };
        OnionSession {
            name: name.to_string(),
            config,
            keystore,
            controller: OnceCell::new(),
            identity: OnceCell::new(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &OnionConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub async fn phase(&self) -> Phase {
        let state = self.state.lock().await;
        if state.closed {
            Phase::Closed
        } else if state.service_id.is_some() {
            Phase::SessionActive
        } else if self.identity.initialized() {
            Phase::IdentityReady
        } else if self.controller.initialized() {
            Phase::ControlConnected
        } else {
            Phase::Uninitialized
        }
    }

    /// The persistent identity, generated locally on first use
    pub async fn keys(&self) -> Result<OnionKeys> {
        check_open(&*self.state.lock().await)?;
        self.ensure_identity().await
    }

    /// `<service id>.onion` for our identity
    pub async fn address(&self) -> Result<String> {
        Ok(self.keys().await?.onion_address())
    }

    /// Service id Tor confirmed, once the service is published
    pub async fn service_id(&self) -> Option<String> {
        self.state.lock().await.service_id.clone()
    }

    /// Publish the onion service and return its listener. Repeated calls
    /// return the same listener.
    pub async fn listen(&self, kind: Option<ListenKind>) -> Result<Arc<dyn Listener>> {
        if kind == Some(ListenKind::Datagram) {
            return Err(OnrampError::session(
                Stage::Listener,
                "onion services carry streams only",
            ));
        }

        let mut state = self.state.lock().await;
        check_open(&state)?;
        if let Some(listener) = &state.listener {
            return Ok(listener.clone());
        }

        let controller = self.ensure_controller().await?;
        let keys = self
            .ensure_identity()
            .await
            .map_err(|e| OnrampError::session(Stage::Identity, e))?;

        let local = LocalListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| OnrampError::session(Stage::Listener, e))?;
        let target = local.local_addr().to_string();

        let blob = format!("ED25519-V3:{}", keys.expanded_secret_base64());
        let service_id = controller
            .lock()
            .await
            .add_onion(&blob, self.config.virtual_port, &target)
            .await
            .map_err(|e| OnrampError::session(Stage::Session, e))?;

        if service_id != keys.service_id() {
            warn!(
                name = %self.name,
                expected = %keys.service_id(),
                reported = %service_id,
                "Tor reported a different service id than derived locally"
            );
        }

        let onion_addr = format!("{}.onion", service_id);
        info!(
            name = %self.name,
            addr = %onion_addr,
            port = self.config.virtual_port,
            target = %target,
            "Onion service published"
        );

        let listener: Arc<dyn Listener> = Arc::new(OnionListener::new(local, onion_addr));
        state.service_id = Some(service_id);
        state.listener = Some(listener.clone());
        Ok(listener)
    }

    /// `listen`, wrapped in TLS with a certificate for our own `.onion` name
    pub async fn listen_tls(&self, kind: Option<ListenKind>) -> Result<Arc<dyn Listener>> {
        let listener = self.listen(kind).await?;
        let identity = self.tls_certificate().await?;
        Ok(Arc::new(TlsListener::new(listener, &identity)?))
    }

    /// TLS material for our own `.onion` name, generated on first use
    pub async fn tls_certificate(&self) -> Result<TlsIdentity> {
        let hostname = self.address().await?;
        TlsBootstrap::new(self.keystore.clone()).certificate_for(&hostname)
    }

    /// Open a stream. `.onion` hosts (and every host when `clearnet_via_tor`
    /// is set) go through the SOCKS port; others are dialed directly.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        check_open(&*self.state.lock().await)?;

        let (host, port) = addr::split_host_port(addr)?;
        let port = port.ok_or_else(|| OnrampError::dial(addr, "missing port"))?;
        let host = host.to_ascii_lowercase();

        if !host.ends_with(addr::ONION_SUFFIX) && !self.config.clearnet_via_tor {
            debug!(name = %self.name, network = %network, addr = %addr, "Dialing directly");
            let target = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };
            return dial_tcp(&target).await;
        }

        {
            // A controller opened here must be visible to a concurrent close
            let state = self.state.lock().await;
            check_open(&state)?;
            self.ensure_controller().await?;
        }
        debug!(name = %self.name, network = %network, addr = %addr, "Dialing through Tor");
        let stream = socks::connect(
            &self.config.socks_addr,
            &host,
            port,
            self.config.control_timeout(),
        )
        .await
        .map_err(|e| OnrampError::dial(addr, e))?;
        Ok(Box::new(stream))
    }

    /// `dial` that gives up as soon as `cancel` fires
    pub async fn dial_context(
        &self,
        cancel: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<BoxedConn> {
        if cancel.is_cancelled() {
            return Err(OnrampError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OnrampError::Cancelled),
            dialed = self.dial(network, addr) => dialed,
        }
    }

    /// Withdraw the onion service, close the listener and the control
    /// connection. Idempotent; other operations fail with `Closed` afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        info!(name = %self.name, "Closing onion session");

        let mut session_errors = Vec::new();
        let mut control_error = None;

        if let Some(service_id) = state.service_id.take() {
            if let Some(controller) = self.controller.get() {
                if let Err(e) = controller.lock().await.del_onion(&service_id).await {
                    session_errors.push(e.to_string());
                }
            }
        }
        if let Some(listener) = state.listener.take() {
            if let Err(e) = listener.close().await {
                session_errors.push(e.to_string());
            }
        }
        if let Some(controller) = self.controller.get() {
            if let Err(e) = controller.lock().await.quit().await {
                control_error = Some(e.to_string());
            }
        }

        if session_errors.is_empty() && control_error.is_none() {
            return Ok(());
        }

        let err = OnrampError::Close {
            session: (!session_errors.is_empty()).then(|| session_errors.join("; ")),
            control: control_error,
        };
        warn!(name = %self.name, error = %err, "Onion session closed with errors");
        Err(err)
    }

    /// Delete the persisted identity. A live session keeps using its keys.
    pub fn delete_keys(&self) -> Result<()> {
        delete_onion_keys(&self.keystore, &self.name)
    }

    async fn ensure_controller(&self) -> Result<&Mutex<TorControl>> {
        self.controller
            .get_or_try_init(|| async {
                debug!(name = %self.name, control = %self.config.control_addr, "Connecting to Tor control port");
                TorControl::open(
                    &self.config.control_addr,
                    &self.config.auth,
                    self.config.control_timeout(),
                )
                .await
                .map(Mutex::new)
            })
            .await
            .map_err(|e| OnrampError::session(Stage::Control, e))
    }

    /// Load the identity from the keystore, or generate and store one
    async fn ensure_identity(&self) -> Result<OnionKeys> {
        self.identity
            .get_or_try_init(|| async {
                match self.keystore.read_identity(KeystoreKind::Onion, &self.name)? {
                    Some(bytes) => {
                        let keys = OnionKeys::from_bytes(&bytes)?;
                        debug!(name = %self.name, "Loaded onion keys from keystore");
                        Ok(keys)
                    }
                    None => {
                        let keys = OnionKeys::generate();
                        let path = self.keystore.write_identity(
                            KeystoreKind::Onion,
                            &self.name,
                            &keys.to_bytes(),
                        )?;
                        info!(
                            name = %self.name,
                            path = %path.display(),
                            addr = %keys.onion_address(),
                            "Generated new onion keys"
                        );
                        Ok::<_, OnrampError>(keys)
                    }
                }
            })
            .await
            .cloned()
    }
}

fn check_open(state: &State) -> Result<()> {
    if state.closed {
        Err(OnrampError::Closed)
    } else {
        Ok(())
    }
}

impl fmt::Display for OnionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity.get() {
            Some(keys) => f.write_str(&keys.onion_address()),
            None => f.write_str(&self.name),
        }
    }
}

impl fmt::Debug for OnionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionSession")
            .field("name", &self.name)
            .field("control_addr", &self.config.control_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for OnionSession {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        OnionSession::dial(self, network, addr).await
    }
}

#[async_trait]
impl KeyProvider for OnionSession {
    type Keys = OnionKeys;

    async fn keys(&self) -> Result<OnionKeys> {
        OnionSession::keys(self).await
    }

    fn delete_keys(&self) -> Result<()> {
        OnionSession::delete_keys(self)
    }
}

#[async_trait]
impl Closer for OnionSession {
    async fn close(&self) -> Result<()> {
        OnionSession::close(self).await
    }
}

/// Delete the key file for `name`. Permanent: the next session under this
/// name publishes a different onion address.
pub fn delete_onion_keys(keystore: &Keystore, name: &str) -> Result<()> {
    keystore.delete_identity(KeystoreKind::Onion, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unreachable_config() -> OnionConfig {
        OnionConfig {
            control_addr: "127.0.0.1:9".to_string(),
            socks_addr: "127.0.0.1:9".to_string(),
            control_timeout_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_name() {
        let dir = TempDir::new().unwrap();
        let session = OnionSession::new("", OnionConfig::default(), Keystore::in_dir(dir.path()));
        assert_eq!(session.name(), DEFAULT_ONION_NAME);
        assert_eq!(session.to_string(), DEFAULT_ONION_NAME);
    }

    #[tokio::test]
    async fn test_keys_need_no_tor() {
        let dir = TempDir::new().unwrap();
        let session = OnionSession::new("local", unreachable_config(), Keystore::in_dir(dir.path()));

        let keys = session.keys().await.unwrap();
        assert_eq!(session.phase().await, Phase::IdentityReady);
        assert_eq!(session.to_string(), keys.onion_address());
        assert_eq!(session.address().await.unwrap(), keys.onion_address());
    }

    #[tokio::test]
    async fn test_corrupt_key_file_is_identity_error() {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::in_dir(dir.path());
        keystore
            .write_identity(KeystoreKind::Onion, "corrupt", b"not a key")
            .unwrap();

        let session = OnionSession::new("corrupt", unreachable_config(), keystore);
        assert!(matches!(session.keys().await, Err(OnrampError::Identity(_))));
    }

    #[tokio::test]
    async fn test_unreachable_tor_fails_at_control() {
        let dir = TempDir::new().unwrap();
        let session = OnionSession::new("t", unreachable_config(), Keystore::in_dir(dir.path()));

        let err = match session.listen(None).await {
            Err(e) => e,
            Ok(_) => panic!("listen should fail without Tor"),
        };
        assert_eq!(err.stage(), Some(Stage::Control));
        assert_eq!(session.phase().await, Phase::Uninitialized);
    }

    #[tokio::test]
    async fn test_datagram_listen_rejected() {
        let dir = TempDir::new().unwrap();
        let session = OnionSession::new("t", unreachable_config(), Keystore::in_dir(dir.path()));

        let err = match session.listen(Some(ListenKind::Datagram)).await {
            Err(e) => e,
            Ok(_) => panic!("onion datagrams are unsupported"),
        };
        assert_eq!(err.stage(), Some(Stage::Listener));
    }

    #[tokio::test]
    async fn test_dial_without_port_fails() {
        let dir = TempDir::new().unwrap();
        let session = OnionSession::new("t", unreachable_config(), Keystore::in_dir(dir.path()));
        assert!(matches!(
            session.dial("tcp", "example.onion").await,
            Err(OnrampError::Dial { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let session = OnionSession::new("t", unreachable_config(), Keystore::in_dir(dir.path()));

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.phase().await, Phase::Closed);

        assert!(matches!(session.keys().await, Err(OnrampError::Closed)));
        assert!(matches!(
            session.dial("tcp", "example.com:80").await,
            Err(OnrampError::Closed)
        ));
        assert!(matches!(session.listen(None).await, Err(OnrampError::Closed)));
    }
}
