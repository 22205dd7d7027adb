//! Garlic: a ready-made I2P session manager
//!
//! A `GarlicSession` owns one persistent destination and lazily walks
//! control connection -> identity -> SAM session -> listener the first time
//! any operation needs it. Completed steps are kept, so a failure part way
//! through is retried from the failed step on the next call.

use crate::config::GarlicConfig;
use crate::datagram::{DatagramListener, GarlicDatagram};
use crate::keys::{AddrMode, I2pKeys};
use crate::listener::StreamListener;
use crate::sam::{SamConnection, SessionStyle};
use async_trait::async_trait;
use onramp_core::{
    addr, BoxedConn, Closer, Dialer, KeyProvider, Keystore, KeystoreKind, ListenKind, Listener,
    NullConn, OnrampError, Phase, Result, Stage, TlsBootstrap, TlsIdentity, TlsListener,
};
use std::fmt;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunnel name used when none is given
pub const DEFAULT_GARLIC_NAME: &str = "onramp-garlic";

#[derive(Default)]
struct State {
    closed: bool,
    /// HELLO-negotiated connection used for key generation
    control: Option<SamConnection>,
    /// Connection that created, and keeps alive, the STREAM session
    stream: Option<SamConnection>,
    listener: Option<Arc<dyn Listener>>,
    datagram: Option<Arc<GarlicDatagram>>,
    datagram_listener: Option<Arc<dyn Listener>>,
}

/// I2P streaming and datagram session with a persistent destination
pub struct GarlicSession {
    name: String,
    config: GarlicConfig,
    keystore: Keystore,
    identity: OnceCell<I2pKeys>,
    state: Mutex<State>,
}

impl GarlicSession {
    /// Create a session without touching the network
    pub fn new(name: &str, config: GarlicConfig, keystore: Keystore) -> Self {
        let name = if name.is_empty() {
            DEFAULT_GARLIC_NAME
        } else {
            name
        };
        GarlicSession {
            name: name.to_string(),
            config,
            keystore,
            identity: OnceCell::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Create a session and immediately establish its stream session
    pub async fn connect(name: &str, config: GarlicConfig, keystore: Keystore) -> Result<Self> {
        let session = Self::new(name, config, keystore);
        {
            let mut state = session.state.lock().await;
            session.ensure_stream_session(&mut state).await?;
        }
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &GarlicConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Current establishment phase
    pub async fn phase(&self) -> Phase {
        let state = self.state.lock().await;
        if state.closed {
            Phase::Closed
        } else if state.stream.is_some() || state.datagram.is_some() {
            Phase::SessionActive
        } else if self.identity.initialized() {
            Phase::IdentityReady
        } else if state.control.is_some() {
            Phase::ControlConnected
        } else {
            Phase::Uninitialized
        }
    }

    /// The persistent destination, generated through the SAM bridge on first use
    pub async fn keys(&self) -> Result<I2pKeys> {
        let mut state = self.state.lock().await;
        check_open(&state)?;
        self.ensure_identity(&mut state).await.map_err(|e| match e {
            OnrampError::Session { reason, .. } => {
                OnrampError::Identity(format!("SAM bridge unavailable: {}", reason))
            }
            other => other,
        })
    }

    /// Listener for this session's destination. Streams unless `kind` says
    /// otherwise; repeated calls return the same listener.
    pub async fn listen(&self, kind: Option<ListenKind>) -> Result<Arc<dyn Listener>> {
        match kind.unwrap_or_default() {
            ListenKind::Stream => self.listen_stream().await,
            ListenKind::Datagram => self.listen_datagram().await,
        }
    }

    async fn listen_stream(&self) -> Result<Arc<dyn Listener>> {
        let mut state = self.state.lock().await;
        let keys = self.ensure_stream_session(&mut state).await?;

        if let Some(listener) = &state.listener {
            return Ok(listener.clone());
        }

        let local = keys
            .base32()
            .map_err(|e| OnrampError::session(Stage::Listener, e))?;
        let listener: Arc<dyn Listener> = Arc::new(StreamListener::new(
            self.config.sam_addr.clone(),
            self.name.clone(),
            self.config.control_timeout(),
            local.clone(),
        ));
        info!(name = %self.name, addr = %local, "I2P stream listener ready");

        state.listener = Some(listener.clone());
        Ok(listener)
    }

    async fn listen_datagram(&self) -> Result<Arc<dyn Listener>> {
        let mut state = self.state.lock().await;
        let endpoint = self.ensure_datagram_session(&mut state).await?;

        if let Some(listener) = &state.datagram_listener {
            return Ok(listener.clone());
        }

        let listener: Arc<dyn Listener> = Arc::new(DatagramListener::new(endpoint));
        state.datagram_listener = Some(listener.clone());
        Ok(listener)
    }

    /// Raw datagram endpoint for this session's destination
    pub async fn listen_packet(&self) -> Result<Arc<GarlicDatagram>> {
        let mut state = self.state.lock().await;
        self.ensure_datagram_session(&mut state).await
    }

    /// `listen`, wrapped in TLS with a certificate for our own `.b32.i2p` name
    pub async fn listen_tls(&self, kind: Option<ListenKind>) -> Result<Arc<dyn Listener>> {
        let listener = self.listen(kind).await?;
        let identity = self.tls_certificate().await?;
        Ok(Arc::new(TlsListener::new(listener, &identity)?))
    }

    /// TLS material for our own `.b32.i2p` name, generated on first use
    pub async fn tls_certificate(&self) -> Result<TlsIdentity> {
        let keys = self.keys().await?;
        let hostname = keys.base32()?;
        TlsBootstrap::new(self.keystore.clone()).certificate_for(&hostname)
    }

    /// Open a stream to an I2P destination.
    ///
    /// Addresses outside I2P get a `NullConn` instead of an error, so this
    /// can serve as the dial function of a generic client.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        if !addr.contains(addr::I2P_SUFFIX) {
            check_open(&*self.state.lock().await)?;
            debug!(name = %self.name, addr = %addr, "Not an I2P address, returning null connection");
            return Ok(Box::new(NullConn::new()));
        }

        {
            let mut state = self.state.lock().await;
            self.ensure_stream_session(&mut state).await?;
        }

        let host = addr::hostname(addr)?;
        debug!(name = %self.name, network = %network, addr = %addr, "Dialing I2P destination");

        let mut conn = SamConnection::connect(&self.config.sam_addr, self.config.control_timeout())
            .await
            .map_err(|e| OnrampError::dial(addr, e))?;
        let destination = conn
            .naming_lookup(&host)
            .await
            .map_err(|e| OnrampError::dial(addr, e))?;
        let stream = conn
            .stream_connect(&self.name, &destination)
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

    /// Close listeners, sessions and the control connection.
    ///
    /// Waits for any in-flight establishment. Closing twice is fine; every
    /// other operation fails with `Closed` afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        info!(name = %self.name, "Closing garlic session");

        let mut session_errors = Vec::new();

        for listener in [state.listener.take(), state.datagram_listener.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = listener.close().await {
                session_errors.push(e.to_string());
            }
        }
        if let Some(datagram) = state.datagram.take() {
            if let Err(e) = datagram.close().await {
                session_errors.push(e.to_string());
            }
        }
        if let Some(stream) = state.stream.take() {
            if let Err(e) = stream.close().await {
                session_errors.push(e.to_string());
            }
        }

        let control_error = match state.control.take() {
            Some(control) => control.close().await.err().map(|e| e.to_string()),
            None => None,
        };

        if session_errors.is_empty() && control_error.is_none() {
            return Ok(());
        }

        let err = OnrampError::Close {
            session: (!session_errors.is_empty()).then(|| session_errors.join("; ")),
            control: control_error,
        };
        warn!(name = %self.name, error = %err, "Garlic session closed with errors");
        Err(err)
    }

    /// Delete the persisted destination. A live session keeps using its keys.
    pub fn delete_keys(&self) -> Result<()> {
        delete_garlic_keys(&self.keystore, &self.name)
    }

    /// Our destination rendered in `mode`, honoring torrent mode
    pub async fn address(&self, mode: AddrMode) -> Result<String> {
        let keys = self.keys().await?;
        self.render(&keys, mode)
    }

    /// `"tcp"` once a stream listener exists, `"udp"` otherwise
    pub async fn network(&self) -> &'static str {
        if self.state.lock().await.listener.is_some() {
            "tcp"
        } else {
            "udp"
        }
    }

    fn render(&self, keys: &I2pKeys, mode: AddrMode) -> Result<String> {
        let addr = keys.address(mode)?;
        if self.config.torrent_mode {
            Ok(format!("{}.i2p", addr))
        } else {
            Ok(addr)
        }
    }

    async fn ensure_control<'a>(&self, state: &'a mut State) -> Result<&'a mut SamConnection> {
        let conn = match state.control.take() {
            Some(conn) => conn,
            None => {
                debug!(name = %self.name, sam = %self.config.sam_addr, "Connecting to SAM bridge");
                SamConnection::connect(&self.config.sam_addr, self.config.control_timeout())
                    .await
                    .map_err(|e| OnrampError::session(Stage::Control, e))?
            }
        };
        Ok(state.control.insert(conn))
    }

    /// Load the destination from the keystore, or generate and store one
    async fn ensure_identity(&self, state: &mut State) -> Result<I2pKeys> {
        if let Some(keys) = self.identity.get() {
            return Ok(keys.clone());
        }

        let keys = match self.keystore.read_identity(KeystoreKind::I2p, &self.name)? {
            Some(bytes) => {
                let keys = I2pKeys::from_file_bytes(&bytes)?;
                debug!(name = %self.name, "Loaded I2P keys from keystore");
                keys
            }
            None => {
                let control = self.ensure_control(state).await?;
                let keys = control
                    .generate_destination(self.config.signature_type)
                    .await
                    .map_err(|e| OnrampError::Identity(format!("keygen error: {}", e)))?;
                let path =
                    self.keystore
                        .write_identity(KeystoreKind::I2p, &self.name, &keys.to_file_bytes())?;
                info!(name = %self.name, path = %path.display(), "Generated new I2P keys");
                keys
            }
        };

        // Lock held by the caller, so nobody else can have set it
        let _ = self.identity.set(keys.clone());
        Ok(keys)
    }

    async fn establish_identity(&self, state: &mut State) -> Result<I2pKeys> {
        check_open(state)?;
        self.ensure_control(state).await?;
        self.ensure_identity(state)
            .await
            .map_err(|e| at_stage(Stage::Identity, e))
    }

    async fn ensure_stream_session(&self, state: &mut State) -> Result<I2pKeys> {
        let keys = self.establish_identity(state).await?;
        if state.stream.is_some() {
            return Ok(keys);
        }

        let mut conn = SamConnection::connect(&self.config.sam_addr, self.config.control_timeout())
            .await
            .map_err(|e| OnrampError::session(Stage::Session, e))?;
        conn.create_session(
            &self.name,
            SessionStyle::Stream,
            &keys.private,
            &self.config.tunnel_options(),
        )
        .await
        .map_err(|e| OnrampError::session(Stage::Session, e))?;

        info!(
            name = %self.name,
            addr = %keys.base32().unwrap_or_default(),
            "Created I2P stream session"
        );
        state.stream = Some(conn);
        Ok(keys)
    }

    async fn ensure_datagram_session(&self, state: &mut State) -> Result<Arc<GarlicDatagram>> {
        let keys = self.establish_identity(state).await?;
        if let Some(datagram) = &state.datagram {
            return Ok(datagram.clone());
        }

        let socket = UdpSocket::bind((self.config.datagram_host.as_str(), 0))
            .await
            .map_err(|e| OnrampError::session(Stage::Session, e))?;
        let port = socket
            .local_addr()
            .map_err(|e| OnrampError::session(Stage::Session, e))?
            .port();
        let sam_udp = self
            .config
            .sam_udp_addr()
            .map_err(|e| OnrampError::session(Stage::Session, e))?;

        // Session IDs are unique per bridge; the stream session holds the bare name
        let session_id = format!("{}-dg", self.name);
        let mut params = self.config.tunnel_options();
        params.push(format!("PORT={}", port));
        params.push(format!("HOST={}", self.config.datagram_host));

        let mut conn = SamConnection::connect(&self.config.sam_addr, self.config.control_timeout())
            .await
            .map_err(|e| OnrampError::session(Stage::Session, e))?;
        conn.create_session(&session_id, SessionStyle::Datagram, &keys.private, &params)
            .await
            .map_err(|e| OnrampError::session(Stage::Session, e))?;

        let local = keys
            .base32()
            .map_err(|e| OnrampError::session(Stage::Listener, e))?;
        info!(name = %self.name, addr = %local, port, "Created I2P datagram session");

        let datagram = Arc::new(GarlicDatagram::new(
            socket,
            session_id,
            self.config.sam_addr.clone(),
            sam_udp,
            self.config.control_timeout(),
            local,
            Some(conn),
        ));
        state.datagram = Some(datagram.clone());
        Ok(datagram)
    }
}

fn check_open(state: &State) -> Result<()> {
    if state.closed {
        Err(OnrampError::Closed)
    } else {
        Ok(())
    }
}

/// Attribute a failure to `stage` unless it already names one
fn at_stage(stage: Stage, err: OnrampError) -> OnrampError {
    match err {
        OnrampError::Session { .. } | OnrampError::Closed => err,
        other => OnrampError::session(stage, other),
    }
}

impl fmt::Display for GarlicSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity.get() {
            Some(keys) => match self.render(keys, self.config.addr_mode) {
                Ok(addr) => f.write_str(&addr),
                Err(_) => f.write_str(&self.name),
            },
            None => f.write_str(&self.name),
        }
    }
}

impl fmt::Debug for GarlicSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarlicSession")
            .field("name", &self.name)
            .field("sam_addr", &self.config.sam_addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for GarlicSession {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConn> {
        GarlicSession::dial(self, network, addr).await
    }
}

#[async_trait]
impl KeyProvider for GarlicSession {
    type Keys = I2pKeys;

    async fn keys(&self) -> Result<I2pKeys> {
        GarlicSession::keys(self).await
    }

    fn delete_keys(&self) -> Result<()> {
        GarlicSession::delete_keys(self)
    }
}

#[async_trait]
impl Closer for GarlicSession {
    async fn close(&self) -> Result<()> {
        GarlicSession::close(self).await
    }
}

/// Delete the key file for `name`. Permanent: the next session under this
/// name gets a new destination.
pub fn delete_garlic_keys(keystore: &Keystore, name: &str) -> Result<()> {
    keystore.delete_identity(KeystoreKind::I2p, name)
}
