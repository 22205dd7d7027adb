//! Self-signed TLS material bound to a transport address
//!
//! Hidden services are already end-to-end encrypted, but browsers only treat
//! `https://` origins as secure. A certificate whose CommonName is the
//! service's own `.b32.i2p` or `.onion` name lets a second TLS layer ride on
//! top of the anonymity layer.
//!
//! Files under the TLS keystore root, per hostname:
//! - `<host>.crt` certificate (PEM)
//! - `<host>.pem` private key followed by the certificate (PEM)
//! - `<host>.crl` revocation list signed by the certificate (PEM)

use crate::conn::{BoxedConn, Listener};
use crate::error::{OnrampError, Result};
use crate::keystore::{write_private, Keystore, KeystoreKind};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Certificate lifetime: five 365-day years
pub const CERT_VALIDITY_DAYS: i64 = 5 * 365;

/// Locations of one hostname's TLS files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub crl: PathBuf,
}

/// Loaded certificate chain and private key for one hostname
pub struct TlsIdentity {
    hostname: String,
    paths: TlsPaths,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn paths(&self) -> &TlsPaths {
        &self.paths
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Server configuration presenting this certificate
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| OnrampError::Tls(format!("invalid certificate/key pair: {}", e)))?;
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("hostname", &self.hostname)
            .field("paths", &self.paths)
            .field("certificates", &self.cert_chain.len())
            .finish()
    }
}

/// Generates (once) and loads TLS material from the keystore
#[derive(Debug, Clone)]
pub struct TlsBootstrap {
    keystore: Keystore,
}

impl TlsBootstrap {
    pub fn new(keystore: Keystore) -> Self {
        TlsBootstrap { keystore }
    }

    pub fn paths(&self, hostname: &str) -> Result<TlsPaths> {
        let root = self.keystore.resolve(KeystoreKind::Tls)?;
        Ok(TlsPaths {
            cert: root.join(format!("{}.crt", hostname)),
            key: root.join(format!("{}.pem", hostname)),
            crl: root.join(format!("{}.crl", hostname)),
        })
    }

    /// Certificate for `hostname`, generated on first use
    pub fn certificate_for(&self, hostname: &str) -> Result<TlsIdentity> {
        self.certificate_for_with_alt_names(hostname, &[])
    }

    /// Certificate for `hostname` that also covers `alt_names`.
    ///
    /// Alternate names only take effect when the certificate is first
    /// generated; an existing certificate is loaded unchanged.
    pub fn certificate_for_with_alt_names(
        &self,
        hostname: &str,
        alt_names: &[String],
    ) -> Result<TlsIdentity> {
        self.ensure_certificate(hostname, alt_names)?;
        self.load(hostname)
    }

    /// Generate material for `hostname` unless both certificate and key
    /// exist. Returns whether anything was generated.
    pub fn ensure_certificate(&self, hostname: &str, alt_names: &[String]) -> Result<bool> {
        if hostname.is_empty() {
            return Err(OnrampError::Tls("empty hostname".to_string()));
        }
        let paths = self.paths(hostname)?;
        let have_cert = paths.cert.is_file();
        let have_key = paths.key.is_file();
        if have_cert && have_key {
            debug!(host = %hostname, "TLS certificate and key already exist");
            return Ok(false);
        }

        debug!(
            host = %hostname,
            cert_exists = have_cert,
            key_exists = have_key,
            "Certificate or key missing, generating new ones"
        );
        generate(hostname, alt_names, &paths)?;
        Ok(true)
    }

    /// Load existing material for `hostname`
    pub fn load(&self, hostname: &str) -> Result<TlsIdentity> {
        let paths = self.paths(hostname)?;

        let cert_file = fs::File::open(&paths.cert).map_err(|e| {
            OnrampError::Tls(format!("failed to open {}: {}", paths.cert.display(), e))
        })?;
        let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OnrampError::Tls(format!("failed to parse certificate: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(OnrampError::Tls(format!(
                "no certificate in {}",
                paths.cert.display()
            )));
        }

        let key_file = fs::File::open(&paths.key).map_err(|e| {
            OnrampError::Tls(format!("failed to open {}: {}", paths.key.display(), e))
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| OnrampError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| {
                OnrampError::Tls(format!("no private key in {}", paths.key.display()))
            })?;

        debug!(host = %hostname, cert = %paths.cert.display(), "Loaded TLS certificate pair");

        Ok(TlsIdentity {
            hostname: hostname.to_string(),
            paths,
            cert_chain,
            key,
        })
    }
}

fn tls_err(e: impl std::fmt::Display) -> OnrampError {
    OnrampError::Tls(e.to_string())
}

/// Subject alternative names: the hostname first, then any extra names.
/// `CertificateParams::new` files IP literals under IP SANs and everything
/// else under DNS SANs.
fn subject_alt_names(hostname: &str, alt_names: &[String]) -> Vec<String> {
    let mut names = vec![hostname.to_string()];
    for name in alt_names {
        let name = name.trim();
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn generate(hostname: &str, alt_names: &[String], paths: &TlsPaths) -> Result<()> {
    info!(host = %hostname, "Generating TLS keys, this may take a moment");

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).map_err(tls_err)?;

    let mut params =
        CertificateParams::new(subject_alt_names(hostname, alt_names)).map_err(tls_err)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "I2P Anonymous Network");
    dn.push(DnType::OrganizationalUnitName, "I2P");
    dn.push(DnType::LocalityName, "XX");
    dn.push(DnType::CountryName, "XX");
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // Certificates carry whole seconds; truncating keeps the validity span exact
    let not_before = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .map_err(tls_err)?;
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(CERT_VALIDITY_DAYS);

    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.self_signed(&key_pair).map_err(tls_err)?;
    let cert_pem = cert.pem();

    fs::write(&paths.cert, &cert_pem).map_err(|e| {
        OnrampError::Tls(format!("failed to write {}: {}", paths.cert.display(), e))
    })?;
    debug!(path = %paths.cert.display(), "TLS certificate saved");

    let key_pem = format!("{}{}", key_pair.serialize_pem(), cert_pem);
    write_private(&paths.key, key_pem.as_bytes()).map_err(|e| {
        OnrampError::Tls(format!("failed to write {}: {}", paths.key.display(), e))
    })?;
    debug!(path = %paths.key.display(), "TLS private key saved");

    // An empty list: nothing issued under this certificate is revoked yet
    let crl = CertificateRevocationListParams {
        this_update: not_before,
        next_update: not_before + Duration::days(CERT_VALIDITY_DAYS),
        crl_number: SerialNumber::from(1u64),
        issuing_distribution_point: None,
        revoked_certs: Vec::new(),
        key_identifier_method: KeyIdMethod::Sha256,
    }
    .signed_by(&cert, &key_pair)
    .map_err(tls_err)?;
    let crl_pem = crl.pem().map_err(tls_err)?;
    write_private(&paths.crl, crl_pem.as_bytes()).map_err(|e| {
        OnrampError::Tls(format!("failed to write {}: {}", paths.crl.display(), e))
    })?;
    debug!(path = %paths.crl.display(), "TLS CRL saved");

    Ok(())
}

/// Default bound on one client's TLS handshake
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Handshaken connections waiting for `accept`
const READY_QUEUE: usize = 64;

type Handshaken = Result<(BoxedConn, String)>;

/// Listener that performs a TLS handshake on every accepted connection.
///
/// Handshakes run in their own tasks, so a client that connects and never
/// speaks only holds up itself. Must be created inside a Tokio runtime.
pub struct TlsListener {
    inner: Arc<dyn Listener>,
    hostname: String,
    ready: Mutex<mpsc::Receiver<Handshaken>>,
    closed: CancellationToken,
    driver: JoinHandle<()>,
}

impl TlsListener {
    pub fn new(inner: Arc<dyn Listener>, identity: &TlsIdentity) -> Result<Self> {
        Self::with_handshake_timeout(inner, identity, HANDSHAKE_TIMEOUT)
    }

    pub fn with_handshake_timeout(
        inner: Arc<dyn Listener>,
        identity: &TlsIdentity,
        handshake_timeout: std::time::Duration,
    ) -> Result<Self> {
        let acceptor = TlsAcceptor::from(identity.server_config()?);
        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE);
        let closed = CancellationToken::new();
        let driver = tokio::spawn(drive_handshakes(
            inner.clone(),
            acceptor,
            handshake_timeout,
            ready_tx,
            closed.clone(),
        ));

        Ok(TlsListener {
            inner,
            hostname: identity.hostname().to_string(),
            ready: Mutex::new(ready_rx),
            closed,
            driver,
        })
    }

    /// Hostname the certificate was issued for
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

async fn drive_handshakes(
    inner: Arc<dyn Listener>,
    acceptor: TlsAcceptor,
    handshake_timeout: std::time::Duration,
    ready: mpsc::Sender<Handshaken>,
    closed: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = closed.cancelled() => break,
            accepted = inner.accept() => accepted,
        };

        let (conn, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = ready.send(Err(e)).await;
                break;
            }
        };

        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(handshake_timeout, acceptor.accept(conn)).await {
                Ok(Ok(stream)) => {
                    let _ = ready.send(Ok((Box::new(stream) as BoxedConn, peer))).await;
                }
                // One client failing its handshake must not stop the listener
                Ok(Err(e)) => warn!(peer = %peer, error = %e, "TLS handshake failed"),
                Err(_) => warn!(peer = %peer, "TLS handshake timed out"),
            }
        });
    }
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&self) -> Result<(BoxedConn, String)> {
        let mut ready = self.ready.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(OnrampError::Closed),
            next = ready.recv() => next.unwrap_or(Err(OnrampError::Closed)),
        }
    }

    fn addr(&self) -> String {
        self.inner.addr()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.driver.abort();
        self.inner.close().await
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
