//! Onramp Core
//!
//! Shared building blocks for the anonymity-network transports:
//! - Error taxonomy
//! - Keystore for persistent identities
//! - Connection and listener abstractions
//! - Capability traits implemented by transport sessions
//! - Self-signed TLS bootstrap

pub mod addr;
pub mod capability;
pub mod conn;
pub mod error;
pub mod keystore;
pub mod lifecycle;
pub mod null_conn;
pub mod tls;

pub use capability::{Closer, Dialer, DirectDialer, KeyProvider};
pub use conn::{dial_tcp, BoxedConn, Connection, Listener, LocalListener};
pub use error::{OnrampError, Result, Stage};
pub use keystore::{Keystore, KeystoreConfig, KeystoreKind};
pub use lifecycle::{ListenKind, Phase};
pub use null_conn::NullConn;
pub use tls::{TlsBootstrap, TlsIdentity, TlsListener, TlsPaths};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
