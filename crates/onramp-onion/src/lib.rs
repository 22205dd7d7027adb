//! Onramp Onion
//!
//! Tor transport: persistent v3 onion identities published through the
//! control port, and outbound streams through the SOCKS port.

pub mod config;
pub mod control;
pub mod keys;
pub mod listener;
pub mod session;
pub mod socks;

pub use config::{OnionConfig, TorAuth};
pub use control::{ProtocolInfo, TorControl, TorControlError};
pub use keys::OnionKeys;
pub use listener::OnionListener;
pub use session::{delete_onion_keys, OnionSession, DEFAULT_ONION_NAME};
pub use socks::SocksError;
