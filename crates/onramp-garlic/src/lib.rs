//! Onramp Garlic
//!
//! I2P transport over the SAM v3 bridge: persistent destinations, lazily
//! established stream and datagram sessions, and listeners that plug into
//! the shared `Listener` abstraction.

pub mod config;
pub mod datagram;
pub mod keys;
pub mod listener;
pub mod sam;
pub mod session;

pub use config::{GarlicConfig, TunnelPreset};
pub use datagram::{DatagramConn, DatagramListener, GarlicDatagram};
pub use keys::{AddrMode, I2pKeys};
pub use listener::StreamListener;
pub use sam::{SamConnection, SamError, SessionStyle};
pub use session::{delete_garlic_keys, GarlicSession, DEFAULT_GARLIC_NAME};
