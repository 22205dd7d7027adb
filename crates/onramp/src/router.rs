//! Destination to transport routing

use onramp_core::{addr, Result};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// I2P
    Garlic,
    /// Tor
    Onion,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Garlic => write!(f, "garlic"),
            Transport::Onion => write!(f, "onion"),
        }
    }
}

/// Transport for an outbound destination: `.i2p` hosts go to Garlic,
/// everything else to Onion.
pub fn route_dial(addr: &str) -> Result<Transport> {
    let host = addr::hostname(addr)?;
    let transport = if host.ends_with(addr::I2P_SUFFIX) {
        Transport::Garlic
    } else {
        Transport::Onion
    };
    debug!(addr = %addr, host = %host, transport = %transport, "Routed destination");
    Ok(transport)
}

/// Transport for a listener. An explicit `i2p`/`garlic` or `tor`/`onion`
/// network wins; otherwise `keys` is routed like a destination, with names
/// that are not `.i2p` hosts going to Onion.
pub fn route_listen(network: &str, keys: &str) -> Transport {
    match network.to_ascii_lowercase().as_str() {
        "i2p" | "garlic" => Transport::Garlic,
        "tor" | "onion" => Transport::Onion,
        _ if addr::is_i2p(keys) => Transport::Garlic,
        _ => Transport::Onion,
    }
}
