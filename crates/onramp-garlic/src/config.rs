//! Garlic transport configuration

use crate::keys::AddrMode;
use onramp_core::{addr, OnrampError, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Named SAM tunnel option sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelPreset {
    #[default]
    Default,
    /// Short tunnels, many of them
    Wide,
    Huge,
    Large,
    Medium,
    Small,
}

impl TunnelPreset {
    /// (length, length variance, backup quantity, quantity), same in both directions
    fn shape(&self) -> (u8, u8, u8, u8) {
        match self {
            TunnelPreset::Default => (3, 0, 1, 1),
            TunnelPreset::Wide => (1, 1, 2, 3),
            TunnelPreset::Huge => (3, 1, 3, 6),
            TunnelPreset::Large => (3, 1, 1, 4),
            TunnelPreset::Medium => (3, 1, 0, 2),
            TunnelPreset::Small => (3, 1, 0, 1),
        }
    }

    /// `inbound.*` / `outbound.*` option strings for `SESSION CREATE`
    pub fn options(&self) -> Vec<String> {
        let (length, variance, backup, quantity) = self.shape();
        ["inbound", "outbound"]
            .iter()
            .flat_map(|dir| {
                [
                    format!("{}.length={}", dir, length),
                    format!("{}.lengthVariance={}", dir, variance),
                    format!("{}.backupQuantity={}", dir, backup),
                    format!("{}.quantity={}", dir, quantity),
                ]
            })
            .collect()
    }
}

/// Configuration for Garlic sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarlicConfig {
    /// SAM bridge TCP address
    #[serde(default = "default_sam_addr")]
    pub sam_addr: String,

    /// SAM bridge UDP port for outbound datagrams
    #[serde(default = "default_sam_udp_port")]
    pub sam_udp_port: u16,

    /// Local host the bridge forwards inbound datagrams to
    #[serde(default = "default_datagram_host")]
    pub datagram_host: String,

    #[serde(default)]
    pub preset: TunnelPreset,

    /// Explicit tunnel options; replaces the preset when set
    #[serde(default)]
    pub options: Option<Vec<String>>,

    #[serde(default)]
    pub addr_mode: AddrMode,

    /// Append `.i2p` to rendered addresses
    #[serde(default)]
    pub torrent_mode: bool,

    /// Signature type for new destinations (7 = Ed25519)
    #[serde(default = "default_signature_type")]
    pub signature_type: u8,

    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,
}

fn default_sam_addr() -> String {
    "127.0.0.1:7656".to_string()
}

fn default_sam_udp_port() -> u16 {
    7655
}

fn default_datagram_host() -> String {
    "127.0.0.1".to_string()
}

fn default_signature_type() -> u8 {
    7
}

fn default_control_timeout() -> u64 {
    30
}

impl Default for GarlicConfig {
    fn default() -> Self {
        GarlicConfig {
            sam_addr: default_sam_addr(),
            sam_udp_port: default_sam_udp_port(),
            datagram_host: default_datagram_host(),
            preset: TunnelPreset::default(),
            options: None,
            addr_mode: AddrMode::default(),
            torrent_mode: false,
            signature_type: default_signature_type(),
            control_timeout_secs: default_control_timeout(),
        }
    }
}

impl GarlicConfig {
    /// Config pointing at a specific SAM bridge, defaults otherwise
    pub fn with_sam_addr(sam_addr: impl Into<String>) -> Self {
        GarlicConfig {
            sam_addr: sam_addr.into(),
            ..Default::default()
        }
    }

    /// Options passed to `SESSION CREATE`
    pub fn tunnel_options(&self) -> Vec<String> {
        match &self.options {
            Some(options) => options.clone(),
            None => self.preset.options(),
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    /// Bridge UDP endpoint: the SAM host with the datagram port
    pub fn sam_udp_addr(&self) -> Result<SocketAddr> {
        let (host, _) = addr::split_host_port(&self.sam_addr)?;
        (host.as_str(), self.sam_udp_port)
            .to_socket_addrs()
            .map_err(|e| OnrampError::Config(format!("SAM address {}: {}", self.sam_addr, e)))?
            .next()
            .ok_or_else(|| OnrampError::Config(format!("SAM address {} did not resolve", host)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sam_addr.trim().is_empty() {
            return Err(OnrampError::Config("garlic.sam_addr is empty".to_string()));
        }
        if self.control_timeout_secs == 0 {
            return Err(OnrampError::Config(
                "garlic.control_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GarlicConfig::default();
        assert_eq!(config.sam_addr, "127.0.0.1:7656");
        assert_eq!(config.sam_udp_port, 7655);
        assert_eq!(config.signature_type, 7);
        assert_eq!(config.control_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_preset_options() {
        let options = TunnelPreset::Default.options();
        assert_eq!(options.len(), 8);
        assert!(options.contains(&"inbound.length=3".to_string()));
        assert!(options.contains(&"outbound.quantity=1".to_string()));
    }

    #[test]
    fn test_explicit_options_replace_preset() {
        let config = GarlicConfig {
            preset: TunnelPreset::Huge,
            options: Some(vec!["inbound.length=1".to_string()]),
            ..Default::default()
        };
        assert_eq!(config.tunnel_options(), vec!["inbound.length=1".to_string()]);
    }

    #[test]
    fn test_sam_udp_addr_uses_sam_host() {
        let config = GarlicConfig::with_sam_addr("127.0.0.1:17656");
        assert_eq!(
            config.sam_udp_addr().unwrap(),
            "127.0.0.1:7655".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: GarlicConfig =
            serde_yaml::from_str("preset: wide\naddr_mode: base32_truncated\n").unwrap();
        assert_eq!(config.preset, TunnelPreset::Wide);
        assert_eq!(config.addr_mode, AddrMode::Base32Truncated);
        assert_eq!(config.sam_addr, "127.0.0.1:7656");
    }
}
