//! Onion transport configuration

use onramp_core::{OnrampError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How to authenticate to the Tor control port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TorAuth {
    /// Pick from the methods Tor advertises in PROTOCOLINFO
    #[default]
    Auto,
    /// No authentication
    Null,
    /// `HashedControlPassword`
    Password { password: String },
    /// Cookie file; Tor's advertised path when `path` is not set
    Cookie { path: Option<PathBuf> },
}

/// Configuration for Onion sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnionConfig {
    /// Tor control port
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Tor SOCKS port
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,

    #[serde(default)]
    pub auth: TorAuth,

    /// Port the onion service is published on
    #[serde(default = "default_virtual_port")]
    pub virtual_port: u16,

    /// Route non-onion destinations through Tor as well
    #[serde(default)]
    pub clearnet_via_tor: bool,

    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,
}

fn default_control_addr() -> String {
    "127.0.0.1:9051".to_string()
}

fn default_socks_addr() -> String {
    "127.0.0.1:9050".to_string()
}

fn default_virtual_port() -> u16 {
    80
}

fn default_control_timeout() -> u64 {
    30
}

impl Default for OnionConfig {
    fn default() -> Self {
        OnionConfig {
            control_addr: default_control_addr(),
            socks_addr: default_socks_addr(),
            auth: TorAuth::default(),
            virtual_port: default_virtual_port(),
            clearnet_via_tor: false,
            control_timeout_secs: default_control_timeout(),
        }
    }
}

impl OnionConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.control_addr.trim().is_empty() {
            return Err(OnrampError::Config("onion.control_addr is empty".to_string()));
        }
        if self.socks_addr.trim().is_empty() {
            return Err(OnrampError::Config("onion.socks_addr is empty".to_string()));
        }
        if self.virtual_port == 0 {
            return Err(OnrampError::Config(
                "onion.virtual_port must be non-zero".to_string(),
            ));
        }
        if self.control_timeout_secs == 0 {
            return Err(OnrampError::Config(
                "onion.control_timeout_secs must be positive".to_string(),
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
        let config = OnionConfig::default();
        assert_eq!(config.control_addr, "127.0.0.1:9051");
        assert_eq!(config.socks_addr, "127.0.0.1:9050");
        assert_eq!(config.auth, TorAuth::Auto);
        assert!(!config.clearnet_via_tor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auth_from_yaml() {
        let config: OnionConfig =
            serde_yaml::from_str("auth:\n  method: password\n  password: hunter2\n").unwrap();
        assert_eq!(
            config.auth,
            TorAuth::Password {
                password: "hunter2".to_string()
            }
        );

        let config: OnionConfig = serde_yaml::from_str("auth:\n  method: cookie\n").unwrap();
        assert_eq!(config.auth, TorAuth::Cookie { path: None });
    }

    #[test]
    fn test_zero_port_rejected() {
        let config = OnionConfig {
            virtual_port: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OnrampError::Config(_))));
    }
}
