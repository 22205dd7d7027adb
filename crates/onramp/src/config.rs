//! Onramp configuration
//!
//! One YAML file with a section per concern. Every field has a default, so
//! an empty file (or none at all) is a valid configuration.

use onramp_core::{KeystoreConfig, OnrampError, Result};
use onramp_garlic::GarlicConfig;
use onramp_onion::OnionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnrampConfig {
    #[serde(default)]
    pub keystore: KeystoreConfig,

    #[serde(default)]
    pub garlic: GarlicConfig,

    #[serde(default)]
    pub onion: OnionConfig,
}

impl OnrampConfig {
    /// Load from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| OnrampError::Path {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: OnrampConfig = serde_yaml::from_str(&contents).map_err(|e| {
            OnrampError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded onramp configuration");
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Write as YAML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OnrampError::Path {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| OnrampError::Config(format!("failed to serialize config: {}", e)))?;
        fs::write(path, yaml).map_err(|e| OnrampError::Path {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.garlic.validate()?;
        self.onion.validate()
    }

    /// `<config dir>/onramp/config.yaml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("onramp")
            .join("config.yaml")
    }
}
