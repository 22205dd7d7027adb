//! On-disk keystore for transport identities and TLS material
//!
//! Three roots live under a working directory, each created on first access:
//! - `i2pkeys/`   I2P destinations (`<name>.i2p.private`)
//! - `onionkeys/` Ed25519 onion service keys (`<name>.tor.private`)
//! - `tlskeys/`   certificates, keys and CRLs keyed by hostname

use crate::error::{OnrampError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Keystore root selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeystoreKind {
    I2p,
    Onion,
    Tls,
}

impl KeystoreKind {
    /// Default directory name under the working directory
    pub fn dir_name(&self) -> &'static str {
        match self {
            KeystoreKind::I2p => "i2pkeys",
            KeystoreKind::Onion => "onionkeys",
            KeystoreKind::Tls => "tlskeys",
        }
    }

    fn identity_file_name(&self, name: &str) -> String {
        match self {
            KeystoreKind::I2p => format!("{}.i2p.private", name),
            KeystoreKind::Onion => format!("{}.tor.private", name),
            KeystoreKind::Tls => format!("{}.pem", name),
        }
    }
}

/// Keystore configuration
///
/// Relative paths are resolved against the process working directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    /// Base directory for all roots (current directory if unset)
    pub working_dir: Option<PathBuf>,

    /// Override for the I2P identity root
    pub i2p_dir: Option<PathBuf>,

    /// Override for the onion identity root
    pub onion_dir: Option<PathBuf>,

    /// Override for the TLS material root
    pub tls_dir: Option<PathBuf>,
}

/// Keystore rooted at a working directory
#[derive(Debug, Clone, Default)]
pub struct Keystore {
    config: KeystoreConfig,
}

impl Keystore {
    pub fn new(config: KeystoreConfig) -> Self {
        Keystore { config }
    }

    /// Keystore with all roots under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Keystore {
            config: KeystoreConfig {
                working_dir: Some(dir.into()),
                ..Default::default()
            },
        }
    }

    pub fn config(&self) -> &KeystoreConfig {
        &self.config
    }

    fn base_dir(&self) -> Result<PathBuf> {
        let cwd = std::env::current_dir().map_err(|e| OnrampError::Path {
            path: PathBuf::from("."),
            source: e,
        })?;
        Ok(match &self.config.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => cwd,
        })
    }

    /// Absolute path of a root, without creating it
    pub fn root_path(&self, kind: KeystoreKind) -> Result<PathBuf> {
        let base = self.base_dir()?;
        let configured = match kind {
            KeystoreKind::I2p => self.config.i2p_dir.as_ref(),
            KeystoreKind::Onion => self.config.onion_dir.as_ref(),
            KeystoreKind::Tls => self.config.tls_dir.as_ref(),
        };
        Ok(match configured {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.join(kind.dir_name()),
        })
    }

    /// Resolve a root, creating it with all parents if absent
    pub fn resolve(&self, kind: KeystoreKind) -> Result<PathBuf> {
        let path = self.root_path(kind)?;
        if !path.is_dir() {
            debug!(path = %path.display(), "Keystore directory does not exist, creating");
            fs::create_dir_all(&path).map_err(|e| OnrampError::Path {
                path: path.clone(),
                source: e,
            })?;
        }
        Ok(path)
    }

    /// Recursively remove a root. A missing root is not an error.
    pub fn delete(&self, kind: KeystoreKind) -> Result<()> {
        let path = self.root_path(kind)?;
        debug!(path = %path.display(), "Deleting keystore");
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OnrampError::Path { path, source: e }),
        }
    }

    /// Path of the identity file for `name`
    pub fn identity_path(&self, kind: KeystoreKind, name: &str) -> Result<PathBuf> {
        Ok(self.resolve(kind)?.join(kind.identity_file_name(name)))
    }

    /// Read an identity file. Absent and zero-length files both yield `None`.
    pub fn read_identity(&self, kind: KeystoreKind, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.identity_path(kind, name)?;
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => {
                warn!(path = %path.display(), "Keystore entry is empty, regenerating keys");
                Ok(None)
            }
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OnrampError::Identity(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Persist an identity file, readable only by the owner
    pub fn write_identity(&self, kind: KeystoreKind, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.identity_path(kind, name)?;
        write_private(&path, bytes)?;
        debug!(path = %path.display(), "Stored identity");
        Ok(path)
    }

    /// Remove one identity file. This permanently changes the address
    /// derived from it.
    pub fn delete_identity(&self, kind: KeystoreKind, name: &str) -> Result<()> {
        let path = self.identity_path(kind, name)?;
        fs::remove_file(&path).map_err(|e| {
            OnrampError::Identity(format!("failed to delete {}: {}", path.display(), e))
        })
    }
}

/// Replace `path` with `bytes`, owner-only on Unix.
///
/// The bytes go to a temporary file next to `path` that is renamed over it,
/// so readers see either the old contents or the new ones, never a prefix.
pub fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    // Created 0600 on Unix
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
