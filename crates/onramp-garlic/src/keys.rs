//! I2P destination keys and address rendering

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use onramp_core::{OnrampError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const I2P_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("invalid I2P base64 alphabet"),
    };

/// Base64 with I2P's `-` and `~` in place of `+` and `/`
pub const I2P_BASE64: GeneralPurpose = GeneralPurpose::new(
    &I2P_ALPHABET,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Suffix of base32 destination hostnames
pub const B32_SUFFIX: &str = ".b32.i2p";

/// How a destination is rendered as a string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrMode {
    /// `<52 chars>.b32.i2p`
    #[default]
    Base32,
    /// Base32 hash without the `.b32.i2p` suffix
    Base32Truncated,
    /// Full public destination in I2P base64
    Base64,
    /// SHA-256 destination hash in I2P base64
    Hash,
}

/// Destination key pair as returned by `DEST GENERATE`
#[derive(Clone, PartialEq, Eq)]
pub struct I2pKeys {
    /// Public destination, I2P base64
    pub public: String,
    /// Private key blob, I2P base64. Also accepted as `DESTINATION=` by
    /// `SESSION CREATE`.
    pub private: String,
}

impl I2pKeys {
    pub fn new(public: impl Into<String>, private: impl Into<String>) -> Self {
        I2pKeys {
            public: public.into(),
            private: private.into(),
        }
    }

    /// Parse the on-disk form: public destination, newline, private key
    pub fn from_file_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| OnrampError::Identity("key file is not valid UTF-8".to_string()))?;
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let (public, private) = match (lines.next(), lines.next()) {
            (Some(public), Some(private)) => (public, private),
            _ => {
                return Err(OnrampError::Identity(
                    "key file must hold a public and a private key".to_string(),
                ))
            }
        };

        let keys = I2pKeys::new(public, private);
        keys.destination_bytes()?;
        Ok(keys)
    }

    pub fn to_file_bytes(&self) -> Vec<u8> {
        format!("{}\n{}", self.public, self.private).into_bytes()
    }

    /// Decoded public destination
    pub fn destination_bytes(&self) -> Result<Vec<u8>> {
        decode_destination(&self.public)
    }

    /// SHA-256 of the decoded destination
    pub fn dest_hash(&self) -> Result<[u8; 32]> {
        Ok(Sha256::digest(self.destination_bytes()?).into())
    }

    /// `<base32 hash>.b32.i2p`
    pub fn base32(&self) -> Result<String> {
        destination_base32(&self.public)
    }

    pub fn base32_truncated(&self) -> Result<String> {
        Ok(encode_base32(&self.dest_hash()?))
    }

    /// Render the destination in the given mode
    pub fn address(&self, mode: AddrMode) -> Result<String> {
        match mode {
            AddrMode::Base32 => self.base32(),
            AddrMode::Base32Truncated => self.base32_truncated(),
            AddrMode::Base64 => Ok(self.public.clone()),
            AddrMode::Hash => Ok(I2P_BASE64.encode(self.dest_hash()?)),
        }
    }
}

fn decode_destination(public: &str) -> Result<Vec<u8>> {
    I2P_BASE64
        .decode(public.as_bytes())
        .map_err(|e| OnrampError::Identity(format!("malformed destination: {}", e)))
}

fn encode_base32(hash: &[u8]) -> String {
    data_encoding::BASE32_NOPAD.encode(hash).to_ascii_lowercase()
}

/// `.b32.i2p` hostname of a full base64 destination
pub fn destination_base32(public: &str) -> Result<String> {
    let hash = Sha256::digest(decode_destination(public)?);
    Ok(format!("{}{}", encode_base32(&hash), B32_SUFFIX))
}

/// Whether `host` is a full base64 destination rather than a hostname
pub fn is_full_destination(host: &str) -> bool {
    host.len() >= 516 && !host.contains('.') && decode_destination(host).is_ok()
}

// Keep the private key out of logs
impl fmt::Debug for I2pKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("I2pKeys")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
