//! Ed25519 onion service identity (v3)

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use onramp_core::{OnrampError, Result};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use sha3::Sha3_256;
use std::fmt;

/// Onion service address version
const ONION_VERSION: u8 = 0x03;

/// Length of a v3 service id (without `.onion`)
pub const SERVICE_ID_LEN: usize = 56;

/// Persistent onion service key pair
#[derive(Clone)]
pub struct OnionKeys {
    signing: SigningKey,
}

impl OnionKeys {
    /// Fresh key pair from the OS CSPRNG
    pub fn generate() -> Self {
        OnionKeys {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Parse the on-disk form: 32-byte seed followed by the 32-byte public key
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; 64] = bytes.try_into().map_err(|_| {
            OnrampError::Identity(format!(
                "onion key file must be 64 bytes, found {}",
                bytes.len()
            ))
        })?;
        let signing = SigningKey::from_keypair_bytes(bytes)
            .map_err(|e| OnrampError::Identity(format!("corrupt onion key: {}", e)))?;
        Ok(OnionKeys { signing })
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.signing.to_keypair_bytes()
    }

    pub fn public(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// 56-character v3 service id
    pub fn service_id(&self) -> String {
        service_id_for(&self.public())
    }

    /// `<service id>.onion`
    pub fn onion_address(&self) -> String {
        format!("{}.onion", self.service_id())
    }

    /// Key blob for `ADD_ONION ED25519-V3:<blob>`: the clamped SHA-512
    /// expansion of the seed, base64 encoded
    pub fn expanded_secret_base64(&self) -> String {
        let mut expanded = [0u8; 64];
        expanded.copy_from_slice(&Sha512::digest(self.signing.to_bytes()));
        expanded[0] &= 248;
        expanded[31] &= 127;
        expanded[31] |= 64;
        STANDARD.encode(expanded)
    }
}

/// base32(pubkey || checksum[..2] || version), checksum =
/// SHA3-256(".onion checksum" || pubkey || version)
pub fn service_id_for(public: &VerifyingKey) -> String {
    let pubkey = public.as_bytes();

    let mut hasher = Sha3_256::new();
    hasher.update(b".onion checksum");
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let checksum = hasher.finalize();

    let mut raw = Vec::with_capacity(35);
    raw.extend_from_slice(pubkey);
    raw.extend_from_slice(&checksum[..2]);
    raw.push(ONION_VERSION);

    data_encoding::BASE32_NOPAD.encode(&raw).to_ascii_lowercase()
}

impl PartialEq for OnionKeys {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for OnionKeys {}

impl fmt::Debug for OnionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionKeys")
            .field("service_id", &self.service_id())
            .finish_non_exhaustive()
    }
}
