//! Device signing key
//!
//! The orchestrator only sees the [`KeyManager`] trait. The bundled
//! implementation holds one Ed25519 key in memory and publishes it in the
//! SSH wire format (`string "ssh-ed25519" || string key`).

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::types::{Result, SiloError};

// =============================================================================
// Constants
// =============================================================================

/// SSH key type name for Ed25519
pub const SSH_ED25519: &str = "ssh-ed25519";

/// Ed25519 seed length (32 bytes)
pub const SEED_LEN: usize = 32;

// =============================================================================
// KeyManager
// =============================================================================

/// Access to the device's signing key
pub trait KeyManager: Send + Sync {
    /// Whether a key has been generated or imported
    fn has_key(&self) -> bool;

    /// SHA-256 of the SSH wire public key
    fn fingerprint(&self) -> Result<Vec<u8>>;

    /// SSH wire encoding of the public key
    fn public_key_wire(&self) -> Result<Vec<u8>>;

    /// Sign raw data
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// In-memory Ed25519 key manager
pub struct Ed25519KeyManager {
    key: Option<SigningKey>,
}

impl Ed25519KeyManager {
    /// Generate a fresh key from the OS RNG
    pub fn generate() -> Self {
        Self {
            key: Some(SigningKey::generate(&mut OsRng)),
        }
    }

    /// Build from a 32-byte seed
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: [u8; SEED_LEN] = seed.try_into().map_err(|_| {
            SiloError::KeyManager(format!(
                "seed must be {} bytes, got {}",
                SEED_LEN,
                seed.len()
            ))
        })?;
        let seed = Zeroizing::new(seed);
        Ok(Self {
            key: Some(SigningKey::from_bytes(&seed)),
        })
    }

    /// Build from a hex-encoded seed, as stored in a seed file
    pub fn from_seed_hex(encoded: &str) -> Result<Self> {
        let seed = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| SiloError::KeyManager(format!("invalid seed hex: {}", e)))?,
        );
        Self::from_seed(&seed)
    }

    /// A manager with no key; every key operation fails
    pub fn empty() -> Self {
        Self { key: None }
    }

    fn key(&self) -> Result<&SigningKey> {
        self.key
            .as_ref()
            .ok_or_else(|| SiloError::KeyManager("no key pair".into()))
    }
}

impl KeyManager for Ed25519KeyManager {
    fn has_key(&self) -> bool {
        self.key.is_some()
    }

    fn fingerprint(&self) -> Result<Vec<u8>> {
        let wire = self.public_key_wire()?;
        Ok(Sha256::digest(&wire).to_vec())
    }

    fn public_key_wire(&self) -> Result<Vec<u8>> {
        let public = self.key()?.verifying_key();
        let mut wire = Vec::with_capacity(4 + SSH_ED25519.len() + 4 + 32);
        put_string(&mut wire, SSH_ED25519.as_bytes());
        put_string(&mut wire, public.as_bytes());
        Ok(wire)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signature = self.key()?.sign(data);
        Ok(signature.to_bytes().to_vec())
    }
}

impl std::fmt::Debug for Ed25519KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519KeyManager")
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

fn put_string(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}
