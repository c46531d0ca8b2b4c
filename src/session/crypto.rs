//! Cryptographic primitives for the session channel.
//!
//! # Algorithms
//!
//! - **Key Exchange**: X25519 between the device's per-session secret and
//!   the workstation's paired public key
//! - **Key Derivation**: SHA-256 over a context label, the shared secret and
//!   both public keys (workstation first, device second)
//! - **Encryption**: ChaCha20-Poly1305 with a random nonce prefixed to every
//!   sealed message
//!
//! Both ends run the same derivation, so the workstation side can be built
//! from these functions as well.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{Result, SiloError};

// =============================================================================
// Constants
// =============================================================================

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Domain separation label for channel keys
const KEY_CONTEXT: &[u8] = b"silo-session-v1";

// =============================================================================
// Key Generation
// =============================================================================

/// Generate a new X25519 secret for one side of a channel.
pub fn generate_channel_secret() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

// =============================================================================
// Channel Key
// =============================================================================

/// Symmetric key shared by the device and one workstation.
///
/// The key is zeroized (memory cleared) when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; 32]);

impl ChannelKey {
    /// Derive the channel key from our secret and the peer's public key.
    ///
    /// `workstation_public` and `device_public` must be passed in the same
    /// order on both ends. Fails when the exchange is non-contributory
    /// (the peer key is a low-order point).
    pub fn derive(
        own_secret: &StaticSecret,
        peer_public: &[u8; 32],
        workstation_public: &[u8; 32],
        device_public: &[u8; 32],
    ) -> Result<Self> {
        let shared = own_secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(SiloError::Crypto("key exchange was not contributory".into()));
        }

        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(shared.as_bytes());
        hasher.update(workstation_public);
        hasher.update(device_public);

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Ok(Self(key))
    }

    /// Encrypt a message. Output is `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| SiloError::Crypto(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed message.
    ///
    /// # Errors
    ///
    /// Returns `Crypto` if the message is truncated or the auth tag does not
    /// verify. Nothing is returned from a message that fails authentication.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AUTH_TAG_LEN {
            return Err(SiloError::Crypto(format!(
                "sealed message too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SiloError::Crypto("message failed authentication".into()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ChannelKey, ChannelKey) {
        let (ws_secret, ws_public) = generate_channel_secret();
        let (dev_secret, dev_public) = generate_channel_secret();
        let ws = ws_public.to_bytes();
        let dev = dev_public.to_bytes();

        let device_side = ChannelKey::derive(&dev_secret, &ws, &ws, &dev).unwrap();
        let workstation_side = ChannelKey::derive(&ws_secret, &dev, &ws, &dev).unwrap();
        (device_side, workstation_side)
    }

    #[test]
    fn test_both_sides_agree() {
        let (device, workstation) = pair();
        let sealed = workstation.seal(b"hello device").unwrap();

        // Nonce + plaintext + tag
        assert_eq!(sealed.len(), NONCE_LEN + 12 + AUTH_TAG_LEN);
        assert_eq!(device.open(&sealed).unwrap(), b"hello device");
    }

    #[test]
    fn test_tampered_message_fails() {
        let (device, workstation) = pair();
        let mut sealed = workstation.seal(b"sign this").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(device.open(&sealed), Err(SiloError::Crypto(_))));
    }

    #[test]
    fn test_truncated_message_fails() {
        let (device, _) = pair();
        assert!(matches!(device.open(&[0u8; 20]), Err(SiloError::Crypto(_))));
    }

    #[test]
    fn test_low_order_peer_rejected() {
        let (secret, public) = generate_channel_secret();
        let zero = [0u8; 32];
        let result = ChannelKey::derive(&secret, &zero, &zero, &public.to_bytes());
        assert!(matches!(result, Err(SiloError::Crypto(_))));
    }
}
