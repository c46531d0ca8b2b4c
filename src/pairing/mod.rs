//! Workstation Pairings
//!
//! A pairing is the trust record binding one workstation's key-exchange
//! public key to the name it chose for itself. Pairings are created from the
//! offer the workstation displays (usually as a QR code) and never change
//! afterwards; re-pairing produces a new record.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Result, SiloError};

/// X25519 public key length (32 bytes)
pub const PUBLIC_KEY_LEN: usize = 32;

/// Trust relationship with a single workstation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    id: String,
    name: String,
    workstation_public_key: [u8; PUBLIC_KEY_LEN],
}

impl Pairing {
    /// Build a pairing from a workstation name and its public key.
    ///
    /// Fails with `InvalidPairing` when the key is not a 32-byte X25519
    /// point or is the all-zero point.
    pub fn new(name: impl Into<String>, workstation_public_key: &[u8]) -> Result<Self> {
        let key: [u8; PUBLIC_KEY_LEN] = workstation_public_key.try_into().map_err(|_| {
            SiloError::InvalidPairing(format!(
                "workstation public key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                workstation_public_key.len()
            ))
        })?;

        if key.iter().all(|b| *b == 0) {
            return Err(SiloError::InvalidPairing(
                "workstation public key is the zero point".into(),
            ));
        }

        Ok(Self {
            id: pairing_id(&key),
            name: name.into(),
            workstation_public_key: key,
        })
    }

    /// Stable identifier derived from the workstation key
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name as sent by the workstation
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workstation_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.workstation_public_key
    }

    /// Human-facing name: `alice@laptop.local` becomes `laptop`
    pub fn display_name(&self) -> String {
        device_name(&self.name).replace(".local", "")
    }
}

/// Hex SHA-256 of the workstation public key
fn pairing_id(key: &[u8; PUBLIC_KEY_LEN]) -> String {
    hex::encode(Sha256::digest(key))
}

/// Drop everything up to the first `@`, if any
fn device_name(name: &str) -> String {
    let parts: Vec<&str> = name.split('@').collect();
    if parts.len() > 1 {
        parts[1..].concat()
    } else {
        name.to_string()
    }
}

/// Pairing offer as displayed by the workstation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingOffer {
    /// Workstation public key (base64)
    pub pk: String,

    /// Workstation name
    pub n: String,
}

impl PairingOffer {
    /// Parse the scanned JSON payload
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| SiloError::InvalidPairing(format!("unreadable pairing offer: {e}")))
    }

    /// Validate the offer into a pairing
    pub fn into_pairing(self) -> Result<Pairing> {
        let key = BASE64
            .decode(self.pk.as_bytes())
            .map_err(|e| SiloError::InvalidPairing(format!("public key is not base64: {e}")))?;
        Pairing::new(self.n, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        let mut k = [7u8; 32];
        k[0] = 9;
        k
    }

    #[test]
    fn test_pairing_id_is_stable() {
        let a = Pairing::new("laptop", &key()).unwrap();
        let b = Pairing::new("other name", &key()).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(
            Pairing::new("short", &[1u8; 31]),
            Err(SiloError::InvalidPairing(_))
        ));
        assert!(matches!(
            Pairing::new("zero", &[0u8; 32]),
            Err(SiloError::InvalidPairing(_))
        ));
    }

    #[test]
    fn test_display_name() {
        let p = Pairing::new("alice@alices-mbp.local", &key()).unwrap();
        assert_eq!(p.display_name(), "alices-mbp");

        let p = Pairing::new("workstation", &key()).unwrap();
        assert_eq!(p.display_name(), "workstation");
    }

    #[test]
    fn test_offer_into_pairing() {
        let json = format!(r#"{{"pk":"{}","n":"bob@desk"}}"#, BASE64.encode(key()));
        let pairing = PairingOffer::from_json(&json).unwrap().into_pairing().unwrap();
        assert_eq!(pairing.name(), "bob@desk");
        assert_eq!(pairing.workstation_public_key(), &key());

        let bad = PairingOffer { pk: "!!".into(), n: "x".into() };
        assert!(matches!(bad.into_pairing(), Err(SiloError::InvalidPairing(_))));
    }
}
