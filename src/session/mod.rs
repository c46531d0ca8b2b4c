//! Encrypted Sessions
//!
//! A session is the live channel derived from a pairing. Each session owns a
//! fresh device-side X25519 secret; the resulting channel key never leaves
//! `encrypt`/`decrypt`.

pub mod crypto;
pub mod registry;

use chrono::{DateTime, Utc};

use crate::pairing::Pairing;
use crate::types::Result;

use self::crypto::{generate_channel_secret, ChannelKey};

pub use registry::{NullPersistence, SessionPersistence, SessionRegistry};

/// Live encrypted channel with one paired workstation
pub struct Session {
    /// Same as the pairing id
    id: String,

    pairing: Pairing,

    /// Session creation timestamp
    created: DateTime<Utc>,

    /// Device half of the key exchange, handed back to the workstation
    device_public_key: [u8; 32],

    channel: ChannelKey,
}

impl Session {
    /// Derive a new session for a pairing
    pub fn new(pairing: Pairing) -> Result<Self> {
        let (secret, public) = generate_channel_secret();
        let device_public_key = public.to_bytes();
        let workstation = *pairing.workstation_public_key();

        let channel = ChannelKey::derive(&secret, &workstation, &workstation, &device_public_key)?;

        Ok(Self {
            id: pairing.id().to_string(),
            pairing,
            created: Utc::now(),
            device_public_key,
            channel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pairing(&self) -> &Pairing {
        &self.pairing
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn device_public_key(&self) -> &[u8; 32] {
        &self.device_public_key
    }

    /// Seal a message for the workstation
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.channel.seal(plaintext)
    }

    /// Open a message from the workstation
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.channel.open(ciphertext)
    }

    /// Whether both values describe the same channel, not only the same pairing
    pub fn same_channel(&self, other: &Session) -> bool {
        self.id == other.id && self.device_public_key == other.device_public_key
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.pairing.name())
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SiloError;

    fn workstation() -> (x25519_dalek::StaticSecret, Pairing) {
        let (secret, public) = generate_channel_secret();
        let pairing = Pairing::new("test", public.as_bytes()).unwrap();
        (secret, pairing)
    }

    #[test]
    fn test_session_round_trip_with_workstation() {
        let (ws_secret, pairing) = workstation();
        let ws_public = *pairing.workstation_public_key();
        let session = Session::new(pairing).unwrap();

        let ws_channel = ChannelKey::derive(
            &ws_secret,
            session.device_public_key(),
            &ws_public,
            session.device_public_key(),
        )
        .unwrap();

        let sealed = ws_channel.seal(br#"{"id":"r1"}"#).unwrap();
        assert_eq!(session.decrypt(&sealed).unwrap(), br#"{"id":"r1"}"#);

        let reply = session.encrypt(b"ok").unwrap();
        assert_eq!(ws_channel.open(&reply).unwrap(), b"ok");
    }

    #[test]
    fn test_sessions_for_same_pairing_are_distinct_channels() {
        let (_, pairing) = workstation();
        let a = Session::new(pairing.clone()).unwrap();
        let b = Session::new(pairing).unwrap();

        assert_eq!(a.id(), b.id());
        assert!(!a.same_channel(&b));
        assert!(a.same_channel(&a));

        // A message sealed for one channel does not open on the other
        let sealed = a.encrypt(b"secret").unwrap();
        assert!(matches!(b.decrypt(&sealed), Err(SiloError::Crypto(_))));
    }
}
