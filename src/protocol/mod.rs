//! Wire protocol between workstation and device
//!
//! Messages are JSON objects with snake_case keys, sealed by the session
//! channel before they reach the transport. Requests carry at most one
//! payload key and responses exactly one body key; anything else is
//! rejected at decode time rather than guessed at.

pub mod request;
pub mod response;
pub mod ssh;

pub use request::{
    GitSignRequest, HostAuth, HostsRequest, MeRequest, Request, RequestBody, SignRequest,
    UnpairRequest,
};
pub use response::{
    AckResponse, GitSignResponse, HostInfo, HostsResponse, Me, MeResponse, Response,
    ResponseBody, SignResponse, UnpairResponse, UserAndHost,
};

/// Wire protocol version stamped on every response (`v`).
/// Independent of the crate version; bump only when the message format changes.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Serde adapter for byte fields carried as standard base64 strings
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
