//! Requests sent by a paired workstation

use serde::{Deserialize, Serialize};

use crate::types::SiloError;

use super::base64_bytes;
use super::ssh::userauth_user;

/// A decoded workstation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RequestWire", into = "RequestWire")]
pub struct Request {
    /// Caller-chosen identifier, unique per logical request
    pub id: String,

    /// Claimed creation time
    pub unix_seconds: i64,

    /// Whether the workstation wants an acknowledgement while we wait on the user
    pub send_ack: bool,

    /// Payload; `None` is a bare ping answered with an ack
    pub body: Option<RequestBody>,
}

/// The single payload a request may carry
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Sign(SignRequest),
    GitSign(GitSignRequest),
    Me(MeRequest),
    Unpair(UnpairRequest),
    Hosts(HostsRequest),
}

impl Request {
    pub fn new(id: impl Into<String>, unix_seconds: i64, send_ack: bool) -> Self {
        Self {
            id: id.into(),
            unix_seconds,
            send_ack,
            body: None,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Payload kind for logs
    pub fn kind(&self) -> &'static str {
        match &self.body {
            None => "ping",
            Some(RequestBody::Sign(_)) => "sign",
            Some(RequestBody::GitSign(_)) => "git_sign",
            Some(RequestBody::Me(_)) => "me",
            Some(RequestBody::Unpair(_)) => "unpair",
            Some(RequestBody::Hosts(_)) => "hosts",
        }
    }

    /// Short description for approval prompts and notifications
    pub fn summary(&self) -> String {
        match &self.body {
            Some(RequestBody::Sign(sign)) => sign
                .command
                .clone()
                .unwrap_or_else(|| "SSH login".to_string()),
            Some(RequestBody::GitSign(git)) => format!("Git signature for {}", git.user_id),
            _ => self.kind().to_string(),
        }
    }
}

/// SSH signature request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Data to sign (SSH userauth blob)
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    /// Fingerprint of the key the workstation expects to sign with
    #[serde(with = "base64_bytes")]
    pub fingerprint: Vec<u8>,

    /// Server host authentication forwarded by the workstation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_auth: Option<HostAuth>,

    /// Command the workstation is running, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl SignRequest {
    /// First host name the server authenticated as
    pub fn host(&self) -> Option<&str> {
        self.host_auth
            .as_ref()
            .and_then(|auth| auth.host_names.first())
            .map(String::as_str)
    }

    /// Login user from the signed userauth blob
    pub fn user(&self) -> Option<String> {
        userauth_user(&self.data)
    }

    /// `"git@github.com"`-style label, the command, or `"SSH login"`
    pub fn display(&self) -> String {
        if let Some(command) = &self.command {
            return command.clone();
        }
        match (self.user(), self.host()) {
            (Some(user), Some(host)) => format!("{user}@{host}"),
            (None, Some(host)) => host.to_string(),
            _ => "SSH login".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    #[serde(with = "base64_bytes")]
    pub host_key: Vec<u8>,

    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,

    #[serde(default)]
    pub host_names: Vec<String>,
}

/// Git commit or tag signature request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSignRequest {
    /// Serialized commit or tag object
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnpairRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostsRequest {}

/// Flat JSON shape of a request
#[derive(Serialize, Deserialize)]
struct RequestWire {
    id: String,
    unix_seconds: i64,
    #[serde(default)]
    send_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sign_request: Option<SignRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_sign_request: Option<GitSignRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    me_request: Option<MeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unpair_request: Option<UnpairRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hosts_request: Option<HostsRequest>,
}

impl TryFrom<RequestWire> for Request {
    type Error = SiloError;

    fn try_from(wire: RequestWire) -> Result<Self, Self::Error> {
        let mut bodies = Vec::with_capacity(1);
        if let Some(sign) = wire.sign_request {
            bodies.push(RequestBody::Sign(sign));
        }
        if let Some(git) = wire.git_sign_request {
            bodies.push(RequestBody::GitSign(git));
        }
        if let Some(me) = wire.me_request {
            bodies.push(RequestBody::Me(me));
        }
        if let Some(unpair) = wire.unpair_request {
            bodies.push(RequestBody::Unpair(unpair));
        }
        if let Some(hosts) = wire.hosts_request {
            bodies.push(RequestBody::Hosts(hosts));
        }

        if bodies.len() > 1 {
            return Err(SiloError::MultipleRequests);
        }

        Ok(Self {
            id: wire.id,
            unix_seconds: wire.unix_seconds,
            send_ack: wire.send_ack,
            body: bodies.pop(),
        })
    }
}

impl From<Request> for RequestWire {
    fn from(request: Request) -> Self {
        let mut wire = RequestWire {
            id: request.id,
            unix_seconds: request.unix_seconds,
            send_ack: request.send_ack,
            sign_request: None,
            git_sign_request: None,
            me_request: None,
            unpair_request: None,
            hosts_request: None,
        };
        match request.body {
            Some(RequestBody::Sign(sign)) => wire.sign_request = Some(sign),
            Some(RequestBody::GitSign(git)) => wire.git_sign_request = Some(git),
            Some(RequestBody::Me(me)) => wire.me_request = Some(me),
            Some(RequestBody::Unpair(unpair)) => wire.unpair_request = Some(unpair),
            Some(RequestBody::Hosts(hosts)) => wire.hosts_request = Some(hosts),
            None => {}
        }
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ssh::userauth_blob;

    #[test]
    fn test_decode_sign_request() {
        let json = r#"{
            "id": "r1",
            "unix_seconds": 1700000000,
            "send_ack": true,
            "sign_request": {
                "data": "BAUG",
                "fingerprint": "AQID",
                "host_auth": {"host_key": "AA==", "signature": "AA==", "host_names": ["github.com"]}
            }
        }"#;

        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request.id, "r1");
        assert!(request.send_ack);
        match request.body {
            Some(RequestBody::Sign(sign)) => {
                assert_eq!(sign.fingerprint, vec![1, 2, 3]);
                assert_eq!(sign.host(), Some("github.com"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_bare_request_has_no_body() {
        let request: Request =
            serde_json::from_str(r#"{"id":"p","unix_seconds":5}"#).unwrap();
        assert!(request.body.is_none());
        assert!(!request.send_ack);
        assert_eq!(request.kind(), "ping");
    }

    #[test]
    fn test_multiple_payloads_rejected() {
        let json = r#"{"id":"x","unix_seconds":1,"me_request":{},"unpair_request":{}}"#;
        let err = serde_json::from_str::<Request>(json).unwrap_err();
        assert!(err.to_string().contains("Multiple requests"));
    }

    #[test]
    fn test_encode_uses_single_key() {
        let request = Request::new("u1", 10, false).with_body(RequestBody::Unpair(UnpairRequest {}));
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("unpair_request").is_some());
        assert!(value.get("sign_request").is_none());
        assert_eq!(value["unix_seconds"], 10);
    }

    #[test]
    fn test_sign_display() {
        let sign = SignRequest {
            data: userauth_blob("git"),
            fingerprint: vec![],
            host_auth: Some(HostAuth {
                host_key: vec![],
                signature: vec![],
                host_names: vec!["github.com".into()],
            }),
            command: None,
        };
        assert_eq!(sign.display(), "git@github.com");

        let bare = SignRequest {
            data: vec![1, 2, 3],
            fingerprint: vec![],
            host_auth: None,
            command: None,
        };
        assert_eq!(bare.display(), "SSH login");
    }
}
