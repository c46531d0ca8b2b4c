//! Responses returned to a paired workstation

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::types::SiloError;

use super::{base64_bytes, PROTOCOL_VERSION};

/// Response to a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseWire", into = "ResponseWire")]
pub struct Response {
    /// Echo of `Request::id`
    pub request_id: String,

    /// Push endpoint the workstation can reach this device on
    pub sns_endpoint_arn: String,

    /// Protocol version (`v`)
    pub version: String,

    /// End of the current time-boxed approval, unix seconds
    pub approved_until: Option<i64>,

    pub tracking_id: Option<String>,

    pub body: ResponseBody,
}

impl Response {
    pub fn new(request_id: impl Into<String>, endpoint: impl Into<String>, body: ResponseBody) -> Self {
        Self {
            request_id: request_id.into(),
            sns_endpoint_arn: endpoint.into(),
            version: PROTOCOL_VERSION.to_string(),
            approved_until: None,
            tracking_id: None,
            body,
        }
    }
}

/// Exactly one response payload
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Me(MeResponse),
    Sign(SignResponse),
    GitSign(GitSignResponse),
    Ack(AckResponse),
    Unpair(UnpairResponse),
    Hosts(HostsResponse),
}

impl ResponseBody {
    /// Error reported inside the body, if the variant carries one
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Sign(sign) => sign.error.as_deref(),
            Self::GitSign(git) => git.error.as_deref(),
            Self::Hosts(hosts) => hosts.error.as_deref(),
            Self::Me(_) | Self::Unpair(_) | Self::Ack(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignResponse {
    /// Base64 signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignResponse {
    pub fn signed(signature: &[u8]) -> Self {
        Self {
            signature: Some(BASE64.encode(signature)),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            signature: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSignResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GitSignResponse {
    pub fn signed(signature: &[u8]) -> Self {
        Self {
            signature: Some(BASE64.encode(signature)),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            signature: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeResponse {
    pub me: Me,
}

/// Identity of the device key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub email: String,

    /// SSH wire encoding of the public key
    #[serde(with = "base64_bytes")]
    pub public_key_wire: Vec<u8>,

    /// Base64 PGP public key, when one is available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_pk: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpairResponse {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub pgp_user_ids: Vec<String>,
    pub hosts: Vec<UserAndHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserAndHost {
    pub host: String,
    pub user: String,
}

/// Flat JSON shape of a response
#[derive(Serialize, Deserialize)]
struct ResponseWire {
    request_id: String,
    sns_endpoint_arn: String,
    v: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approved_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    me_response: Option<MeResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sign_response: Option<SignResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_sign_response: Option<GitSignResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_response: Option<AckResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unpair_response: Option<UnpairResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hosts_response: Option<HostsResponse>,
}

impl TryFrom<ResponseWire> for Response {
    type Error = SiloError;

    fn try_from(wire: ResponseWire) -> Result<Self, Self::Error> {
        let mut bodies = Vec::with_capacity(1);
        if let Some(me) = wire.me_response {
            bodies.push(ResponseBody::Me(me));
        }
        if let Some(sign) = wire.sign_response {
            bodies.push(ResponseBody::Sign(sign));
        }
        if let Some(git) = wire.git_sign_response {
            bodies.push(ResponseBody::GitSign(git));
        }
        if let Some(ack) = wire.ack_response {
            bodies.push(ResponseBody::Ack(ack));
        }
        if let Some(unpair) = wire.unpair_response {
            bodies.push(ResponseBody::Unpair(unpair));
        }
        if let Some(hosts) = wire.hosts_response {
            bodies.push(ResponseBody::Hosts(hosts));
        }

        if bodies.len() > 1 {
            return Err(SiloError::MultipleResponses);
        }
        let body = bodies
            .pop()
            .ok_or_else(|| SiloError::Malformed("response has no body".into()))?;

        Ok(Self {
            request_id: wire.request_id,
            sns_endpoint_arn: wire.sns_endpoint_arn,
            version: wire.v,
            approved_until: wire.approved_until,
            tracking_id: wire.tracking_id,
            body,
        })
    }
}

impl From<Response> for ResponseWire {
    fn from(response: Response) -> Self {
        let mut wire = ResponseWire {
            request_id: response.request_id,
            sns_endpoint_arn: response.sns_endpoint_arn,
            v: response.version,
            approved_until: response.approved_until,
            tracking_id: response.tracking_id,
            me_response: None,
            sign_response: None,
            git_sign_response: None,
            ack_response: None,
            unpair_response: None,
            hosts_response: None,
        };
        match response.body {
            ResponseBody::Me(me) => wire.me_response = Some(me),
            ResponseBody::Sign(sign) => wire.sign_response = Some(sign),
            ResponseBody::GitSign(git) => wire.git_sign_response = Some(git),
            ResponseBody::Ack(ack) => wire.ack_response = Some(ack),
            ResponseBody::Unpair(unpair) => wire.unpair_response = Some(unpair),
            ResponseBody::Hosts(hosts) => wire.hosts_response = Some(hosts),
        }
        wire
    }
}
