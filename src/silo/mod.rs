//! Request Orchestrator
//!
//! `Silo` takes a decoded request for a session and runs it through the
//! authorization pipeline:
//!
//! 1. Session liveness (registry)
//! 2. Freshness and de-duplication (replay guard)
//! 3. Payload dispatch, gated by the approval policy for signatures
//! 4. Response construction and caching
//!
//! All shared state lives in a [`SiloContext`] handed in at construction, so
//! every test can run against its own isolated registry and policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::keys::KeyManager;
use crate::logging::{SignatureEvent, SignatureKind, SignatureLogger};
use crate::policy::{ApprovalDecision, Policy};
use crate::protocol::{
    AckResponse, GitSignRequest, GitSignResponse, HostInfo, HostsResponse, Me, MeResponse,
    Request, RequestBody, Response, ResponseBody, SignRequest, SignResponse, UnpairResponse,
};
use crate::replay::{check_request_time, time_until_stale, Admission, ReplayGuard, REQUEST_TIME_TOLERANCE};
use crate::session::{Session, SessionRegistry};
use crate::types::{unix_now, CommunicationMedium, Result, SiloError};

/// How long a request waits on the user before it is treated as rejected
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(REQUEST_TIME_TOLERANCE as u64);

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct SiloConfig {
    /// Endpoint the workstation can reach this device on (`sns_endpoint_arn`)
    pub endpoint: String,

    /// Email reported in `me_response`
    pub identity_email: String,

    /// PGP user ids reported in `hosts_response`
    pub pgp_user_ids: Vec<String>,

    /// Optional analytics id stamped on responses
    pub tracking_id: Option<String>,

    pub approval_timeout: Duration,
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            identity_email: String::new(),
            pgp_user_ids: Vec::new(),
            tracking_id: None,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }
}

/// Outbound channel for sealed responses
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        sealed: Vec<u8>,
        medium: CommunicationMedium,
        endpoint: &str,
    ) -> Result<()>;
}

/// Process-wide state shared by every request handler
pub struct SiloContext {
    pub registry: Arc<SessionRegistry>,
    pub replay: ReplayGuard,
    pub policy: Arc<Policy>,
    pub keys: Arc<dyn KeyManager>,
    pub signatures: SignatureLogger,
    pub transport: Option<Arc<dyn Transport>>,
}

impl SiloContext {
    /// Context with an empty in-memory registry and no transport
    pub fn new(keys: Arc<dyn KeyManager>, policy: Arc<Policy>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::default()),
            replay: ReplayGuard::new(),
            policy,
            keys,
            signatures: SignatureLogger::new(),
            transport: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_signatures(mut self, signatures: SignatureLogger) -> Self {
        self.signatures = signatures;
        self
    }
}

/// The request orchestrator
pub struct Silo {
    config: SiloConfig,
    ctx: SiloContext,
}

impl Silo {
    pub fn new(config: SiloConfig, ctx: SiloContext) -> Self {
        Self { config, ctx }
    }

    pub fn config(&self) -> &SiloConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.ctx.policy
    }

    pub fn replay(&self) -> &ReplayGuard {
        &self.ctx.replay
    }

    pub fn signatures(&self) -> &SignatureLogger {
        &self.ctx.signatures
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Register a session; returns the session it replaced, if any.
    ///
    /// A prompt still waiting on the replaced channel is cancelled.
    pub async fn add(&self, session: Arc<Session>, temporary: bool) -> Option<Arc<Session>> {
        let replaced = self.ctx.registry.add(session, temporary);
        if let Some(old) = &replaced {
            self.ctx.policy.cancel_for_session(old).await;
        }
        replaced
    }

    /// Remove a session and everything tracked for it
    pub async fn remove(&self, session: &Session) -> bool {
        if !self.ctx.registry.remove(session) {
            return false;
        }

        self.ctx.replay.forget(session.id());
        self.ctx.signatures.forget(session.id());
        self.ctx.policy.cancel_for_session(session).await;
        self.ctx.policy.forget(session.id());
        true
    }

    /// Deliver the user's decision for a prompt, as long as its session is still live
    pub async fn resolve(&self, session_id: &str, request_id: &str, decision: ApprovalDecision) -> bool {
        let registry = &self.ctx.registry;
        self.ctx
            .policy
            .resolve_if(session_id, request_id, decision, |session| registry.is_live(session))
            .await
    }

    /// Age out cached responses
    pub fn cleanup(&self) {
        self.ctx.replay.cleanup();
    }

    // =========================================================================
    // Request handling
    // =========================================================================

    /// Handle a decoded request for a session
    pub async fn handle(
        &self,
        request: Request,
        session: &Arc<Session>,
        medium: CommunicationMedium,
    ) -> Result<Response> {
        if !self.ctx.registry.is_live(session) {
            warn!(session_id = %session.id(), request_id = %request.id, "Request for removed session");
            return Err(SiloError::SessionRemoved(session.id().to_string()));
        }

        let ticket = match self.ctx.replay.admit(session.id(), &request)? {
            Admission::Cached(response) => return Ok(response),
            Admission::Fresh(ticket) => ticket,
        };

        debug!(
            session_id = %session.id(),
            request_id = %request.id,
            kind = request.kind(),
            medium = %medium,
            "Handling request"
        );

        // An error here drops the ticket, releasing the pending mark
        let body = self.dispatch(&request, session, medium).await?;
        let response = self.build_response(&request, session, body);
        ticket.complete(&response);

        if matches!(request.body, Some(RequestBody::Unpair(_))) {
            info!(session_id = %session.id(), "Unpair requested by workstation");
            self.remove(session).await;
        }

        Ok(response)
    }

    /// Decrypt, decode, handle and deliver a sealed request.
    ///
    /// Decryption and decoding failures produce no response.
    pub async fn handle_sealed(
        &self,
        session_id: &str,
        sealed: &[u8],
        medium: CommunicationMedium,
    ) -> Result<Response> {
        let session = self
            .ctx
            .registry
            .get(session_id)
            .ok_or_else(|| SiloError::SessionRemoved(session_id.to_string()))?;

        let plaintext = session.decrypt(sealed).inspect_err(|e| {
            warn!(session_id = %session_id, "Dropping undecryptable message: {}", e);
        })?;
        let request: Request = serde_json::from_slice(&plaintext).inspect_err(|e| {
            warn!(session_id = %session_id, "Dropping undecodable request: {}", e);
        })?;

        let response = self.handle(request, &session, medium).await?;
        self.deliver(&session, &response, medium).await?;
        Ok(response)
    }

    /// Seal a response for its session and hand it to the transport
    pub async fn deliver(
        &self,
        session: &Session,
        response: &Response,
        medium: CommunicationMedium,
    ) -> Result<()> {
        let transport = self
            .ctx
            .transport
            .as_ref()
            .ok_or_else(|| SiloError::Transport("no transport configured".into()))?;

        let encoded = serde_json::to_vec(response)?;
        let sealed = session.encrypt(&encoded)?;
        transport.deliver(sealed, medium, &self.config.endpoint).await
    }

    async fn dispatch(
        &self,
        request: &Request,
        session: &Arc<Session>,
        medium: CommunicationMedium,
    ) -> Result<ResponseBody> {
        match &request.body {
            None => Ok(ResponseBody::Ack(AckResponse {})),
            Some(RequestBody::Sign(sign)) => self.sign_ssh(request, sign, session, medium).await,
            Some(RequestBody::GitSign(git)) => self.sign_git(request, git, session, medium).await,
            Some(RequestBody::Me(_)) => self.me(),
            Some(RequestBody::Hosts(_)) => Ok(ResponseBody::Hosts(self.hosts(session))),
            Some(RequestBody::Unpair(_)) => Ok(ResponseBody::Unpair(UnpairResponse {})),
        }
    }

    fn build_response(&self, request: &Request, session: &Session, body: ResponseBody) -> Response {
        let mut response = Response::new(request.id.clone(), self.config.endpoint.clone(), body);
        response.approved_until = self
            .ctx
            .policy
            .approved_until(session.id())
            .map(|until| until.timestamp());
        response.tracking_id = self.config.tracking_id.clone();
        response
    }

    // =========================================================================
    // Payloads
    // =========================================================================

    async fn sign_ssh(
        &self,
        request: &Request,
        sign: &SignRequest,
        session: &Arc<Session>,
        medium: CommunicationMedium,
    ) -> Result<ResponseBody> {
        self.check_fingerprint(&sign.fingerprint)?;
        self.authorize(request, session, medium).await?;

        let (body, failure) = match self.ctx.keys.sign(&sign.data) {
            Ok(signature) => (SignResponse::signed(&signature), None),
            Err(e) => {
                error!(session_id = %session.id(), request_id = %request.id, "SSH signing failed: {}", e);
                (SignResponse::failed(e.to_string()), Some(e.to_string()))
            }
        };

        let event = SignatureEvent::new(SignatureKind::Ssh, session.id(), &request.id, sign.display())
            .with_user(sign.user())
            .with_host(sign.host().map(str::to_string))
            .with_outcome(failure);
        self.ctx.signatures.log(event).await;

        Ok(ResponseBody::Sign(body))
    }

    async fn sign_git(
        &self,
        request: &Request,
        git: &GitSignRequest,
        session: &Arc<Session>,
        medium: CommunicationMedium,
    ) -> Result<ResponseBody> {
        self.authorize(request, session, medium).await?;

        let (body, failure) = match self.ctx.keys.sign(&git.data) {
            Ok(signature) => (GitSignResponse::signed(&signature), None),
            Err(e) => {
                error!(session_id = %session.id(), request_id = %request.id, "Git signing failed: {}", e);
                (GitSignResponse::failed(e.to_string()), Some(e.to_string()))
            }
        };

        let event = SignatureEvent::new(SignatureKind::Git, session.id(), &request.id, request.summary())
            .with_outcome(failure);
        self.ctx.signatures.log(event).await;

        Ok(ResponseBody::GitSign(body))
    }

    fn me(&self) -> Result<ResponseBody> {
        let public_key_wire = self.ctx.keys.public_key_wire()?;
        Ok(ResponseBody::Me(MeResponse {
            me: Me {
                email: self.config.identity_email.clone(),
                public_key_wire,
                pgp_pk: None,
            },
        }))
    }

    fn hosts(&self, session: &Session) -> HostsResponse {
        HostsResponse {
            host_info: Some(HostInfo {
                pgp_user_ids: self.config.pgp_user_ids.clone(),
                hosts: self.ctx.signatures.known_hosts(session.id()),
            }),
            error: None,
        }
    }

    /// Refuse to sign for any key but our own
    fn check_fingerprint(&self, fingerprint: &[u8]) -> Result<()> {
        if !self.ctx.keys.has_key() {
            return Err(SiloError::KeyManager("no key pair".into()));
        }
        if self.ctx.keys.fingerprint()? != fingerprint {
            warn!("Sign request for a foreign key fingerprint");
            return Err(SiloError::KeyManager("fingerprint mismatch".into()));
        }
        Ok(())
    }

    // =========================================================================
    // Approval
    // =========================================================================

    /// Wait for the user if the policy requires it
    async fn authorize(
        &self,
        request: &Request,
        session: &Arc<Session>,
        medium: CommunicationMedium,
    ) -> Result<()> {
        let policy = &self.ctx.policy;

        if !policy.needs_user_approval(session.id()) {
            policy.notify_user(session, request);
            return Ok(());
        }

        // Never wait past the point where the request itself goes stale
        let now = unix_now();
        let until_stale = time_until_stale(request, now);
        if until_stale.is_zero() {
            return Err(SiloError::InvalidRequestTime {
                unix_seconds: request.unix_seconds,
                now,
            });
        }
        let wait = self.config.approval_timeout.min(until_stale);

        if request.send_ack {
            self.send_ack(request, session, medium).await;
        }

        let receiver = policy
            .request_user_authorization(Arc::clone(session), request)
            .await;

        let decision = match tokio::time::timeout(wait, receiver).await {
            Ok(Ok(decision)) => decision,
            // Responder dropped without a decision
            Ok(Err(_)) => ApprovalDecision::Superseded,
            Err(_) => {
                policy.withdraw(session.id(), &request.id).await;
                if wait == until_stale {
                    info!(session_id = %session.id(), request_id = %request.id, "Request expired awaiting approval");
                    return Err(SiloError::InvalidRequestTime {
                        unix_seconds: request.unix_seconds,
                        now: unix_now(),
                    });
                }
                info!(session_id = %session.id(), request_id = %request.id, "Approval timed out");
                return Err(SiloError::UserRejected(format!(
                    "{}: approval timed out",
                    request.id
                )));
            }
        };

        match decision {
            ApprovalDecision::Approve | ApprovalDecision::ApproveFor(_) => {}
            ApprovalDecision::Reject => {
                info!(session_id = %session.id(), request_id = %request.id, "Request rejected by user");
                return Err(SiloError::UserRejected(request.id.clone()));
            }
            ApprovalDecision::Superseded => {
                return Err(SiloError::ApprovalSuperseded(request.id.clone()));
            }
            ApprovalDecision::Cancelled => {
                return Err(SiloError::SessionRemoved(session.id().to_string()));
            }
        }

        // The session may have been unpaired while we waited
        if !self.ctx.registry.is_live(session) {
            return Err(SiloError::SessionRemoved(session.id().to_string()));
        }
        check_request_time(request, unix_now()).inspect_err(|_| {
            info!(session_id = %session.id(), request_id = %request.id, "Request went stale while awaiting approval");
        })
    }

    /// Tell the workstation the request arrived and is waiting on the user
    async fn send_ack(&self, request: &Request, session: &Session, medium: CommunicationMedium) {
        if self.ctx.transport.is_none() {
            debug!(request_id = %request.id, "No transport, skipping ack");
            return;
        }

        let ack = self.build_response(request, session, ResponseBody::Ack(AckResponse {}));
        if let Err(e) = self.deliver(session, &ack, medium).await {
            warn!(session_id = %session.id(), request_id = %request.id, "Failed to deliver ack: {}", e);
        }
    }
}
