//! Approval Policy
//!
//! Decides whether a request needs the user's consent and hands pending
//! approvals to the UI collaborator. Approval state is kept per session:
//!
//! - `needs_user_approval`: whether the session requires consent at all
//! - `approved_until`: end of a time-boxed "allow for" window
//!
//! Only one approval prompt is outstanding at a time. A new prompt replaces
//! the old one and the replaced waiter receives [`ApprovalDecision::Superseded`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::protocol::Request;
use crate::session::Session;

/// Default length of an "allow for" window
pub const DEFAULT_APPROVAL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Outcome delivered to a request waiting on the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Allow this request only
    Approve,
    /// Allow this request and skip prompts for the given window
    ApproveFor(Duration),
    Reject,
    /// A newer request took the approval slot
    Superseded,
    /// The session went away while waiting
    Cancelled,
}

/// Policy settings
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Whether new sessions require approval
    pub require_approval: bool,

    /// Window used for "allow for" approvals without an explicit length
    pub approval_interval: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            require_approval: true,
            approval_interval: DEFAULT_APPROVAL_INTERVAL,
        }
    }
}

/// UI collaborator shown approval prompts while the app is in the foreground
pub trait ApprovalPresenter: Send + Sync {
    fn is_foreground(&self) -> bool;

    fn present(&self, session: &Session, request: &Request, message: &str);
}

/// Notification collaborator
pub trait Notifier: Send + Sync {
    /// Ask the user to approve a request from the background
    fn alert_authorization(&self, session: &Session, request: &Request, message: &str);

    /// Informational alert, no response expected
    fn notify(&self, session: &Session, request: &Request, message: &str);
}

/// Presenter for processes without a UI; always reports background
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPresenter;

impl ApprovalPresenter for HeadlessPresenter {
    fn is_foreground(&self) -> bool {
        false
    }

    fn present(&self, _session: &Session, _request: &Request, _message: &str) {}
}

/// Notifier that writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert_authorization(&self, session: &Session, request: &Request, message: &str) {
        info!(
            session_id = %session.id(),
            request_id = %request.id,
            "Approval required: {}",
            message
        );
    }

    fn notify(&self, session: &Session, request: &Request, message: &str) {
        info!(
            session_id = %session.id(),
            request_id = %request.id,
            "{}",
            message
        );
    }
}

/// The request currently waiting on the user
pub struct PendingAuthorization {
    pub session: Arc<Session>,
    pub request: Request,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl PendingAuthorization {
    fn matches(&self, session_id: &str, request_id: &str) -> bool {
        self.session.id() == session_id && self.request.id == request_id
    }
}

#[derive(Debug, Clone)]
struct ApprovalState {
    needs_user_approval: bool,
    approved_until: Option<DateTime<Utc>>,
}

/// Approval gate shared by all request handlers
pub struct Policy {
    config: PolicyConfig,
    approvals: DashMap<String, ApprovalState>,
    pending: Mutex<Option<PendingAuthorization>>,
    presenter: Arc<dyn ApprovalPresenter>,
    notifier: Arc<dyn Notifier>,
}

impl Policy {
    pub fn new(
        config: PolicyConfig,
        presenter: Arc<dyn ApprovalPresenter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            approvals: DashMap::new(),
            pending: Mutex::new(None),
            presenter,
            notifier,
        }
    }

    /// Headless policy that logs its alerts
    pub fn headless(config: PolicyConfig) -> Self {
        Self::new(config, Arc::new(HeadlessPresenter), Arc::new(LogNotifier))
    }

    pub fn approval_interval(&self) -> Duration {
        self.config.approval_interval
    }

    // =========================================================================
    // Approval state
    // =========================================================================

    /// Whether a request on this session must wait for the user
    pub fn needs_user_approval(&self, session_id: &str) -> bool {
        self.needs_user_approval_at(session_id, Utc::now())
    }

    fn needs_user_approval_at(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        match self.approvals.get(session_id) {
            Some(state) => {
                state.needs_user_approval && !state.approved_until.is_some_and(|until| now < until)
            }
            None => self.config.require_approval,
        }
    }

    /// Skip approval for this session for `duration` from now
    pub fn allow_for(&self, session_id: &str, duration: Duration) {
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.state_mut(session_id, |state| state.approved_until = Some(until));
        info!(session_id = %session_id, approved_until = %until, "Approval granted");
    }

    /// Turn approval on or off for a session; clears any active window
    pub fn set_needs_user_approval(&self, session_id: &str, needs: bool) {
        self.state_mut(session_id, |state| {
            state.needs_user_approval = needs;
            state.approved_until = None;
        });
        info!(session_id = %session_id, needs_user_approval = needs, "Approval setting changed");
    }

    /// End of the active approval window, if any
    pub fn approved_until(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.approved_until_at(session_id, Utc::now())
    }

    fn approved_until_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.approvals
            .get(session_id)
            .and_then(|state| state.approved_until)
            .filter(|until| now < *until)
    }

    /// Time left in the active approval window
    pub fn approval_time_remaining(&self, session_id: &str) -> Option<Duration> {
        let now = Utc::now();
        self.approved_until_at(session_id, now)
            .and_then(|until| (until - now).to_std().ok())
    }

    /// Drop approval state for a session
    pub fn forget(&self, session_id: &str) {
        self.approvals.remove(session_id);
    }

    fn state_mut(&self, session_id: &str, update: impl FnOnce(&mut ApprovalState)) {
        let mut state = self
            .approvals
            .entry(session_id.to_string())
            .or_insert_with(|| ApprovalState {
                needs_user_approval: self.config.require_approval,
                approved_until: None,
            });
        update(&mut state);
    }

    // =========================================================================
    // Pending authorization
    // =========================================================================

    /// Put a request in the approval slot and alert the user.
    ///
    /// The returned receiver resolves once [`Policy::resolve`] is called for
    /// this request, or with `Superseded`/`Cancelled` if it is displaced.
    pub async fn request_user_authorization(
        &self,
        session: Arc<Session>,
        request: &Request,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (responder, receiver) = oneshot::channel();
        let message = authorization_message(&session, request);

        let previous = self.pending.lock().await.replace(PendingAuthorization {
            session: Arc::clone(&session),
            request: request.clone(),
            responder,
        });

        if let Some(previous) = previous {
            info!(
                session_id = %previous.session.id(),
                request_id = %previous.request.id,
                "Pending approval superseded"
            );
            let _ = previous.responder.send(ApprovalDecision::Superseded);
        }

        if self.presenter.is_foreground() {
            self.presenter.present(&session, request, &message);
        } else {
            self.notifier.alert_authorization(&session, request, &message);
        }

        receiver
    }

    /// Deliver the user's decision for a pending request.
    ///
    /// Returns `false` when the request is no longer waiting, in which case
    /// nothing changes.
    pub async fn resolve(&self, session_id: &str, request_id: &str, decision: ApprovalDecision) -> bool {
        self.resolve_if(session_id, request_id, decision, |_| true).await
    }

    /// Like [`Policy::resolve`], but only while `is_live` holds for the waiting
    /// session. A prompt for a session that was replaced or removed is
    /// cancelled and the decision is dropped.
    pub async fn resolve_if(
        &self,
        session_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
        is_live: impl FnOnce(&Session) -> bool,
    ) -> bool {
        let pending = {
            let mut slot = self.pending.lock().await;
            match slot.as_ref() {
                Some(p) if p.matches(session_id, request_id) => slot.take(),
                _ => None,
            }
        };

        let Some(pending) = pending else {
            debug!(session_id = %session_id, request_id = %request_id, "No pending approval for request");
            return false;
        };

        if pending.responder.is_closed() {
            debug!(request_id = %request_id, "Approval waiter already gone");
            return false;
        }

        if !is_live(&pending.session) {
            info!(
                session_id = %session_id,
                request_id = %request_id,
                "Dropping decision for a stale session"
            );
            let _ = pending.responder.send(ApprovalDecision::Cancelled);
            return false;
        }

        if let ApprovalDecision::ApproveFor(duration) = decision {
            self.allow_for(session_id, duration);
        }

        info!(
            session_id = %session_id,
            request_id = %request_id,
            decision = ?decision,
            "Approval resolved"
        );
        pending.responder.send(decision).is_ok()
    }

    /// Clear the slot if it still holds this request, without notifying the waiter
    pub async fn withdraw(&self, session_id: &str, request_id: &str) {
        let mut slot = self.pending.lock().await;
        if slot.as_ref().is_some_and(|p| p.matches(session_id, request_id)) {
            slot.take();
            debug!(session_id = %session_id, request_id = %request_id, "Withdrew pending approval");
        }
    }

    /// Cancel a pending approval that belongs to this session's channel
    pub async fn cancel_for_session(&self, session: &Session) {
        let pending = {
            let mut slot = self.pending.lock().await;
            match slot.as_ref() {
                Some(p) if p.session.same_channel(session) => slot.take(),
                _ => None,
            }
        };

        if let Some(pending) = pending {
            info!(
                session_id = %session.id(),
                request_id = %pending.request.id,
                "Pending approval cancelled"
            );
            let _ = pending.responder.send(ApprovalDecision::Cancelled);
        }
    }

    /// Snapshot of the request waiting on the user
    pub async fn pending(&self) -> Option<(Arc<Session>, Request)> {
        self.pending
            .lock()
            .await
            .as_ref()
            .map(|p| (Arc::clone(&p.session), p.request.clone()))
    }

    /// Informational alert for a request that went through without a prompt
    pub fn notify_user(&self, session: &Session, request: &Request) {
        let message = authorization_message(session, request);
        self.notifier.notify(session, request, &message);
    }
}

/// `"Request from <display name>: <what>"`
pub fn authorization_message(session: &Session, request: &Request) -> String {
    format!(
        "Request from {}: {}",
        session.pairing().display_name(),
        request.summary()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::Pairing;
    use crate::protocol::{RequestBody, SignRequest};
    use crate::session::crypto::generate_channel_secret;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingUi {
        foreground: AtomicBool,
        presented: AtomicUsize,
        alerts: AtomicUsize,
        notices: std::sync::Mutex<Vec<String>>,
    }

    impl ApprovalPresenter for CountingUi {
        fn is_foreground(&self) -> bool {
            self.foreground.load(Ordering::SeqCst)
        }

        fn present(&self, _session: &Session, _request: &Request, _message: &str) {
            self.presented.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Notifier for CountingUi {
        fn alert_authorization(&self, _session: &Session, _request: &Request, _message: &str) {
            self.alerts.fetch_add(1, Ordering::SeqCst);
        }

        fn notify(&self, _session: &Session, _request: &Request, message: &str) {
            self.notices.lock().unwrap().push(message.to_string());
        }
    }

    fn session(name: &str) -> Arc<Session> {
        let (_, public) = generate_channel_secret();
        let pairing = Pairing::new(name, public.as_bytes()).unwrap();
        Arc::new(Session::new(pairing).unwrap())
    }

    fn policy_with(ui: Arc<CountingUi>) -> Policy {
        Policy::new(PolicyConfig::default(), ui.clone(), ui)
    }

    #[test]
    fn test_default_requires_approval() {
        let policy = Policy::headless(PolicyConfig::default());
        assert!(policy.needs_user_approval("s1"));

        let relaxed = Policy::headless(PolicyConfig {
            require_approval: false,
            ..Default::default()
        });
        assert!(!relaxed.needs_user_approval("s1"));
    }

    #[test]
    fn test_allow_for_window() {
        let policy = Policy::headless(PolicyConfig::default());
        policy.allow_for("s1", Duration::from_secs(60));

        assert!(!policy.needs_user_approval("s1"));
        assert!(policy.needs_user_approval("s2"));
        assert!(policy.approved_until("s1").is_some());

        let remaining = policy.approval_time_remaining("s1").unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));

        // Window has ended two minutes from now
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert!(policy.needs_user_approval_at("s1", later));
        assert!(policy.approved_until_at("s1", later).is_none());
    }

    #[test]
    fn test_set_needs_user_approval_clears_window() {
        let policy = Policy::headless(PolicyConfig::default());
        policy.allow_for("s1", Duration::from_secs(600));
        policy.set_needs_user_approval("s1", true);

        assert!(policy.needs_user_approval("s1"));
        assert!(policy.approved_until("s1").is_none());

        policy.set_needs_user_approval("s1", false);
        assert!(!policy.needs_user_approval("s1"));
    }

    #[tokio::test]
    async fn test_resolve_delivers_decision() {
        let ui = Arc::new(CountingUi::default());
        let policy = policy_with(ui.clone());
        let s = session("alice@laptop.local");
        let request = Request::new("r1", 0, false);

        let receiver = policy.request_user_authorization(Arc::clone(&s), &request).await;
        assert_eq!(ui.alerts.load(Ordering::SeqCst), 1);
        assert_eq!(policy.pending().await.unwrap().1.id, "r1");

        assert!(!policy.resolve(s.id(), "other", ApprovalDecision::Approve).await);
        assert!(
            policy
                .resolve(s.id(), "r1", ApprovalDecision::ApproveFor(Duration::from_secs(300)))
                .await
        );
        assert_eq!(
            receiver.await.unwrap(),
            ApprovalDecision::ApproveFor(Duration::from_secs(300))
        );
        assert!(!policy.needs_user_approval(s.id()));
        assert!(policy.pending().await.is_none());

        // Second resolution is a no-op
        assert!(!policy.resolve(s.id(), "r1", ApprovalDecision::Reject).await);
    }

    #[tokio::test]
    async fn test_foreground_presents_instead_of_alerting() {
        let ui = Arc::new(CountingUi::default());
        ui.foreground.store(true, Ordering::SeqCst);
        let policy = policy_with(ui.clone());

        let _receiver = policy
            .request_user_authorization(session("laptop"), &Request::new("r1", 0, false))
            .await;
        assert_eq!(ui.presented.load(Ordering::SeqCst), 1);
        assert_eq!(ui.alerts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_newer_request_supersedes() {
        let policy = Policy::headless(PolicyConfig::default());
        let s = session("laptop");

        let first = policy
            .request_user_authorization(Arc::clone(&s), &Request::new("r1", 0, false))
            .await;
        let _second = policy
            .request_user_authorization(Arc::clone(&s), &Request::new("r2", 0, false))
            .await;

        assert_eq!(first.await.unwrap(), ApprovalDecision::Superseded);
        assert_eq!(policy.pending().await.unwrap().1.id, "r2");
    }

    #[tokio::test]
    async fn test_cancel_for_session() {
        let policy = Policy::headless(PolicyConfig::default());
        let a = session("a");
        let b = session("b");

        let receiver = policy
            .request_user_authorization(Arc::clone(&a), &Request::new("r1", 0, false))
            .await;

        policy.cancel_for_session(&b).await;
        assert!(policy.pending().await.is_some());

        // Same pairing, different channel
        let renewed = Session::new(a.pairing().clone()).unwrap();
        policy.cancel_for_session(&renewed).await;
        assert!(policy.pending().await.is_some());

        policy.cancel_for_session(&a).await;
        assert_eq!(receiver.await.unwrap(), ApprovalDecision::Cancelled);
        assert!(!policy.resolve(a.id(), "r1", ApprovalDecision::Approve).await);
    }

    #[tokio::test]
    async fn test_resolve_after_waiter_dropped() {
        let policy = Policy::headless(PolicyConfig::default());
        let s = session("laptop");

        let receiver = policy
            .request_user_authorization(Arc::clone(&s), &Request::new("r1", 0, false))
            .await;
        drop(receiver);

        assert!(
            !policy
                .resolve(s.id(), "r1", ApprovalDecision::ApproveFor(Duration::from_secs(60)))
                .await
        );
        assert!(policy.needs_user_approval(s.id()));
    }

    #[tokio::test]
    async fn test_resolve_matches_session_and_request() {
        let policy = Policy::headless(PolicyConfig::default());
        let a = session("a");
        let b = session("b");

        let receiver = policy
            .request_user_authorization(Arc::clone(&a), &Request::new("r1", 0, false))
            .await;

        // Another workstation reusing the same request id
        assert!(!policy.resolve(b.id(), "r1", ApprovalDecision::Approve).await);
        policy.withdraw(b.id(), "r1").await;
        assert!(policy.pending().await.is_some());

        assert!(policy.resolve(a.id(), "r1", ApprovalDecision::Reject).await);
        assert_eq!(receiver.await.unwrap(), ApprovalDecision::Reject);
    }

    #[tokio::test]
    async fn test_resolve_if_stale_session_cancels() {
        let policy = Policy::headless(PolicyConfig::default());
        let s = session("laptop");

        let receiver = policy
            .request_user_authorization(Arc::clone(&s), &Request::new("r1", 0, false))
            .await;

        let approved = policy
            .resolve_if(s.id(), "r1", ApprovalDecision::ApproveFor(Duration::from_secs(3600)), |_| false)
            .await;
        assert!(!approved);
        assert_eq!(receiver.await.unwrap(), ApprovalDecision::Cancelled);
        assert!(policy.needs_user_approval(s.id()));
        assert!(policy.pending().await.is_none());
    }

    #[test]
    fn test_notification_text() {
        let ui = Arc::new(CountingUi::default());
        let policy = policy_with(ui.clone());
        let s = session("alice@laptop.local");

        let sign = Request::new("r1", 0, false).with_body(RequestBody::Sign(SignRequest {
            data: vec![],
            fingerprint: vec![],
            host_auth: None,
            command: Some("git push".into()),
        }));
        policy.notify_user(&s, &sign);
        policy.notify_user(&s, &Request::new("r2", 0, false).with_body(RequestBody::Sign(SignRequest {
            data: vec![],
            fingerprint: vec![],
            host_auth: None,
            command: None,
        })));

        let notices = ui.notices.lock().unwrap();
        assert_eq!(notices[0], "Request from laptop: git push");
        assert_eq!(notices[1], "Request from laptop: SSH login");
    }
}
