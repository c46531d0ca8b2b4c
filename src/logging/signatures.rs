//! Signature audit log
//!
//! Records every signing outcome in JSONL format and keeps a bounded
//! in-memory history per session for host queries.

use std::collections::{BTreeSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::protocol::UserAndHost;

/// Events kept in memory per session
pub const MAX_HISTORY_PER_SESSION: usize = 100;

/// What was signed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureKind {
    /// SSH userauth
    Ssh,
    /// Git commit or tag
    Git,
}

/// One signing outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SignatureKind,
    pub session_id: String,
    pub request_id: String,
    /// Human-readable description of the request
    pub display: String,
    /// SSH login user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// SSH server host name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Whether a signature was produced
    pub signed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignatureEvent {
    pub fn new(kind: SignatureKind, session_id: &str, request_id: &str, display: String) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            display,
            user: None,
            host: None,
            signed: false,
            error: None,
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Record the signing result
    pub fn with_outcome(mut self, error: Option<String>) -> Self {
        self.signed = error.is_none();
        self.error = error;
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit logger for signing outcomes
#[derive(Clone, Default)]
pub struct SignatureLogger {
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
    history: Arc<DashMap<String, VecDeque<SignatureEvent>>>,
}

impl SignatureLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also append events to a JSONL file
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        *self.writer.lock().await = Some(BufWriter::new(file));

        info!("Signature log initialized to {}", path.display());
        Ok(())
    }

    /// Record an event
    pub async fn log(&self, event: SignatureEvent) {
        {
            let mut history = self.history.entry(event.session_id.clone()).or_default();
            if history.len() == MAX_HISTORY_PER_SESSION {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize signature event: {}", e);
                return;
            }
        };

        let mut guard = self.writer.lock().await;
        if let Some(ref mut writer) = *guard {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write signature event: {}", e);
            }
            if let Err(e) = writer.flush() {
                error!("Failed to flush signature log: {}", e);
            }
        }
    }

    /// Events for a session, oldest first
    pub fn history(&self, session_id: &str) -> Vec<SignatureEvent> {
        self.history
            .get(session_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Distinct user/host pairs this session logged into over SSH
    pub fn known_hosts(&self, session_id: &str) -> Vec<UserAndHost> {
        let Some(events) = self.history.get(session_id) else {
            return Vec::new();
        };

        events
            .iter()
            .filter(|e| e.kind == SignatureKind::Ssh && e.signed)
            .filter_map(|e| match (&e.user, &e.host) {
                (Some(user), Some(host)) => Some(UserAndHost {
                    host: host.clone(),
                    user: user.clone(),
                }),
                _ => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Drop the in-memory history of a session
    pub fn forget(&self, session_id: &str) {
        self.history.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh(session: &str, user: &str, host: &str) -> SignatureEvent {
        SignatureEvent::new(SignatureKind::Ssh, session, "r", format!("{user}@{host}"))
            .with_user(Some(user.into()))
            .with_host(Some(host.into()))
            .with_outcome(None)
    }

    #[test]
    fn test_event_serialization() {
        let event = ssh("s1", "git", "github.com");
        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains(r#""kind":"ssh""#));
        assert!(jsonl.contains(r#""signed":true"#));
        assert!(!jsonl.contains("error"));

        let failed = SignatureEvent::new(SignatureKind::Git, "s1", "r2", "commit".into())
            .with_outcome(Some("no key".into()));
        assert!(!failed.signed);
        assert!(failed.to_jsonl().unwrap().contains("no key"));
    }

    #[tokio::test]
    async fn test_known_hosts_are_distinct_and_per_session() {
        let logger = SignatureLogger::new();
        logger.log(ssh("s1", "git", "github.com")).await;
        logger.log(ssh("s1", "git", "github.com")).await;
        logger.log(ssh("s1", "root", "box")).await;
        logger.log(ssh("s2", "alice", "other")).await;
        logger
            .log(
                SignatureEvent::new(SignatureKind::Ssh, "s1", "r", "x".into())
                    .with_user(Some("eve".into()))
                    .with_host(Some("denied".into()))
                    .with_outcome(Some("failed".into())),
            )
            .await;

        let hosts = logger.known_hosts("s1");
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains(&UserAndHost { host: "github.com".into(), user: "git".into() }));
        assert_eq!(logger.history("s1").len(), 4);

        logger.forget("s1");
        assert!(logger.known_hosts("s1").is_empty());
        assert_eq!(logger.known_hosts("s2").len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let logger = SignatureLogger::new();
        for i in 0..MAX_HISTORY_PER_SESSION + 5 {
            logger.log(ssh("s1", "git", &format!("host{i}"))).await;
        }
        let history = logger.history("s1");
        assert_eq!(history.len(), MAX_HISTORY_PER_SESSION);
        assert_eq!(history[0].host.as_deref(), Some("host5"));
    }

    #[tokio::test]
    async fn test_writes_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.jsonl");

        let logger = SignatureLogger::new();
        logger.init_file(path.clone()).await.unwrap();
        logger.log(ssh("s1", "git", "github.com")).await;
        logger.log(ssh("s1", "root", "box")).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: SignatureEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.host.as_deref(), Some("github.com"));
    }
}
