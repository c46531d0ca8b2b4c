//! Silo - answers signing requests from paired workstations
//!
//! Runs a line-oriented stdio transport: commands arrive on stdin as JSON
//! lines and sealed responses leave on stdout. Logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use silo::{
    config::Args,
    keys::{Ed25519KeyManager, KeyManager},
    logging::SignatureLogger,
    policy::{ApprovalDecision, Policy},
    session::Session,
    CommunicationMedium, Silo, SiloContext, SiloError, Transport,
};

/// How often cached responses are aged out
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Command read from stdin
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    /// Sealed request from a workstation
    Request {
        session_id: String,
        /// Base64 sealed payload
        payload: String,
        #[serde(default = "default_medium")]
        medium: CommunicationMedium,
    },
    /// User approved the pending request
    Approve {
        session_id: String,
        request_id: String,
        /// Skip prompts for the configured interval
        #[serde(default)]
        remember: bool,
    },
    /// User rejected the pending request
    Reject {
        session_id: String,
        request_id: String,
    },
    /// Unpair locally
    Remove { session_id: String },
}

fn default_medium() -> CommunicationMedium {
    CommunicationMedium::Queue
}

/// Writes sealed responses to stdout as JSON lines
struct StdoutTransport {
    out: Mutex<tokio::io::Stdout>,
}

impl StdoutTransport {
    fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }

    async fn emit(&self, value: serde_json::Value) -> std::io::Result<()> {
        let mut line = value.to_string();
        line.push('\n');
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.flush().await
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn deliver(
        &self,
        sealed: Vec<u8>,
        medium: CommunicationMedium,
        endpoint: &str,
    ) -> silo::Result<()> {
        self.emit(json!({
            "type": "response",
            "medium": medium,
            "endpoint": endpoint,
            "payload": BASE64.encode(sealed),
        }))
        .await
        .map_err(|e| SiloError::Transport(e.to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging on stderr; stdout carries the protocol
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("silo={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Silo - paired signing device");
    info!("======================================");
    info!("Device ID: {}", args.device_id);
    info!("Approval required: {}", args.require_approval);
    info!("Approval timeout: {}s", args.approval_timeout_secs);
    info!("Approval interval: {}s", args.approval_interval_secs);
    info!("======================================");

    let keys: Arc<dyn KeyManager> = match &args.key_seed_file {
        Some(path) => {
            let seed = zeroize::Zeroizing::new(std::fs::read_to_string(path)?);
            Arc::new(Ed25519KeyManager::from_seed_hex(&seed)?)
        }
        None => {
            warn!("No key seed file configured, using a throwaway signing key");
            Arc::new(Ed25519KeyManager::generate())
        }
    };
    info!("Key fingerprint: {}", hex::encode(keys.fingerprint()?));

    let signatures = SignatureLogger::new();
    if let Some(path) = &args.signature_log {
        signatures.init_file(path.clone()).await?;
    }

    let transport = Arc::new(StdoutTransport::new());
    let policy = Arc::new(Policy::headless(args.policy_config()));
    let ctx = SiloContext::new(keys, policy)
        .with_transport(transport.clone())
        .with_signatures(signatures);
    let silo = Arc::new(Silo::new(args.silo_config(), ctx));

    // Bring up one session per configured pairing and announce our half of the key exchange
    for pairing in args.parse_pairings()? {
        let session = Arc::new(Session::new(pairing)?);
        transport
            .emit(json!({
                "type": "session",
                "session_id": session.id(),
                "name": session.pairing().display_name(),
                "device_public_key": BASE64.encode(session.device_public_key()),
            }))
            .await?;
        silo.add(session, false).await;
    }
    info!("Sessions: {}", silo.registry().len());

    {
        let silo = Arc::clone(&silo);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                silo.cleanup();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => dispatch(&silo, &line).await,
                    None => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn dispatch(silo: &Arc<Silo>, line: &str) {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring unreadable command: {}", e);
            return;
        }
    };

    match command {
        Command::Request {
            session_id,
            payload,
            medium,
        } => {
            let sealed = match BASE64.decode(payload.as_bytes()) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(session_id = %session_id, "Ignoring request with bad payload: {}", e);
                    return;
                }
            };
            // Requests may wait on the user, so each runs on its own task
            let silo = Arc::clone(silo);
            tokio::spawn(async move {
                match silo.handle_sealed(&session_id, &sealed, medium).await {
                    Ok(response) => {
                        debug!(session_id = %session_id, request_id = %response.request_id, "Response delivered")
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, kind = e.kind(), "Request not answered: {}", e)
                    }
                }
            });
        }
        Command::Approve {
            session_id,
            request_id,
            remember,
        } => {
            let decision = if remember {
                ApprovalDecision::ApproveFor(silo.policy().approval_interval())
            } else {
                ApprovalDecision::Approve
            };
            if !silo.resolve(&session_id, &request_id, decision).await {
                warn!(session_id = %session_id, request_id = %request_id, "No pending approval to resolve");
            }
        }
        Command::Reject {
            session_id,
            request_id,
        } => {
            if !silo.resolve(&session_id, &request_id, ApprovalDecision::Reject).await {
                warn!(session_id = %session_id, request_id = %request_id, "No pending approval to resolve");
            }
        }
        Command::Remove { session_id } => match silo.registry().get(&session_id) {
            Some(session) => {
                silo.remove(&session).await;
            }
            None => warn!(session_id = %session_id, "Unknown session"),
        },
    }
}
