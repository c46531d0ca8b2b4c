//! Configuration for the silo
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use uuid::Uuid;

use crate::pairing::{Pairing, PairingOffer};
use crate::policy::PolicyConfig;
use crate::silo::SiloConfig;
use crate::types::{Result, SiloError};

/// Silo - request authorization core for a paired signing device
#[derive(Parser, Debug, Clone)]
#[command(name = "silo")]
#[command(about = "Answers signing requests from paired workstations")]
pub struct Args {
    /// Identifier for this device instance
    #[arg(long, env = "SILO_DEVICE_ID", default_value_t = Uuid::new_v4())]
    pub device_id: Uuid,

    /// File holding the hex-encoded Ed25519 seed of the signing key.
    /// A throwaway key is generated when unset.
    #[arg(long, env = "SILO_KEY_SEED_FILE")]
    pub key_seed_file: Option<PathBuf>,

    /// Paired workstation as `name=<base64 X25519 public key>` (repeatable)
    #[arg(long = "pair", env = "SILO_PAIRINGS", value_delimiter = ';')]
    pub pairings: Vec<String>,

    /// Endpoint reported to workstations (`sns_endpoint_arn`)
    #[arg(long, env = "SILO_ENDPOINT", default_value = "")]
    pub endpoint: String,

    /// Email reported in identity responses
    #[arg(long, env = "SILO_IDENTITY_EMAIL", default_value = "")]
    pub identity_email: String,

    /// PGP user ids reported in host responses (comma separated)
    #[arg(long, env = "SILO_PGP_USER_IDS", value_delimiter = ',')]
    pub pgp_user_ids: Vec<String>,

    /// Tracking id stamped on responses
    #[arg(long, env = "SILO_TRACKING_ID")]
    pub tracking_id: Option<String>,

    /// Require user approval before signing
    #[arg(long, env = "SILO_REQUIRE_APPROVAL", default_value_t = true, action = clap::ArgAction::Set)]
    pub require_approval: bool,

    /// Seconds a request waits on the user before it is rejected
    #[arg(long, env = "SILO_APPROVAL_TIMEOUT_SECS", default_value = "120")]
    pub approval_timeout_secs: u64,

    /// Length of an "allow for" approval window in seconds
    #[arg(long, env = "SILO_APPROVAL_INTERVAL_SECS", default_value = "3600")]
    pub approval_interval_secs: u64,

    /// Append signing outcomes to this JSONL file
    #[arg(long, env = "SILO_SIGNATURE_LOG")]
    pub signature_log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SILO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "SILO_LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.approval_timeout_secs == 0 {
            return Err(SiloError::Config(
                "SILO_APPROVAL_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        if self.approval_interval_secs == 0 {
            return Err(SiloError::Config(
                "SILO_APPROVAL_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        if let Some(path) = &self.key_seed_file {
            if !path.exists() {
                return Err(SiloError::Config(format!(
                    "key seed file {} does not exist",
                    path.display()
                )));
            }
        }

        self.parse_pairings()?;
        Ok(())
    }

    /// Parse `--pair` values into pairings
    pub fn parse_pairings(&self) -> Result<Vec<Pairing>> {
        self.pairings
            .iter()
            .map(|entry| {
                let (name, pk) = entry.split_once('=').ok_or_else(|| {
                    SiloError::Config(format!("pairing '{}' is not name=<public key>", entry))
                })?;
                PairingOffer {
                    pk: pk.trim().to_string(),
                    n: name.trim().to_string(),
                }
                .into_pairing()
            })
            .collect()
    }

    pub fn silo_config(&self) -> SiloConfig {
        SiloConfig {
            endpoint: self.endpoint.clone(),
            identity_email: self.identity_email.clone(),
            pgp_user_ids: self.pgp_user_ids.clone(),
            tracking_id: self.tracking_id.clone(),
            approval_timeout: Duration::from_secs(self.approval_timeout_secs),
        }
    }

    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            require_approval: self.require_approval,
            approval_interval: Duration::from_secs(self.approval_interval_secs),
        }
    }
}
