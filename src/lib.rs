//! Silo - request authorization core for a paired signing device
//!
//! A paired workstation sends signing and administrative requests over an
//! untrusted transport. The device validates each request, gates signatures
//! on user consent and answers over the session's encrypted channel.
//!
//! ## Components
//!
//! - **Pairing**: trust record for one workstation key
//! - **Session**: encrypted channel derived from a pairing
//! - **SessionRegistry**: live sessions by id
//! - **Protocol**: request and response envelopes
//! - **ReplayGuard**: freshness window and request de-duplication
//! - **Policy**: user approval gate with time-boxed overrides
//! - **Silo**: the request orchestrator tying them together

pub mod config;
pub mod keys;
pub mod logging;
pub mod pairing;
pub mod policy;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod silo;
pub mod types;

pub use config::Args;
pub use silo::{Silo, SiloConfig, SiloContext, Transport};
pub use types::{CommunicationMedium, Result, SiloError};
