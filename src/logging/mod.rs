//! Logging infrastructure for the silo
//!
//! Signing outcomes are recorded as an audit trail and feed host queries.

pub mod signatures;

pub use signatures::{SignatureEvent, SignatureKind, SignatureLogger};
