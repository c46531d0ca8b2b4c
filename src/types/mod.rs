//! Shared types

pub mod error;

use serde::{Deserialize, Serialize};

pub use error::{Result, SiloError};

/// Channel a response should travel back on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationMedium {
    /// Push notification relay
    RemoteNotification,
    /// Direct short-range link
    Bluetooth,
    /// Polled message queue
    Queue,
}

impl std::fmt::Display for CommunicationMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RemoteNotification => "remote_notification",
            Self::Bluetooth => "bluetooth",
            Self::Queue => "queue",
        };
        f.write_str(name)
    }
}

/// Current unix time in seconds
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
