//! Connection status of a client session.
//!
//! The session keeps a local copy of this value to drive its own decisions and
//! publishes every change on a watch channel, so application code can react to
//! transitions (e.g. resubscribing after a reconnect).
//!
//! # Examples
//!
//! ```ignore
//! use tether_mqtt_session::ConnectionStatus;
//!
//! let status: ConnectionStatus = "connected".parse()?;
//! assert!(status.is_connected());
//! println!("{status}"); // "connected"
//! ```

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of one session.
///
/// - `Disconnected` -> `Connecting` (`connect()`)
/// - `Connecting` -> `Connected` (CONNECTED event)
/// - `Connected` -> `Disconnected` (DISCONNECTED event or `disconnect()`)
/// - `Connecting` -> `Disconnected` (`disconnect()` only; failed attempts stay
///   in `Connecting` while the retry loop runs)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Initial state, and the state after an explicit `disconnect()`.
    #[default]
    Disconnected,

    /// A connect attempt (or a retry chain) is in progress.
    Connecting,

    /// The broker acknowledged the connection.
    Connected,
}

impl ConnectionStatus {
    /// Returns the identifier used on the transport boundary.
    ///
    /// # Returns
    /// One of: `"disconnected"`, `"connecting"`, `"connected"`
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transport reported a status string this crate does not know.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown connection status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ConnectionStatus {
    type Err = UnknownStatus;

    /// Case-insensitive; accepts the transport's strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            "connecting" => Ok(ConnectionStatus::Connecting),
            "connected" => Ok(ConnectionStatus::Connected),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}
