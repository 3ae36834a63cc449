use thiserror::Error;

use crate::events::{ReasonCode, UNSPECIFIED_ERROR};

/// Failure of a transport primitive.
///
/// The session never returns these to its caller. They are logged and turned
/// into synthetic `#FAILURE` or `#DISCONNECTED` events.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No transport session for client {0}")]
    UnknownSession(String),

    #[error("Client {0} is not connected")]
    NotConnected(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport request failed: {0}")]
    Request(String),

    #[error("Refused with reason code {code:#04x}: {message}")]
    Refused { code: ReasonCode, message: String },
}

impl TransportError {
    /// Reason code reported on the bus for this failure.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            TransportError::Refused { code, .. } => *code,
            _ => UNSPECIFIED_ERROR,
        }
    }
}
