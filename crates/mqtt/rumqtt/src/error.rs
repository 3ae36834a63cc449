//! Errors of the rumqttc adapter.
//!
//! Internal helpers return [`RumqttError`]; at the [`Transport`] boundary it is
//! converted into the session crate's [`TransportError`], which the session
//! turns into `#FAILURE`/`#DISCONNECTED` events.
//!
//! [`Transport`]: tether_mqtt_session::Transport

use tether_mqtt_session::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RumqttError {
    /// The request could not be queued on the client channel.
    ///
    /// Usually means the event loop is gone (connection closed) or the
    /// request queue is full.
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Reading certificate files failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS configuration: {0}")]
    Tls(String),

    /// The connection driver needs a tokio runtime to run on.
    #[error("No tokio runtime to drive the connection")]
    NoRuntime,
}

impl From<RumqttError> for TransportError {
    fn from(e: RumqttError) -> Self {
        match e {
            RumqttError::Client(_) | RumqttError::NoRuntime => TransportError::Request(e.to_string()),
            RumqttError::Io(_) | RumqttError::Tls(_) => TransportError::InvalidRequest(e.to_string()),
        }
    }
}
