//! Event identifiers and payloads exchanged over the [`EventBus`](crate::bus::EventBus).
//!
//! Every identifier a session listens on is built here, so the producer side
//! (the transport) and the consumer side (the session) cannot drift apart.
//! All identifiers belonging to one client share the prefix `"{client_id}#"`:
//!
//! ```text
//! {client_id}#CONNECTED
//! {client_id}#DISCONNECTED
//! {client_id}#subscribe_mqtt#{topic}#{qos}#{tag}            (messages)
//! {client_id}#subscribe_mqtt#{topic}#{qos}#{tag}#SUCCESS    (SUBACK ok)
//! {client_id}#subscribe_mqtt#{topic}#{qos}#{tag}#FAILURE    (SUBACK refused)
//! {client_id}#unsubscribe_mqtt#{topic}#{tag}[#SUCCESS|#FAILURE]
//! {client_id}#publish_mqtt#{topic}#{qos}#{tag}[#SUCCESS|#FAILURE]
//! ```
//!
//! `tag` is the per-session subscription counter, which keeps two subscriptions
//! to the same topic and QoS apart.
//!
//! A client id must be non-empty and free of `#`. Otherwise `"a"` would own
//! the prefix of `"a#b"` and tearing one session down would strip the other.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol reason code attached to disconnects and refused acknowledgements.
pub type ReasonCode = u8;

/// MQTT "Unspecified error". Used whenever a disconnect carries no usable code.
pub const UNSPECIFIED_ERROR: ReasonCode = 0x80;

const SEPARATOR: char = '#';
const CONNECTED: &str = "CONNECTED";
const DISCONNECTED: &str = "DISCONNECTED";
const SUCCESS: &str = "SUCCESS";
const FAILURE: &str = "FAILURE";

/// Whether `client_id` can head event identifiers without clashing with
/// another client's.
pub fn is_valid_client_id(client_id: &str) -> bool {
    !client_id.is_empty() && !client_id.contains(SEPARATOR)
}

/// Prefix shared by every event identifier of `client_id`.
pub fn client_prefix(client_id: &str) -> String {
    format!("{client_id}{SEPARATOR}")
}

pub fn connected(client_id: &str) -> String {
    format!("{client_id}{SEPARATOR}{CONNECTED}")
}

pub fn disconnected(client_id: &str) -> String {
    format!("{client_id}{SEPARATOR}{DISCONNECTED}")
}

/// Message channel of one subscription.
pub fn subscribe_channel(client_id: &str, topic: &str, qos: QoS, tag: u64) -> String {
    format!(
        "{client_id}{SEPARATOR}subscribe_mqtt{SEPARATOR}{topic}{SEPARATOR}{}{SEPARATOR}{tag}",
        qos.as_u8()
    )
}

pub fn unsubscribe_channel(client_id: &str, topic: &str, tag: u64) -> String {
    format!("{client_id}{SEPARATOR}unsubscribe_mqtt{SEPARATOR}{topic}{SEPARATOR}{tag}")
}

pub fn publish_channel(client_id: &str, topic: &str, qos: QoS, tag: u64) -> String {
    format!(
        "{client_id}{SEPARATOR}publish_mqtt{SEPARATOR}{topic}{SEPARATOR}{}{SEPARATOR}{tag}",
        qos.as_u8()
    )
}

/// Acknowledgement channel derived from a channel id.
pub fn success(event_id: &str) -> String {
    format!("{event_id}{SEPARATOR}{SUCCESS}")
}

/// Refusal channel derived from a channel id.
pub fn failure(event_id: &str) -> String {
    format!("{event_id}{SEPARATOR}{FAILURE}")
}

/// MQTT Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid QoS value {0}, must be 0, 1, or 2")]
pub struct InvalidQos(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// An application message, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Payload carried by every event on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The broker accepted the connection.
    Connected { session_present: bool },

    /// The connection ended or an attempt failed. `reason_code` is `None`
    /// when the transport could not name one.
    Disconnected {
        reason_code: Option<ReasonCode>,
        reason: Option<String>,
    },

    /// A message delivered on a subscription channel.
    Message(Message),

    /// Positive acknowledgement of a subscribe, unsubscribe or publish.
    Success { granted_qos: Option<QoS> },

    /// Refusal or local failure of a subscribe, unsubscribe or publish.
    Failure {
        reason_code: Option<ReasonCode>,
        reason: Option<String>,
    },
}

impl Event {
    /// Reason code carried by the event, if any.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Event::Disconnected { reason_code, .. } | Event::Failure { reason_code, .. } => {
                *reason_code
            }
            _ => None,
        }
    }
}
