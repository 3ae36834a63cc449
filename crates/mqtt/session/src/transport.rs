//! The primitives a session needs from the layer doing the actual socket I/O.
//!
//! Every call is synchronous and must return quickly: implementations queue the
//! request and report the outcome later by emitting on the
//! [`EventBus`](crate::bus::EventBus), using the identifiers built in
//! [`events`](crate::events):
//!
//! | Outcome                        | Event id                 | Payload                  |
//! |--------------------------------|--------------------------|--------------------------|
//! | connection accepted            | `{client}#CONNECTED`     | [`Event::Connected`]     |
//! | attempt failed / link dropped  | `{client}#DISCONNECTED`  | [`Event::Disconnected`]  |
//! | message on a subscription      | subscription `event_id`  | [`Event::Message`]       |
//! | request acknowledged           | `{event_id}#SUCCESS`     | [`Event::Success`]       |
//! | request refused                | `{event_id}#FAILURE`     | [`Event::Failure`]       |
//!
//! [`Event::Connected`]: crate::events::Event::Connected
//! [`Event::Disconnected`]: crate::events::Event::Disconnected
//! [`Event::Message`]: crate::events::Event::Message
//! [`Event::Success`]: crate::events::Event::Success
//! [`Event::Failure`]: crate::events::Event::Failure

use crate::{
    error::TransportError,
    events::{Message, QoS},
    options::ConnectOptions,
};

/// Transport/session layer driven by [`Session`](crate::session::Session).
pub trait Transport: Send + Sync {
    /// Allocates transport state for `client_id`. Does not connect.
    fn create_session(
        &self,
        client_id: &str,
        host: &str,
        port: u16,
        ssl: bool,
    ) -> Result<(), TransportError>;

    /// Tears down everything held for `client_id`, closing any connection.
    fn remove_session(&self, client_id: &str) -> Result<(), TransportError>;

    /// Starts one connect attempt. The outcome arrives as CONNECTED or
    /// DISCONNECTED.
    fn connect_session(&self, client_id: &str, options: &ConnectOptions) -> Result<(), TransportError>;

    fn disconnect_session(&self, client_id: &str) -> Result<(), TransportError>;

    /// Subscribes `topic`; messages are emitted under `event_id`.
    fn subscribe(&self, event_id: &str, client_id: &str, topic: &str, qos: QoS) -> Result<(), TransportError>;

    fn unsubscribe(&self, event_id: &str, client_id: &str, topic: &str) -> Result<(), TransportError>;

    fn publish(&self, event_id: &str, client_id: &str, message: &Message) -> Result<(), TransportError>;

    /// Called once the listeners of channel `event_id` are detached. Any
    /// routing state kept for it can go; nothing is sent to the broker.
    fn release(&self, _event_id: &str, _client_id: &str) {}

    /// Live status as seen by the transport: `"connected"`, `"connecting"` or
    /// `"disconnected"`.
    fn query_status(&self, client_id: &str) -> String;
}
