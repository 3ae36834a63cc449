//! # tether-mqtt-session: MQTT connection lifecycle over an event bus
//!
//! This crate manages the client side of MQTT connections without speaking the
//! protocol itself. A pluggable [`Transport`] does the socket and packet work;
//! this crate decides *when* to connect, retry, resubscribe and give up, and
//! routes the transport's asynchronous events to the right listeners.
//!
//! - **Connection state machine** with exponential backoff and jitter
//! - **Interception points** to refresh credentials between attempts
//! - **Per-request event channels** that never leak or duplicate listeners
//! - **Status watch channel** for application supervisors
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_mqtt_session::{Endpoint, EventBus, OptionsPatch, Session, SessionOptions, SubscribeRequest};
//!
//! let bus = EventBus::new();
//! let transport = Arc::new(MyTransport::new(bus.clone()));
//!
//! let session = Session::create(
//!     bus,
//!     transport,
//!     "sensor-01",
//!     Endpoint::new("mqtt.example.com", 1883),
//!     SessionOptions { retry_count: Some(5), backoff_time: 500, ..Default::default() },
//! )
//! .expect("host must not be empty");
//!
//! session.set_on_reconnect_interceptor(|_ctx| async {
//!     Some(OptionsPatch::default().with_credentials("svc", fetch_token().await))
//! });
//! session.connect(None);
//!
//! let handle = session.subscribe(SubscribeRequest::new("sensors/+/temp", |msg| {
//!     println!("{}: {:?}", msg.topic, msg.payload);
//! }));
//! // later
//! handle.remove();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │     Application                      │
//! │ Session / SessionManager             │
//! └──────┬──────────────────────▲────────┘
//!        │ primitives           │ events
//! ┌──────▼──────────┐    ┌──────┴────────┐
//! │   Transport     │───►│   EventBus    │
//! │ (e.g. rumqttc)  │    │ {client}#...  │
//! └─────────────────┘    └───────────────┘
//! ```
//!
//! The transport never calls the session directly. It emits
//! `{client}#CONNECTED`, `{client}#DISCONNECTED`, message events and
//! `#SUCCESS`/`#FAILURE` acknowledgements on the bus; the session and the
//! application listen there. See [`events`] for the identifier layout.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──(CONNECTED)──> Connected
//!                              │     ▲                       │
//!                 (no CONNECTED│     │retry: backoff,        │(DISCONNECTED)
//!                  in time)    └─────┘interceptor            ▼
//!                                                       Disconnected
//!                                              (auto_reconnect: connect())
//! ```
//!
//! # Runtime
//!
//! Retries and interceptors run as tokio tasks, so sessions must be driven from
//! within a tokio runtime.

pub mod backoff;
pub mod bus;
pub mod channel;
pub mod error;
pub mod events;
pub mod hooks;
pub mod manager;
pub mod options;
pub mod session;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{compute_delay, compute_delay_with, Backoff};
pub use bus::{EventBus, Handler, ListenerHandle};
pub use channel::{ChannelHandle, MessageHandler, PublishRequest, SubscribeRequest, UnsubscribeRequest};
pub use error::TransportError;
pub use events::{Event, Message, QoS, ReasonCode, UNSPECIFIED_ERROR};
pub use hooks::{
    DisconnectKind, DisconnectNotice, InterceptorHandle, ReconnectContext, ReconnectInterceptor,
};
pub use manager::SessionManager;
pub use options::{ConnectOptions, OptionsPatch, SessionOptions};
pub use session::{Endpoint, Session};
pub use state::ConnectionStatus;
pub use transport::Transport;
