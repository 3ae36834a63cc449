//! # tether-mqtt-rumqtt: rumqttc transport for tether sessions
//!
//! Implements [`tether_mqtt_session::Transport`] with [rumqttc] (MQTT 3.1.1).
//! Every connect attempt gets its own client and event loop, polled by a
//! driver task that reports the outcome on the session's [`EventBus`]:
//!
//! ```text
//! Session ──connect_session()──► RumqttTransport ──spawn──► Driver
//!    ▲                                                        │ poll()
//!    └────────── {client}#CONNECTED / #DISCONNECTED ◄─────────┘
//! ```
//!
//! Subscription, unsubscription and publish requests are queued on the live
//! client; their acknowledgements are correlated by packet id and reported as
//! `{event_id}#SUCCESS` or `{event_id}#FAILURE`. Incoming messages are
//! delivered to every subscription whose filter matches.
//!
//! ```ignore
//! let bus = EventBus::new();
//! let transport = Arc::new(RumqttTransport::new(bus.clone()));
//! let session = Session::create(bus, transport, "sensor-01", Endpoint::new("localhost", 1883), options)?;
//! session.connect(None);
//! ```
//!
//! [`EventBus`]: tether_mqtt_session::EventBus

mod driver;
pub mod error;
mod qos;
pub mod tls;
pub mod topic;
pub mod transport;

pub use error::RumqttError;
pub use tls::TlsSettings;
pub use topic::topic_matches;
pub use transport::{RumqttTransport, DEFAULT_CAPACITY};
