//! In-memory transport recording every primitive call.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    error::TransportError,
    events::{Message, QoS},
    options::ConnectOptions,
    transport::Transport,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create { client_id: String, host: String, port: u16, ssl: bool },
    Remove { client_id: String },
    Connect { client_id: String, options: ConnectOptions },
    Disconnect { client_id: String },
    Subscribe { event_id: String, topic: String, qos: QoS },
    Unsubscribe { event_id: String, topic: String },
    Publish { event_id: String, message: Message },
    Release { event_id: String },
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<(Instant, Call)>>,
    statuses: Mutex<HashMap<String, String>>,
    failing: Mutex<Vec<&'static str>>,
}

impl RecordingTransport {
    /// Makes every later call to `primitive` (e.g. `"subscribe"`) fail.
    pub(crate) fn fail(&self, primitive: &'static str) {
        self.failing.lock().push(primitive);
    }

    pub(crate) fn set_status(&self, client_id: &str, status: &str) {
        self.statuses.lock().insert(client_id.into(), status.into());
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|(_, call)| call.clone()).collect()
    }

    pub(crate) fn connects(&self) -> Vec<(Instant, ConnectOptions)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(at, call)| match call {
                Call::Connect { options, .. } => Some((*at, options.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects().len()
    }

    fn record(&self, primitive: &'static str, call: Call) -> Result<(), TransportError> {
        self.calls.lock().push((Instant::now(), call));
        if self.failing.lock().contains(&primitive) {
            return Err(TransportError::Refused {
                code: 0x87,
                message: format!("{primitive} refused"),
            });
        }
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn create_session(&self, client_id: &str, host: &str, port: u16, ssl: bool) -> Result<(), TransportError> {
        self.record(
            "create",
            Call::Create {
                client_id: client_id.into(),
                host: host.into(),
                port,
                ssl,
            },
        )
    }

    fn remove_session(&self, client_id: &str) -> Result<(), TransportError> {
        self.record("remove", Call::Remove { client_id: client_id.into() })
    }

    fn connect_session(&self, client_id: &str, options: &ConnectOptions) -> Result<(), TransportError> {
        self.record(
            "connect",
            Call::Connect {
                client_id: client_id.into(),
                options: options.clone(),
            },
        )
    }

    fn disconnect_session(&self, client_id: &str) -> Result<(), TransportError> {
        self.record("disconnect", Call::Disconnect { client_id: client_id.into() })
    }

    fn subscribe(&self, event_id: &str, _client_id: &str, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(
            "subscribe",
            Call::Subscribe {
                event_id: event_id.into(),
                topic: topic.into(),
                qos,
            },
        )
    }

    fn unsubscribe(&self, event_id: &str, _client_id: &str, topic: &str) -> Result<(), TransportError> {
        self.record(
            "unsubscribe",
            Call::Unsubscribe {
                event_id: event_id.into(),
                topic: topic.into(),
            },
        )
    }

    fn publish(&self, event_id: &str, _client_id: &str, message: &Message) -> Result<(), TransportError> {
        self.record(
            "publish",
            Call::Publish {
                event_id: event_id.into(),
                message: message.clone(),
            },
        )
    }

    fn release(&self, event_id: &str, _client_id: &str) {
        let _ = self.record("release", Call::Release { event_id: event_id.into() });
    }

    fn query_status(&self, client_id: &str) -> String {
        self.statuses
            .lock()
            .get(client_id)
            .cloned()
            .unwrap_or_else(|| "disconnected".into())
    }
}
