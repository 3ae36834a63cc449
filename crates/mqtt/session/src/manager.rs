//! Composition root for sessions sharing one bus and one transport.
//!
//! The manager is the entry point for applications running more than one
//! client against the same transport. It:
//! 1. Owns the [`EventBus`] the transport emits on
//! 2. Creates sessions, replacing any previous session with the same id
//! 3. Tears sessions down individually or all at once
//!
//! # Typical Usage
//!
//! ```ignore
//! let bus = EventBus::new();
//! let transport = Arc::new(RumqttTransport::new(bus.clone()));
//! let manager = SessionManager::new(bus, transport);
//!
//! let session = manager
//!     .create_session("sensor-01", "mqtt.example.com", 8883, true, options)
//!     .ok_or("invalid endpoint")?;
//! session.connect(None);
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    bus::EventBus,
    options::SessionOptions,
    session::{Endpoint, Session},
    transport::Transport,
};

pub struct SessionManager {
    /// Bus shared by the transport and every session
    bus: EventBus,

    /// Transport every session is created on
    transport: Arc<dyn Transport>,

    /// Live sessions by client id
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// Creates a manager.
    ///
    /// # Arguments
    /// - `bus`: the bus `transport` emits its events on
    /// - `transport`: transport shared by all sessions
    pub fn new(bus: EventBus, transport: Arc<dyn Transport>) -> Self {
        Self {
            bus,
            transport,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a session for `client_id` against `host:port`.
    ///
    /// An existing session with the same id is removed first, so its listeners
    /// and transport state never leak into the new one.
    ///
    /// # Returns
    /// `None` when the host is empty or the client id is not usable in event ids.
    pub fn create_session(
        &self,
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        ssl: bool,
        options: SessionOptions,
    ) -> Option<Session> {
        let client_id = client_id.into();
        let endpoint = Endpoint::new(host, port).with_ssl(ssl);

        let previous = self.sessions.write().remove(&client_id);
        if let Some(previous) = previous {
            info!(client_id = %client_id, "Replacing existing session");
            previous.remove();
        }

        let session = Session::create(
            self.bus.clone(),
            Arc::clone(&self.transport),
            client_id.clone(),
            endpoint,
            options,
        )?;
        self.sessions.write().insert(client_id, session.clone());
        Some(session)
    }

    pub fn get(&self, client_id: &str) -> Option<Session> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Removes and tears down the session of `client_id`.
    ///
    /// # Returns
    /// `false` if no such session existed.
    pub fn remove(&self, client_id: &str) -> bool {
        let session = self.sessions.write().remove(client_id);
        match session {
            Some(session) => {
                session.remove();
                true
            }
            None => {
                debug!(client_id = %client_id, "No session to remove");
                false
            }
        }
    }

    /// Client ids of live sessions, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Removes every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Session> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.remove();
        }
        info!(sessions = sessions.len(), "Session manager shut down");
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.client_ids())
            .field("bus", &self.bus)
            .finish()
    }
}
