//! [`Transport`] implementation on top of rumqttc.
//!
//! Each client id owns a slot holding its endpoint and, while a connect
//! attempt or connection is alive, the rumqttc [`AsyncClient`] plus the
//! cancellation token of the [`Driver`] task polling its event loop.
//!
//! A connect attempt always starts from a fresh client and event loop: the
//! session decides when to retry, so rumqttc's own reconnect-on-poll behaviour
//! is never used.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, MqttOptions};
use tether_mqtt_session::{
    ConnectOptions, ConnectionStatus, EventBus, Message, QoS, Transport, TransportError,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    driver::{Driver, Pending},
    error::RumqttError,
    qos,
    tls::TlsSettings,
};

/// Default capacity of the rumqttc request channel.
pub const DEFAULT_CAPACITY: usize = 64;

/// A subscription filter and the event id its messages are emitted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) event_id: String,
    pub(crate) filter: String,
}

#[derive(Debug)]
struct LinkState {
    status: ConnectionStatus,
    generation: u64,
}

/// State shared between a slot and the drivers of its connect attempts.
///
/// Status writes carry the generation of the attempt that produced them, so a
/// driver that was replaced or retired cannot overwrite a newer status.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) client_id: String,
    state: Mutex<LinkState>,
    pub(crate) routes: Mutex<Vec<Route>>,
}

impl Link {
    pub(crate) fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state: Mutex::new(LinkState {
                status: ConnectionStatus::Disconnected,
                generation: 0,
            }),
            routes: Mutex::new(Vec::new()),
        }
    }

    /// Starts a new attempt and returns its generation.
    pub(crate) fn begin_attempt(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.status = ConnectionStatus::Connecting;
        state.generation
    }

    /// Marks the link disconnected and stale for every running driver.
    pub(crate) fn retire(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.status = ConnectionStatus::Disconnected;
    }

    /// Applies `status` if `generation` is still current.
    pub(crate) fn set_status(&self, generation: u64, status: ConnectionStatus) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.status = status;
        true
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }
}

struct Connection {
    client: AsyncClient,
    cancel: CancellationToken,
    pending: Arc<Mutex<Pending>>,
}

struct Slot {
    host: String,
    port: u16,
    ssl: bool,
    link: Arc<Link>,
    connection: Option<Connection>,
}

impl Slot {
    fn connection(&self) -> Result<&Connection, TransportError> {
        self.connection
            .as_ref()
            .ok_or_else(|| TransportError::NotConnected(self.link.client_id.clone()))
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
        }
    }
}

/// MQTT 3.1.1 transport backed by rumqttc.
///
/// # Examples
/// ```ignore
/// let bus = EventBus::new();
/// let transport = Arc::new(RumqttTransport::new(bus.clone()).with_tls(TlsSettings::with_ca("ca.pem")));
/// let session = Session::create(bus, transport, "c1", Endpoint::new("broker", 8883).with_ssl(true), options);
/// ```
pub struct RumqttTransport {
    bus: EventBus,
    tls: TlsSettings,
    capacity: usize,
    slots: RwLock<HashMap<String, Slot>>,
}

impl RumqttTransport {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            tls: TlsSettings::default(),
            capacity: DEFAULT_CAPACITY,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// TLS material used by sessions created with `ssl = true`.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn mqtt_options(&self, slot: &Slot, client_id: &str, options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
        let mut mqtt_options = MqttOptions::new(client_id, slot.host.as_str(), slot.port);
        mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive.into()));
        mqtt_options.set_clean_session(options.clean_session);
        if let Some(username) = &options.username {
            mqtt_options.set_credentials(username.as_str(), options.password.as_deref().unwrap_or_default());
        }
        if slot.ssl {
            mqtt_options.set_transport(self.tls.build_transport()?);
        }
        Ok(mqtt_options)
    }

    /// Routes registered for `client_id`, in registration order.
    #[cfg(test)]
    pub(crate) fn routes(&self, client_id: &str) -> Vec<Route> {
        self.slots
            .read()
            .get(client_id)
            .map(|slot| slot.link.routes.lock().clone())
            .unwrap_or_default()
    }
}

fn validate_client_id(client_id: &str) -> Result<(), TransportError> {
    // rumqttc rejects these when building the options
    if client_id.is_empty() || client_id.starts_with(' ') {
        return Err(TransportError::InvalidRequest(format!(
            "invalid client id '{client_id}'"
        )));
    }
    Ok(())
}

impl Transport for RumqttTransport {
    fn create_session(&self, client_id: &str, host: &str, port: u16, ssl: bool) -> Result<(), TransportError> {
        validate_client_id(client_id)?;
        if host.is_empty() {
            return Err(TransportError::InvalidRequest("host cannot be empty".into()));
        }

        let slot = Slot {
            host: host.to_string(),
            port,
            ssl,
            link: Arc::new(Link::new(client_id)),
            connection: None,
        };

        let previous = self.slots.write().insert(client_id.to_string(), slot);
        if let Some(mut previous) = previous {
            warn!(client_id, "Transport session replaced");
            previous.link.retire();
            previous.close();
        }

        debug!(client_id, host, port, ssl, "Transport session created");
        Ok(())
    }

    fn remove_session(&self, client_id: &str) -> Result<(), TransportError> {
        let removed = self.slots.write().remove(client_id);
        let Some(mut slot) = removed else {
            return Err(TransportError::UnknownSession(client_id.to_string()));
        };

        slot.link.retire();
        if let Some(connection) = &slot.connection {
            // best effort, the driver is cancelled right after
            let _ = connection.client.try_disconnect();
        }
        slot.close();
        debug!(client_id, "Transport session removed");
        Ok(())
    }

    fn connect_session(&self, client_id: &str, options: &ConnectOptions) -> Result<(), TransportError> {
        let runtime = Handle::try_current().map_err(|_| RumqttError::NoRuntime)?;

        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(client_id)
            .ok_or_else(|| TransportError::UnknownSession(client_id.to_string()))?;

        let mqtt_options = self.mqtt_options(slot, client_id, options)?;
        slot.close();

        let (client, event_loop) = AsyncClient::new(mqtt_options, self.capacity);
        let generation = slot.link.begin_attempt();
        let cancel = CancellationToken::new();
        let pending = Arc::new(Mutex::new(Pending::default()));

        let driver = Driver::new(
            Arc::clone(&slot.link),
            generation,
            self.bus.clone(),
            event_loop,
            Arc::clone(&pending),
            cancel.clone(),
        );
        runtime.spawn(driver.run());

        slot.connection = Some(Connection {
            client,
            cancel,
            pending,
        });

        info!(
            client_id,
            host = %slot.host,
            port = slot.port,
            ssl = slot.ssl,
            generation,
            "Connecting to MQTT broker"
        );
        Ok(())
    }

    fn disconnect_session(&self, client_id: &str) -> Result<(), TransportError> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(client_id)
            .ok_or_else(|| TransportError::UnknownSession(client_id.to_string()))?;

        let Some(connection) = &slot.connection else {
            debug!(client_id, "Disconnect without connection");
            return Ok(());
        };

        // The driver still reports DISCONNECTED once the packet is out
        slot.link.retire();
        if let Err(e) = connection.client.try_disconnect() {
            debug!(client_id, error = %e, "Disconnect could not be queued, closing");
            slot.close();
        }
        Ok(())
    }

    fn subscribe(&self, event_id: &str, client_id: &str, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let slots = self.slots.read();
        let slot = slots
            .get(client_id)
            .ok_or_else(|| TransportError::UnknownSession(client_id.to_string()))?;
        let connection = slot.connection()?;

        let mut pending = connection.pending.lock();
        connection
            .client
            .try_subscribe(topic, qos::to_rumqttc(qos))
            .map_err(RumqttError::from)?;
        pending.subscribes.push_back(event_id.to_string());

        slot.link.routes.lock().push(Route {
            event_id: event_id.to_string(),
            filter: topic.to_string(),
        });
        Ok(())
    }

    fn unsubscribe(&self, event_id: &str, client_id: &str, topic: &str) -> Result<(), TransportError> {
        let slots = self.slots.read();
        let slot = slots
            .get(client_id)
            .ok_or_else(|| TransportError::UnknownSession(client_id.to_string()))?;
        let connection = slot.connection()?;

        let mut pending = connection.pending.lock();
        connection.client.try_unsubscribe(topic).map_err(RumqttError::from)?;
        pending.unsubscribes.push_back(event_id.to_string());

        slot.link.routes.lock().retain(|route| route.filter != topic);
        Ok(())
    }

    fn publish(&self, event_id: &str, client_id: &str, message: &Message) -> Result<(), TransportError> {
        if message.topic.is_empty() || message.topic.contains(['+', '#']) {
            return Err(TransportError::InvalidRequest(format!(
                "cannot publish to topic '{}'",
                message.topic
            )));
        }

        let slots = self.slots.read();
        let slot = slots
            .get(client_id)
            .ok_or_else(|| TransportError::UnknownSession(client_id.to_string()))?;
        let connection = slot.connection()?;

        let mut pending = connection.pending.lock();
        connection
            .client
            .try_publish(
                message.topic.as_str(),
                qos::to_rumqttc(message.qos),
                message.retain,
                message.payload.to_vec(),
            )
            .map_err(RumqttError::from)?;
        pending.publishes.push_back((event_id.to_string(), message.qos));
        Ok(())
    }

    fn release(&self, event_id: &str, client_id: &str) {
        let slots = self.slots.read();
        let Some(slot) = slots.get(client_id) else {
            return;
        };
        let mut routes = slot.link.routes.lock();
        let before = routes.len();
        routes.retain(|route| route.event_id != event_id);
        if routes.len() < before {
            debug!(client_id, event_id, "Route released");
        }
    }

    fn query_status(&self, client_id: &str) -> String {
        self.slots
            .read()
            .get(client_id)
            .map(|slot| slot.link.status())
            .unwrap_or_default()
            .as_str()
            .to_string()
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values_mut() {
            slot.close();
        }
    }
}

impl fmt::Debug for RumqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        let mut ids: Vec<&String> = slots.keys().collect();
        ids.sort();
        f.debug_struct("RumqttTransport")
            .field("sessions", &ids)
            .field("capacity", &self.capacity)
            .finish()
    }
}
