//! Connection driver: one task per connect attempt.
//!
//! The driver owns the rumqttc [`EventLoop`] of one attempt and translates what
//! it observes into bus events:
//!
//! | rumqttc                               | Bus                                  |
//! |---------------------------------------|--------------------------------------|
//! | `ConnAck` (success)                   | `{client}#CONNECTED`                 |
//! | `ConnAck` (refused), poll error       | `{client}#DISCONNECTED`, stop        |
//! | incoming `Disconnect`                 | `{client}#DISCONNECTED`, stop        |
//! | outgoing `Disconnect` (our request)   | `{client}#DISCONNECTED` (0x00), stop |
//! | `SubAck` / `UnsubAck` / `PubAck` ...  | `{event_id}#SUCCESS` / `#FAILURE`    |
//! | incoming `Publish`                    | every matching subscription event id |
//!
//! The driver never reconnects. Retry policy belongs to the session: once the
//! link is gone the driver reports it and exits.
//!
//! # Correlation
//!
//! rumqttc assigns packet ids when a request leaves the event loop, not when it
//! is queued. Requests are queued FIFO per connection (see [`Pending`]), and
//! the matching `Outgoing::{Subscribe, Unsubscribe, Publish}(pkid)` pops the
//! oldest one and binds its event id to `pkid` until the acknowledgement.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use parking_lot::Mutex;
use rumqttc::{
    ConnectReturnCode, ConnectionError, Event as MqttEvent, EventLoop, Outgoing, Packet, Publish,
    SubscribeReasonCode,
};
use tether_mqtt_session::{events, ConnectionStatus, Event, EventBus, Message, QoS, ReasonCode, UNSPECIFIED_ERROR};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{qos, topic::topic_matches, transport::Link};

/// MQTT "Normal disconnection".
const NORMAL_DISCONNECTION: ReasonCode = 0x00;

/// Requests queued on one connection, awaiting their packet id or their
/// acknowledgement.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) subscribes: VecDeque<String>,
    pub(crate) unsubscribes: VecDeque<String>,
    pub(crate) publishes: VecDeque<(String, QoS)>,
    awaiting: HashMap<u16, String>,
}

impl Pending {
    /// Every event id still waiting for an outcome.
    fn drain(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscribes.drain(..).collect();
        ids.extend(self.unsubscribes.drain(..));
        ids.extend(self.publishes.drain(..).map(|(id, _)| id));
        ids.extend(self.awaiting.drain().map(|(_, id)| id));
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Driver {
    link: Arc<Link>,
    generation: u64,
    bus: EventBus,
    event_loop: EventLoop,
    pending: Arc<Mutex<Pending>>,
    cancel: CancellationToken,
}

impl Driver {
    pub(crate) fn new(
        link: Arc<Link>,
        generation: u64,
        bus: EventBus,
        event_loop: EventLoop,
        pending: Arc<Mutex<Pending>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            generation,
            bus,
            event_loop,
            pending,
            cancel,
        }
    }

    /// Polls the event loop until the link ends or the driver is cancelled.
    pub(crate) async fn run(mut self) {
        debug!(client_id = %self.link.client_id, generation = self.generation, "Connection driver started");

        loop {
            tokio::select! {
                biased;

                // Replaced by a newer attempt or session removed
                _ = self.cancel.cancelled() => {
                    debug!(client_id = %self.link.client_id, "Connection driver cancelled");
                    break;
                }

                polled = self.event_loop.poll() => {
                    let flow = match polled {
                        Ok(event) => self.handle_event(event),
                        Err(e) => {
                            self.handle_error(&e);
                            Flow::Stop
                        }
                    };
                    if flow == Flow::Stop {
                        break;
                    }
                }
            }
        }

        self.fail_pending();
        self.link.set_status(self.generation, ConnectionStatus::Disconnected);
        debug!(client_id = %self.link.client_id, generation = self.generation, "Connection driver stopped");
    }

    pub(crate) fn handle_event(&mut self, event: MqttEvent) -> Flow {
        match event {
            MqttEvent::Incoming(packet) => match packet {
                Packet::ConnAck(conn_ack) => {
                    if conn_ack.code == ConnectReturnCode::Success {
                        self.on_connected(conn_ack.session_present);
                        Flow::Continue
                    } else {
                        self.emit_disconnected(
                            Some(connect_return_reason(conn_ack.code)),
                            format!("Connection refused: {:?}", conn_ack.code),
                        );
                        Flow::Stop
                    }
                }
                Packet::Publish(publish) => {
                    self.route(publish);
                    Flow::Continue
                }
                Packet::SubAck(sub_ack) => {
                    let outcome = match sub_ack.return_codes.first() {
                        Some(SubscribeReasonCode::Success(granted)) => Ok(Some(qos::from_rumqttc(*granted))),
                        _ => Err(UNSPECIFIED_ERROR),
                    };
                    self.acknowledge(sub_ack.pkid, outcome);
                    Flow::Continue
                }
                Packet::UnsubAck(unsub_ack) => {
                    self.acknowledge(unsub_ack.pkid, Ok(None));
                    Flow::Continue
                }
                Packet::PubAck(pub_ack) => {
                    self.acknowledge(pub_ack.pkid, Ok(None));
                    Flow::Continue
                }
                Packet::PubComp(pub_comp) => {
                    self.acknowledge(pub_comp.pkid, Ok(None));
                    Flow::Continue
                }
                Packet::Disconnect => {
                    warn!(client_id = %self.link.client_id, "Disconnected by broker");
                    self.emit_disconnected(None, "Disconnected by broker".into());
                    Flow::Stop
                }
                Packet::PingResp | Packet::PingReq => Flow::Continue,
                other => {
                    trace!(client_id = %self.link.client_id, packet = ?other, "Incoming packet");
                    Flow::Continue
                }
            },
            MqttEvent::Outgoing(outgoing) => match outgoing {
                Outgoing::Subscribe(pkid) => {
                    let event_id = self.pending.lock().subscribes.pop_front();
                    self.bind(pkid, event_id);
                    Flow::Continue
                }
                Outgoing::Unsubscribe(pkid) => {
                    let event_id = self.pending.lock().unsubscribes.pop_front();
                    self.bind(pkid, event_id);
                    Flow::Continue
                }
                Outgoing::Publish(pkid) => {
                    let queued = self.pending.lock().publishes.pop_front();
                    match queued {
                        // nothing to wait for at QoS 0
                        Some((event_id, QoS::AtMostOnce)) => self.emit_success(&event_id, None),
                        Some((event_id, _)) => self.bind(pkid, Some(event_id)),
                        None => trace!(client_id = %self.link.client_id, pkid, "Unqueued publish"),
                    }
                    Flow::Continue
                }
                Outgoing::Disconnect => {
                    info!(client_id = %self.link.client_id, "Disconnect sent");
                    self.emit_disconnected(Some(NORMAL_DISCONNECTION), "Disconnected by client".into());
                    Flow::Stop
                }
                other => {
                    trace!(client_id = %self.link.client_id, packet = ?other, "Outgoing packet");
                    Flow::Continue
                }
            },
        }
    }

    fn handle_error(&self, err: &ConnectionError) {
        if self.cancel.is_cancelled() {
            return;
        }

        let disposition = classify_connection_error(err);
        let message = get_error_message(err);
        match disposition {
            Disposition::Fatal => {
                error!(client_id = %self.link.client_id, %disposition, "Connection failed: {message}")
            }
            Disposition::Reconnect => {
                warn!(client_id = %self.link.client_id, %disposition, "Connection lost: {message}")
            }
        }
        self.emit_disconnected(Some(connection_error_reason(err)), format!("{disposition}: {message}"));
    }

    fn on_connected(&self, session_present: bool) {
        if !self.link.set_status(self.generation, ConnectionStatus::Connected) {
            // disconnect was requested while the handshake was in flight
            debug!(client_id = %self.link.client_id, "CONNACK for retired attempt not reported");
            return;
        }
        info!(client_id = %self.link.client_id, session_present, "Connection established");
        self.bus.emit(
            &events::connected(&self.link.client_id),
            &Event::Connected { session_present },
        );
    }

    fn emit_disconnected(&self, reason_code: Option<ReasonCode>, reason: String) {
        self.link.set_status(self.generation, ConnectionStatus::Disconnected);
        self.bus.emit(
            &events::disconnected(&self.link.client_id),
            &Event::Disconnected {
                reason_code,
                reason: Some(reason),
            },
        );
    }

    fn bind(&self, pkid: u16, event_id: Option<String>) {
        match event_id {
            Some(event_id) => {
                trace!(client_id = %self.link.client_id, pkid, event_id = %event_id, "Awaiting acknowledgement");
                self.pending.lock().awaiting.insert(pkid, event_id);
            }
            None => trace!(client_id = %self.link.client_id, pkid, "Request sent without event id"),
        }
    }

    fn acknowledge(&self, pkid: u16, outcome: Result<Option<QoS>, ReasonCode>) {
        let event_id = self.pending.lock().awaiting.remove(&pkid);
        let Some(event_id) = event_id else {
            trace!(client_id = %self.link.client_id, pkid, "Acknowledgement without pending request");
            return;
        };

        match outcome {
            Ok(granted_qos) => self.emit_success(&event_id, granted_qos),
            Err(code) => self.emit_failure(&event_id, code, "Refused by broker"),
        }
    }

    fn emit_success(&self, event_id: &str, granted_qos: Option<QoS>) {
        self.bus.emit(&events::success(event_id), &Event::Success { granted_qos });
    }

    fn emit_failure(&self, event_id: &str, code: ReasonCode, reason: &str) {
        self.bus.emit(
            &events::failure(event_id),
            &Event::Failure {
                reason_code: Some(code),
                reason: Some(reason.to_string()),
            },
        );
    }

    /// Delivers an incoming message to every subscription whose filter
    /// matches. Routes nobody listens on any more are dropped.
    fn route(&self, publish: Publish) {
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: qos::from_rumqttc(publish.qos),
            retain: publish.retain,
        };

        let targets: Vec<String> = self
            .link
            .routes
            .lock()
            .iter()
            .filter(|route| topic_matches(&route.filter, &message.topic))
            .map(|route| route.event_id.clone())
            .collect();

        if targets.is_empty() {
            trace!(client_id = %self.link.client_id, topic = %message.topic, "No subscription for message");
            return;
        }

        let event = Event::Message(message);
        let stale: Vec<String> = targets
            .into_iter()
            .filter(|event_id| self.bus.emit(event_id, &event) == 0)
            .collect();

        if !stale.is_empty() {
            debug!(client_id = %self.link.client_id, routes = stale.len(), "Dropping routes without listeners");
            self.link.routes.lock().retain(|route| !stale.contains(&route.event_id));
        }
    }

    fn fail_pending(&self) {
        let outstanding = self.pending.lock().drain();
        for event_id in &outstanding {
            self.emit_failure(event_id, UNSPECIFIED_ERROR, "Connection closed before acknowledgement");
        }
        if !outstanding.is_empty() {
            debug!(client_id = %self.link.client_id, requests = outstanding.len(), "Failed unacknowledged requests");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    // Error is unrecoverable, retrying with the same options makes no sense
    Fatal,
    // Error is temporary, a retry is reasonable
    Reconnect,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Fatal => f.write_str("fatal"),
            Disposition::Reconnect => f.write_str("transient"),
        }
    }
}

pub(crate) fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // Invalid certificates or incompatible crypto setup
        ConnectionError::Tls(_) => Fatal,

        // Protocol violation or corrupted client state
        ConnectionError::MqttState(_) => Fatal,

        // Broker answered the handshake with something other than CONNACK
        ConnectionError::NotConnAck(_) => Fatal,

        // The client side of the request channel is gone
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            // Local misconfiguration, not a transient condition
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            // Credentials or client id need to change first
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

/// Reason code reported for a CONNACK return code, in MQTT 5 terms.
pub(crate) fn connect_return_reason(code: ConnectReturnCode) -> ReasonCode {
    match code {
        ConnectReturnCode::Success => 0x00,
        ConnectReturnCode::RefusedProtocolVersion => 0x84,
        ConnectReturnCode::BadClientId => 0x85,
        ConnectReturnCode::ServiceUnavailable => 0x88,
        ConnectReturnCode::BadUserNamePassword => 0x86,
        ConnectReturnCode::NotAuthorized => 0x87,
    }
}

/// Reason code reported on the bus for a failed poll.
pub(crate) fn connection_error_reason(err: &ConnectionError) -> ReasonCode {
    match err {
        ConnectionError::ConnectionRefused(code) => connect_return_reason(*code),
        // Keep Alive timeout
        ConnectionError::NetworkTimeout => 0x8D,
        // Protocol error
        ConnectionError::NotConnAck(_) | ConnectionError::MqttState(_) => 0x82,
        _ => UNSPECIFIED_ERROR,
    }
}

/// Extracts the innermost message from an error chain, without quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rumqttc::{AsyncClient, ConnAck, MqttOptions, PubAck, SubAck, UnsubAck};

    use super::*;
    use crate::transport::Route;

    struct Fixture {
        bus: EventBus,
        link: Arc<Link>,
        pending: Arc<Mutex<Pending>>,
        driver: Driver,
        _client: AsyncClient,
    }

    fn fixture() -> Fixture {
        let bus = EventBus::new();
        let link = Arc::new(Link::new("c1"));
        let generation = link.begin_attempt();
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (client, event_loop) = AsyncClient::new(MqttOptions::new("c1", "localhost", 1883), 10);
        let driver = Driver::new(
            Arc::clone(&link),
            generation,
            bus.clone(),
            event_loop,
            Arc::clone(&pending),
            CancellationToken::new(),
        );
        Fixture {
            bus,
            link,
            pending,
            driver,
            _client: client,
        }
    }

    fn record(bus: &EventBus, event_id: String) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.add_listener(event_id, move |event| sink.lock().push(event.clone()));
        seen
    }

    #[tokio::test]
    async fn test_connack_success_reports_connected() {
        let mut f = fixture();
        let seen = record(&f.bus, events::connected("c1"));

        let flow = f
            .driver
            .handle_event(MqttEvent::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, true))));

        assert_eq!(flow, Flow::Continue);
        assert_eq!(*seen.lock(), vec![Event::Connected { session_present: true }]);
        assert_eq!(f.link.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_connack_for_retired_attempt_is_not_reported() {
        let mut f = fixture();
        let seen = record(&f.bus, events::connected("c1"));
        f.link.retire();

        f.driver
            .handle_event(MqttEvent::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false))));

        assert!(seen.lock().is_empty());
        assert_eq!(f.link.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connack_reports_reason_and_stops() {
        let mut f = fixture();
        let seen = record(&f.bus, events::disconnected("c1"));

        let flow = f.driver.handle_event(MqttEvent::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        ))));

        assert_eq!(flow, Flow::Stop);
        assert_eq!(seen.lock()[0].reason_code(), Some(0x87));
        assert_eq!(f.link.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_suback_correlation() {
        let mut f = fixture();
        f.pending.lock().subscribes.extend(["first".to_string(), "second".to_string()]);
        let first = record(&f.bus, events::success("first"));
        let second = record(&f.bus, events::failure("second"));

        f.driver.handle_event(MqttEvent::Outgoing(Outgoing::Subscribe(7)));
        f.driver.handle_event(MqttEvent::Outgoing(Outgoing::Subscribe(8)));
        f.driver.handle_event(MqttEvent::Incoming(Packet::SubAck(SubAck::new(
            8,
            vec![SubscribeReasonCode::Failure],
        ))));
        f.driver.handle_event(MqttEvent::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)],
        ))));

        assert_eq!(
            *first.lock(),
            vec![Event::Success {
                granted_qos: Some(QoS::AtLeastOnce)
            }]
        );
        assert_eq!(second.lock()[0].reason_code(), Some(UNSPECIFIED_ERROR));
    }

    #[tokio::test]
    async fn test_unsuback_and_puback() {
        let mut f = fixture();
        f.pending.lock().unsubscribes.push_back("unsub".into());
        f.pending.lock().publishes.push_back(("pub".into(), QoS::AtLeastOnce));
        let unsub = record(&f.bus, events::success("unsub"));
        let publish = record(&f.bus, events::success("pub"));

        f.driver.handle_event(MqttEvent::Outgoing(Outgoing::Unsubscribe(3)));
        f.driver.handle_event(MqttEvent::Outgoing(Outgoing::Publish(4)));
        assert!(publish.lock().is_empty());

        f.driver.handle_event(MqttEvent::Incoming(Packet::UnsubAck(UnsubAck::new(3))));
        f.driver.handle_event(MqttEvent::Incoming(Packet::PubAck(PubAck::new(4))));

        assert_eq!(unsub.lock().len(), 1);
        assert_eq!(publish.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_qos0_publish_succeeds_on_send() {
        let mut f = fixture();
        f.pending.lock().publishes.push_back(("fire".into(), QoS::AtMostOnce));
        let seen = record(&f.bus, events::success("fire"));

        f.driver.handle_event(MqttEvent::Outgoing(Outgoing::Publish(0)));
        assert_eq!(*seen.lock(), vec![Event::Success { granted_qos: None }]);
    }

    #[tokio::test]
    async fn test_incoming_publish_is_routed_and_stale_routes_pruned() {
        let mut f = fixture();
        f.link.routes.lock().extend([
            Route {
                event_id: "c1#subscribe_mqtt#sensors/+#1#0".into(),
                filter: "sensors/+".into(),
            },
            Route {
                event_id: "c1#subscribe_mqtt#sensors/##1#1".into(),
                filter: "sensors/#".into(),
            },
            Route {
                event_id: "c1#subscribe_mqtt#other#1#2".into(),
                filter: "other".into(),
            },
        ]);
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            f.bus.add_listener("c1#subscribe_mqtt#sensors/+#1#0", move |event| {
                if let Event::Message(message) = event {
                    assert_eq!(message.payload, "21.5");
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        f.driver.handle_event(MqttEvent::Incoming(Packet::Publish(Publish::new(
            "sensors/kitchen",
            rumqttc::QoS::AtLeastOnce,
            "21.5",
        ))));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let remaining: Vec<String> = f.link.routes.lock().iter().map(|r| r.filter.clone()).collect();
        // "sensors/#" had no listener, "other" did not match
        assert_eq!(remaining, vec!["sensors/+", "other"]);
    }

    #[tokio::test]
    async fn test_client_disconnect_is_reported_as_normal() {
        let mut f = fixture();
        let seen = record(&f.bus, events::disconnected("c1"));

        let flow = f.driver.handle_event(MqttEvent::Outgoing(Outgoing::Disconnect));
        assert_eq!(flow, Flow::Stop);
        assert_eq!(seen.lock()[0].reason_code(), Some(NORMAL_DISCONNECTION));
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_driver_stops() {
        let f = fixture();
        f.pending.lock().subscribes.push_back("sub".into());
        f.pending.lock().awaiting.insert(9, "pub".into());
        let sub = record(&f.bus, events::failure("sub"));
        let publish = record(&f.bus, events::failure("pub"));

        f.driver.fail_pending();

        assert_eq!(sub.lock().len(), 1);
        assert_eq!(publish.lock().len(), 1);
        assert!(f.pending.lock().drain().is_empty());
    }

    #[test]
    fn test_is_fatal_error_detection() {
        assert_eq!(
            classify_connection_error(&ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized)),
            Disposition::Fatal
        );
        assert_eq!(
            classify_connection_error(&ConnectionError::ConnectionRefused(
                ConnectReturnCode::ServiceUnavailable
            )),
            Disposition::Reconnect
        );
        assert_eq!(
            classify_connection_error(&ConnectionError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused
            ))),
            Disposition::Reconnect
        );
        assert_eq!(
            classify_connection_error(&ConnectionError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied
            ))),
            Disposition::Fatal
        );
        assert_eq!(classify_connection_error(&ConnectionError::NetworkTimeout), Disposition::Reconnect);
        assert_eq!(Disposition::Reconnect.to_string(), "transient");
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            connection_error_reason(&ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword)),
            0x86
        );
        assert_eq!(connection_error_reason(&ConnectionError::NetworkTimeout), 0x8D);
        assert_eq!(
            connection_error_reason(&ConnectionError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset
            ))),
            UNSPECIFIED_ERROR
        );
        assert_eq!(connect_return_reason(ConnectReturnCode::ServiceUnavailable), 0x88);
    }

    #[test]
    fn test_get_error_message_unwraps_chain() {
        let err = ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::Other, "\"boom\""));
        assert_eq!(get_error_message(&err), "boom");
    }
}
