//! Subscription, unsubscription and publish channels of a session.
//!
//! Every request gets its own event id (see [`events`](crate::events)), built
//! from the session's tag counter, so identical requests never share
//! listeners. Listeners are registered before the transport is called; a
//! transport error is reported through the request's `#FAILURE` channel.
//!
//! Subscription channels live until their handle is removed or the session is
//! removed. Unsubscribe and publish channels settle on their first
//! acknowledgement: both SUCCESS and FAILURE listeners are dropped as soon as
//! either fires.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::{
    bus::{Handler, ListenerHandle},
    error::TransportError,
    events::{self, Event, Message, QoS},
    session::{Session, SessionInner},
};

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

fn noop() -> Handler {
    Arc::new(|_: &Event| {})
}

/// Parameters of [`Session::subscribe`].
pub struct SubscribeRequest {
    topic: String,
    qos: QoS,
    on_event: MessageHandler,
    on_success: Handler,
    on_error: Handler,
}

impl SubscribeRequest {
    /// Subscribes `topic` at QoS 1, delivering each message to `on_event`.
    pub fn new<F>(topic: impl Into<String>, on_event: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Self {
            topic: topic.into(),
            qos: QoS::default(),
            on_event: Arc::new(on_event),
            on_success: noop(),
            on_error: noop(),
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Called with [`Event::Success`] when the broker grants the subscription.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_success = Arc::new(callback);
        self
    }

    /// Called with [`Event::Failure`] when the subscription is refused.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(callback);
        self
    }
}

/// Parameters of [`Session::unsubscribe`].
pub struct UnsubscribeRequest {
    topic: String,
    on_success: Handler,
    on_error: Handler,
}

impl UnsubscribeRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            on_success: noop(),
            on_error: noop(),
        }
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_success = Arc::new(callback);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(callback);
        self
    }
}

/// Parameters of [`Session::publish`].
pub struct PublishRequest {
    message: Message,
    on_success: Handler,
    on_error: Handler,
}

impl PublishRequest {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            on_success: noop(),
            on_error: noop(),
        }
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_success = Arc::new(callback);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(callback);
        self
    }
}

/// Listeners registered for one request.
///
/// [`remove`](Self::remove) detaches exactly these listeners. It never sends
/// an UNSUBSCRIBE to the broker.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    session: Weak<SessionInner>,
    event_id: String,
    topic: String,
    listeners: Vec<ListenerHandle>,
}

impl ChannelHandle {
    fn detached(topic: String) -> Self {
        Self {
            session: Weak::new(),
            event_id: String::new(),
            topic,
            listeners: Vec::new(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Detaches the listeners and lets the transport drop whatever it keeps
    /// for this channel.
    ///
    /// # Returns
    /// How many were still registered.
    pub fn remove(&self) -> usize {
        let removed = self.listeners.iter().filter(|l| l.remove()).count();
        if let Some(session) = self.session.upgrade() {
            let registered = session.state.lock().channels.remove(&self.event_id);
            if registered {
                session.transport.release(&self.event_id, &session.client_id);
            }
        }
        removed
    }
}

impl Session {
    /// Subscribes to `request.topic`.
    ///
    /// Registers the message, SUCCESS and FAILURE listeners, then asks the
    /// transport to subscribe.
    pub fn subscribe(&self, request: SubscribeRequest) -> ChannelHandle {
        let SubscribeRequest {
            topic,
            qos,
            on_event,
            on_success,
            on_error,
        } = request;
        let inner = &self.inner;

        let Some(event_id) = inner.open_channel(|tag| events::subscribe_channel(&inner.client_id, &topic, qos, tag))
        else {
            return ChannelHandle::detached(topic);
        };

        let bus = &inner.bus;
        let messages = bus.add_listener(event_id.clone(), move |event| match event {
            Event::Message(message) => on_event(message),
            other => debug!(event = ?other, "Ignoring non-message event on subscription channel"),
        });
        let success = bus.add_handler(events::success(&event_id), on_success);
        let failure = bus.add_handler(events::failure(&event_id), on_error);

        debug!(client_id = %inner.client_id, topic = %topic, %qos, event_id = %event_id, "Subscribing");
        if let Err(e) = inner.transport.subscribe(&event_id, &inner.client_id, &topic, qos) {
            inner.report_failure(&event_id, &e);
        }

        ChannelHandle {
            session: Arc::downgrade(inner),
            event_id,
            topic,
            listeners: vec![messages, success, failure],
        }
    }

    /// Unsubscribes `request.topic` on the broker.
    ///
    /// Removing the handles of earlier subscriptions to the topic is up to the
    /// caller.
    pub fn unsubscribe(&self, request: UnsubscribeRequest) -> ChannelHandle {
        let UnsubscribeRequest {
            topic,
            on_success,
            on_error,
        } = request;
        let inner = &self.inner;

        let Some(event_id) = inner.open_channel(|tag| events::unsubscribe_channel(&inner.client_id, &topic, tag))
        else {
            return ChannelHandle::detached(topic);
        };
        let listeners = inner.register_one_shot(&event_id, on_success, on_error);

        debug!(client_id = %inner.client_id, topic = %topic, event_id = %event_id, "Unsubscribing");
        if let Err(e) = inner.transport.unsubscribe(&event_id, &inner.client_id, &topic) {
            inner.report_failure(&event_id, &e);
        }

        ChannelHandle {
            session: Arc::downgrade(inner),
            event_id,
            topic,
            listeners,
        }
    }

    /// Publishes `request.message`.
    ///
    /// SUCCESS fires once the transport considers the message delivered
    /// (immediately for QoS 0, on PUBACK/PUBCOMP otherwise).
    pub fn publish(&self, request: PublishRequest) -> ChannelHandle {
        let PublishRequest {
            message,
            on_success,
            on_error,
        } = request;
        let inner = &self.inner;
        let topic = message.topic.clone();

        let Some(event_id) =
            inner.open_channel(|tag| events::publish_channel(&inner.client_id, &topic, message.qos, tag))
        else {
            return ChannelHandle::detached(topic);
        };
        let listeners = inner.register_one_shot(&event_id, on_success, on_error);

        debug!(
            client_id = %inner.client_id,
            topic = %topic,
            qos = %message.qos,
            bytes = message.payload.len(),
            "Publishing"
        );
        if let Err(e) = inner.transport.publish(&event_id, &inner.client_id, &message) {
            inner.report_failure(&event_id, &e);
        }

        ChannelHandle {
            session: Arc::downgrade(inner),
            event_id,
            topic,
            listeners,
        }
    }
}

impl SessionInner {
    /// Allocates the next tag and records the channel id built from it.
    fn open_channel(&self, build: impl FnOnce(u64) -> String) -> Option<String> {
        let mut state = self.state.lock();
        if state.removed {
            warn!(client_id = %self.client_id, "Request on removed session ignored");
            return None;
        }
        let event_id = build(state.next_tag());
        state.channels.insert(event_id.clone());
        Some(event_id)
    }

    /// SUCCESS/FAILURE listeners that detach themselves after the first
    /// acknowledgement.
    fn register_one_shot(self: &Arc<Self>, event_id: &str, on_success: Handler, on_error: Handler) -> Vec<ListenerHandle> {
        let settle = {
            let session = Arc::downgrade(self);
            let event_id = event_id.to_string();
            Arc::new(move || {
                if let Some(inner) = session.upgrade() {
                    inner.bus.remove_all_listeners(&events::success(&event_id));
                    inner.bus.remove_all_listeners(&events::failure(&event_id));
                    inner.state.lock().channels.remove(&event_id);
                }
            })
        };

        let success = {
            let settle = Arc::clone(&settle);
            self.bus.add_listener(events::success(event_id), move |event| {
                settle();
                on_success(event);
            })
        };
        let failure = self.bus.add_listener(events::failure(event_id), move |event| {
            settle();
            on_error(event);
        });

        vec![success, failure]
    }

    fn report_failure(&self, event_id: &str, error: &TransportError) {
        warn!(client_id = %self.client_id, event_id = %event_id, error = %error, "Transport request failed");
        self.bus.emit(
            &events::failure(event_id),
            &Event::Failure {
                reason_code: Some(error.reason_code()),
                reason: Some(error.to_string()),
            },
        );
    }
}
