//! Keeps the configured subscriptions alive across reconnects.
//!
//! The broker forgets subscriptions of a clean session when the link drops.
//! The [`Supervisor`] watches the session's status channel and, on every
//! transition to [`ConnectionStatus::Connected`], drops the listeners of the
//! previous round and subscribes each configured topic again, so handlers
//! never pile up.

use std::sync::Arc;

use tether_mqtt_session::{ChannelHandle, ConnectionStatus, Event, Message, MessageHandler, Session, SubscribeRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::session::SubscriptionConfig;

/// Default message handler: logs the payload, as JSON when it parses.
pub fn log_message(message: &Message) {
    match serde_json::from_slice::<serde_json::Value>(&message.payload) {
        Ok(json) => info!(
            topic = %message.topic,
            qos = %message.qos,
            retain = message.retain,
            payload = %json,
            "Message received"
        ),
        Err(_) => info!(
            topic = %message.topic,
            qos = %message.qos,
            retain = message.retain,
            bytes = message.payload.len(),
            payload = %String::from_utf8_lossy(&message.payload),
            "Message received"
        ),
    }
}

pub struct Supervisor {
    session: Session,
    subscriptions: Vec<SubscriptionConfig>,
    on_message: MessageHandler,
    handles: Vec<ChannelHandle>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(session: Session, subscriptions: Vec<SubscriptionConfig>, cancel: CancellationToken) -> Self {
        Self {
            session,
            subscriptions,
            on_message: Arc::new(log_message),
            handles: Vec::new(),
            cancel,
        }
    }

    pub fn with_message_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_message = Arc::new(handler);
        self
    }

    /// Handles of the current round of subscriptions.
    pub fn active_subscriptions(&self) -> &[ChannelHandle] {
        &self.handles
    }

    /// Replaces the previous round of subscriptions with a fresh one.
    ///
    /// # Returns
    /// How many stale listeners were detached.
    pub fn resubscribe(&mut self) -> usize {
        let detached = self.clear();

        for subscription in &self.subscriptions {
            let topic = subscription.topic.clone();
            let on_message = Arc::clone(&self.on_message);
            let request = SubscribeRequest::new(topic.clone(), move |message| on_message(message))
                .qos(subscription.qos)
                .on_success({
                    let topic = topic.clone();
                    move |event| {
                        if let Event::Success { granted_qos } = event {
                            info!(topic = %topic, granted_qos = ?granted_qos, "Subscribed");
                        }
                    }
                })
                .on_error(move |event| {
                    warn!(topic = %topic, reason_code = ?event.reason_code(), "Subscription refused");
                });
            self.handles.push(self.session.subscribe(request));
        }

        debug!(
            client_id = %self.session.client_id(),
            topics = self.handles.len(),
            detached,
            "Subscriptions renewed"
        );
        detached
    }

    fn clear(&mut self) -> usize {
        self.handles.drain(..).map(|handle| handle.remove()).sum()
    }

    /// Runs until cancelled. Subscriptions are dropped on exit.
    pub async fn run(mut self) {
        let mut status_rx = self.session.subscribe_status();
        info!(client_id = %self.session.client_id(), "Supervisor started");

        let initial = *status_rx.borrow_and_update();
        if initial.is_connected() {
            info!("Already connected when supervisor started");
            self.resubscribe();
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Supervisor shutting down due to cancellation");
                    break;
                }

                changed = status_rx.changed() => {
                    if changed.is_err() {
                        warn!("Status channel closed, supervisor exiting");
                        break;
                    }

                    let status = *status_rx.borrow_and_update();
                    match status {
                        ConnectionStatus::Connected => {
                            self.resubscribe();
                        }
                        ConnectionStatus::Disconnected => {
                            warn!(
                                client_id = %self.session.client_id(),
                                reason_code = ?self.session.last_disconnect_reason_code(),
                                "Session disconnected"
                            );
                        }
                        ConnectionStatus::Connecting => {
                            debug!(
                                client_id = %self.session.client_id(),
                                retry_count = self.session.retry_count(),
                                "Session connecting"
                            );
                        }
                    }
                }
            }
        }

        self.clear();
        info!("Supervisor stopped");
    }
}
