//! Connection lifecycle of one MQTT client.
//!
//! A [`Session`] owns the status of one client id, drives connect attempts
//! through the [`Transport`], and reacts to the CONNECTED/DISCONNECTED events
//! the transport emits on the [`EventBus`].
//!
//! # Retry loop
//!
//! After every transport connect the session schedules a re-check, as long as
//! `retry_count` is set and not yet spent:
//!
//! ```text
//! connect() ── transport.connect ── sleep(delay(1)) ── still connecting?
//!                                                         │ yes
//!                         retry += 1, await reconnect interceptor, merge patch
//!                                                         │
//!                             transport.connect ── sleep(delay(2)) ── ...
//! ```
//!
//! A CONNECTED event ends the chain. So does any later `connect()`,
//! `disconnect()` or `remove()`: each bumps the session generation, and timers
//! or interceptor tasks started under an older generation discard their result.
//!
//! # Locking
//!
//! State lives behind one short-lived mutex. It is never held across an
//! `.await`, a transport call, a bus emit or a user callback.

use std::{
    collections::HashSet,
    fmt,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    bus::{EventBus, ListenerHandle},
    events::{self, Event, ReasonCode, UNSPECIFIED_ERROR},
    hooks::{
        DisconnectKind, DisconnectNotice, Hooks, InterceptorHandle, ReconnectContext,
        ReconnectInterceptor,
    },
    options::{OptionsPatch, SessionOptions},
    state::ConnectionStatus,
    transport::Transport,
};

/// Broker address of a session. Immutable once the session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ssl: false,
        }
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.ssl { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

pub(crate) struct SessionState {
    pub(crate) options: Arc<SessionOptions>,
    pub(crate) status: ConnectionStatus,
    pub(crate) retry_count: u32,
    pub(crate) last_reason_code: Option<ReasonCode>,
    pub(crate) retry_timer: Option<JoinHandle<()>>,
    pub(crate) generation: u64,
    pub(crate) subscription_tag: u64,
    /// Subscription, unsubscription and publish channel ids still registered.
    pub(crate) channels: HashSet<String>,
    pub(crate) removed: bool,
}

impl SessionState {
    fn new(options: SessionOptions) -> Self {
        Self {
            options: Arc::new(options),
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            last_reason_code: None,
            retry_timer: None,
            generation: 0,
            subscription_tag: 0,
            channels: HashSet::new(),
            removed: false,
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Starts a new generation; pending timers and interceptor tasks go stale.
    fn invalidate(&mut self) {
        self.generation += 1;
        self.cancel_retry_timer();
    }

    pub(crate) fn next_tag(&mut self) -> u64 {
        let tag = self.subscription_tag;
        self.subscription_tag += 1;
        tag
    }
}

pub(crate) struct SessionInner {
    pub(crate) client_id: String,
    pub(crate) endpoint: Endpoint,
    pub(crate) bus: EventBus,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: Mutex<SessionState>,
    hooks: Arc<Hooks>,
    status_tx: watch::Sender<ConnectionStatus>,
    lifecycle: Mutex<Vec<ListenerHandle>>,
}

/// Handle to one client session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Creates the transport session for `client_id` and starts listening for
    /// its lifecycle events. Does not connect.
    ///
    /// # Returns
    /// `None` (with a warning) when the endpoint has an empty host, or when
    /// `client_id` is empty or contains `#`.
    pub fn create(
        bus: EventBus,
        transport: Arc<dyn Transport>,
        client_id: impl Into<String>,
        endpoint: Endpoint,
        options: SessionOptions,
    ) -> Option<Self> {
        let client_id = client_id.into();
        if !events::is_valid_client_id(&client_id) {
            warn!(client_id = %client_id, "Refusing to create session with empty client id or one containing '#'");
            return None;
        }
        if endpoint.host.is_empty() {
            warn!(client_id = %client_id, "Refusing to create session without host");
            return None;
        }

        if let Err(e) = transport.create_session(&client_id, &endpoint.host, endpoint.port, endpoint.ssl) {
            warn!(client_id = %client_id, error = %e, "Transport failed to create session");
        }

        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let inner = Arc::new(SessionInner {
            client_id,
            endpoint,
            bus,
            transport,
            state: Mutex::new(SessionState::new(options)),
            hooks: Arc::new(Hooks::default()),
            status_tx,
            lifecycle: Mutex::new(Vec::with_capacity(2)),
        });
        SessionInner::attach(&inner);

        debug!(client_id = %inner.client_id, endpoint = %inner.endpoint, "Session created");
        Some(Self { inner })
    }

    /// Starts a new connect cycle.
    ///
    /// Cancels any pending retry, resets the retry counter, merges `overrides`
    /// into the option snapshot and hands the result to the transport. Calling
    /// it again while connecting restarts the cycle.
    pub fn connect(&self, overrides: Option<OptionsPatch>) {
        let inner = &self.inner;
        let (generation, options) = {
            let mut state = inner.state.lock();
            if state.removed {
                warn!(client_id = %inner.client_id, "connect() on removed session ignored");
                return;
            }
            state.invalidate();
            state.retry_count = 0;
            if let Some(patch) = overrides.as_ref() {
                state.options = Arc::new(state.options.merged(patch));
            }
            state.status = ConnectionStatus::Connecting;
            (state.generation, Arc::clone(&state.options))
        };

        inner.publish_status(ConnectionStatus::Connecting);
        info!(client_id = %inner.client_id, endpoint = %inner.endpoint, "Connecting");
        inner.attempt(generation, &options);
    }

    /// Marks the session disconnected, stops any retry chain and asks the
    /// transport to close the connection.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.removed {
                warn!(client_id = %inner.client_id, "disconnect() on removed session ignored");
                return;
            }
            state.invalidate();
            state.status = ConnectionStatus::Disconnected;
        }

        inner.publish_status(ConnectionStatus::Disconnected);
        info!(client_id = %inner.client_id, "Disconnecting");
        if let Err(e) = inner.transport.disconnect_session(&inner.client_id) {
            warn!(client_id = %inner.client_id, error = %e, "Transport failed to disconnect");
        }
    }

    /// Tears the session down.
    ///
    /// Removes the transport session and every bus registration scoped to this
    /// client: lifecycle listeners, on-connect callbacks and all subscription,
    /// unsubscription and publish channels. Interceptors are dropped. Any later
    /// call on this session is logged and ignored.
    pub fn remove(&self) {
        let inner = &self.inner;
        let channels = {
            let mut state = inner.state.lock();
            if state.removed {
                warn!(client_id = %inner.client_id, "Session already removed");
                return;
            }
            state.removed = true;
            state.invalidate();
            state.status = ConnectionStatus::Disconnected;
            std::mem::take(&mut state.channels)
        };

        inner.publish_status(ConnectionStatus::Disconnected);
        if let Err(e) = inner.transport.remove_session(&inner.client_id) {
            warn!(client_id = %inner.client_id, error = %e, "Transport failed to remove session");
        }

        let bus = &inner.bus;
        let mut detached = bus.remove_all_listeners(&events::connected(&inner.client_id))
            + bus.remove_all_listeners(&events::disconnected(&inner.client_id));
        for channel in &channels {
            detached += bus.remove_all_listeners(channel)
                + bus.remove_all_listeners(&events::success(channel))
                + bus.remove_all_listeners(&events::failure(channel));
        }
        inner.lifecycle.lock().clear();
        inner.hooks.clear();

        info!(client_id = %inner.client_id, listeners = detached, "Session removed");
    }

    /// Registers `callback` for every CONNECTED event of this client.
    ///
    /// Runs after the session has already switched to
    /// [`ConnectionStatus::Connected`].
    pub fn set_on_connect_callback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let event_id = events::connected(&self.inner.client_id);
        if self.is_removed() {
            warn!(client_id = %self.inner.client_id, "Callback on removed session ignored");
            return ListenerHandle::detached(event_id);
        }
        self.inner.bus.add_listener(event_id, callback)
    }

    /// Sets the callback told about every DISCONNECTED event, replacing any
    /// previous one.
    pub fn set_on_disconnect_interceptor<F>(&self, interceptor: F) -> InterceptorHandle
    where
        F: Fn(&DisconnectNotice) + Send + Sync + 'static,
    {
        if self.is_removed() {
            warn!(client_id = %self.inner.client_id, "Interceptor on removed session ignored");
            return InterceptorHandle::detached();
        }
        self.inner.hooks.set_disconnect(Arc::new(interceptor))
    }

    /// Sets the interceptor awaited before every retry and automatic
    /// reconnect, replacing any previous one.
    pub fn set_on_reconnect_interceptor<I>(&self, interceptor: I) -> InterceptorHandle
    where
        I: ReconnectInterceptor + 'static,
    {
        if self.is_removed() {
            warn!(client_id = %self.inner.client_id, "Interceptor on removed session ignored");
            return InterceptorHandle::detached();
        }
        self.inner.hooks.set_reconnect(Arc::new(interceptor))
    }

    /// Live status reported by the transport.
    ///
    /// Falls back to [`local_status`](Self::local_status) when the transport
    /// answers with something unknown.
    pub fn get_connection_status(&self) -> ConnectionStatus {
        let reported = self.inner.transport.query_status(&self.inner.client_id);
        reported.parse().unwrap_or_else(|e| {
            warn!(client_id = %self.inner.client_id, error = %e, "Transport reported unknown status");
            self.local_status()
        })
    }

    /// Status as tracked by this session.
    pub fn local_status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Receiver notified on every local status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Current option snapshot.
    pub fn options(&self) -> Arc<SessionOptions> {
        Arc::clone(&self.inner.state.lock().options)
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry_count
    }

    pub fn last_disconnect_reason_code(&self) -> Option<ReasonCode> {
        self.inner.state.lock().last_reason_code
    }

    /// Whether a retry timer is armed.
    pub fn has_pending_retry(&self) -> bool {
        self.inner
            .state
            .lock()
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub fn is_removed(&self) -> bool {
        self.inner.state.lock().removed
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("client_id", &self.inner.client_id)
            .field("endpoint", &self.inner.endpoint)
            .field("status", &state.status)
            .field("retry_count", &state.retry_count)
            .field("removed", &state.removed)
            .finish()
    }
}

impl SessionInner {
    /// Registers the lifecycle listeners. They hold a weak reference so the
    /// bus does not keep the session alive.
    fn attach(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let connected = this.bus.add_listener(events::connected(&this.client_id), move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connected(event);
            }
        });

        let weak = Arc::downgrade(this);
        let disconnected = this.bus.add_listener(events::disconnected(&this.client_id), move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_disconnected(event);
            }
        });

        this.lifecycle.lock().extend([connected, disconnected]);
    }

    fn on_connected(&self, event: &Event) {
        {
            let mut state = self.state.lock();
            if state.removed {
                debug!(client_id = %self.client_id, "CONNECTED after removal ignored");
                return;
            }
            state.status = ConnectionStatus::Connected;
            state.retry_count = 0;
            state.last_reason_code = None;
            state.cancel_retry_timer();
        }

        self.publish_status(ConnectionStatus::Connected);
        let session_present = matches!(event, Event::Connected { session_present: true });
        info!(client_id = %self.client_id, session_present, "Connected");
    }

    fn on_disconnected(self: &Arc<Self>, event: &Event) {
        let (reason_code, reason) = match event {
            Event::Disconnected { reason_code, reason } => (*reason_code, reason.clone()),
            other => {
                warn!(client_id = %self.client_id, event = ?other, "Unexpected DISCONNECTED payload");
                (None, None)
            }
        };
        let mut reason_code = reason_code.unwrap_or(UNSPECIFIED_ERROR);

        let (previous, retry_count, auto_reconnect, generation) = {
            let mut state = self.state.lock();
            if state.removed {
                return;
            }
            let previous = state.status;
            state.last_reason_code = Some(reason_code);
            if previous.is_connected() {
                state.status = ConnectionStatus::Disconnected;
            }
            (
                previous,
                state.retry_count,
                state.options.auto_reconnect,
                state.generation,
            )
        };

        let kind = DisconnectKind::classify(previous);
        match kind {
            DisconnectKind::ConnectFailure => warn!(
                client_id = %self.client_id,
                reason_code,
                reason = reason.as_deref().unwrap_or(""),
                retry_count,
                "Connection attempt failed"
            ),
            DisconnectKind::AutoDisconnected => {
                self.publish_status(ConnectionStatus::Disconnected);
                warn!(
                    client_id = %self.client_id,
                    reason_code,
                    reason = reason.as_deref().unwrap_or(""),
                    "Connection lost"
                );
            }
            DisconnectKind::ForceDisconnected => {
                debug!(client_id = %self.client_id, reason_code, "Disconnect confirmed")
            }
        }

        if let Some(interceptor) = self.hooks.disconnect() {
            let notice = DisconnectNotice {
                kind,
                reason_code,
                reason,
                retry_count,
            };
            if catch_unwind(AssertUnwindSafe(|| interceptor(&notice))).is_err() {
                error!(client_id = %self.client_id, "Disconnect interceptor panicked, using default reason code");
                reason_code = UNSPECIFIED_ERROR;
                self.state.lock().last_reason_code = Some(reason_code);
            }
        }

        if auto_reconnect && previous.is_connected() {
            self.reconnect_automatically(reason_code, generation);
        }
    }

    fn reconnect_automatically(self: &Arc<Self>, reason_code: ReasonCode, generation: u64) {
        let inner = Arc::clone(self);
        spawn(async move {
            let patch = inner.ask_reconnect_interceptor(Some(reason_code), 0).await;
            if inner.state.lock().generation != generation {
                debug!(client_id = %inner.client_id, "Automatic reconnect superseded");
                return;
            }
            info!(client_id = %inner.client_id, reason_code, "Reconnecting automatically");
            Session { inner }.connect(patch);
        });
    }

    /// One transport connect, followed by scheduling the re-check.
    fn attempt(self: &Arc<Self>, generation: u64, options: &SessionOptions) {
        if let Err(e) = self.transport.connect_session(&self.client_id, &options.connect_options()) {
            warn!(client_id = %self.client_id, error = %e, "Transport rejected connect");
            self.bus.emit(
                &events::disconnected(&self.client_id),
                &Event::Disconnected {
                    reason_code: Some(e.reason_code()),
                    reason: Some(e.to_string()),
                },
            );
        }
        self.schedule_retry(generation);
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation || !state.status.is_connecting() {
            return;
        }
        let Some(limit) = state.options.retry_count else {
            return;
        };
        if state.retry_count >= limit {
            warn!(client_id = %self.client_id, retries = state.retry_count, "Retry budget exhausted");
            return;
        }

        let attempt = state.retry_count + 1;
        let delay = Backoff::from_options(&state.options).delay_for(attempt);
        debug!(
            client_id = %self.client_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling connection re-check"
        );

        let inner = Arc::clone(self);
        state.cancel_retry_timer();
        state.retry_timer = spawn(async move {
            tokio::time::sleep(delay).await;
            inner.retry(generation).await;
        });
    }

    async fn retry(self: Arc<Self>, generation: u64) {
        let (attempt, reason_code) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            // this task's own handle
            state.retry_timer = None;
            if state.status.is_connected() {
                debug!(client_id = %self.client_id, "Connected during backoff");
                return;
            }
            if !state.status.is_connecting() {
                return;
            }
            state.retry_count += 1;
            (state.retry_count, state.last_reason_code)
        };

        let patch = self.ask_reconnect_interceptor(reason_code, attempt).await;

        let options = {
            let mut state = self.state.lock();
            if state.generation != generation || !state.status.is_connecting() {
                debug!(client_id = %self.client_id, attempt, "Retry superseded while awaiting interceptor");
                return;
            }
            if let Some(patch) = patch.as_ref() {
                state.options = Arc::new(state.options.merged(patch));
            }
            Arc::clone(&state.options)
        };

        info!(
            client_id = %self.client_id,
            attempt,
            max_retries = ?options.retry_count,
            "Retrying connection"
        );
        self.attempt(generation, &options);
    }

    async fn ask_reconnect_interceptor(
        &self,
        reason_code: Option<ReasonCode>,
        retry_count: u32,
    ) -> Option<OptionsPatch> {
        let interceptor = self.hooks.reconnect()?;
        let ctx = ReconnectContext {
            client_id: self.client_id.clone(),
            reason_code,
            retry_count,
        };

        match AssertUnwindSafe(interceptor.on_reconnect(ctx)).catch_unwind().await {
            Ok(patch) => patch,
            Err(_) => {
                error!(client_id = %self.client_id, "Reconnect interceptor panicked, keeping current options");
                None
            }
        }
    }

    fn publish_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for handle in self.lifecycle.get_mut().drain(..) {
            handle.remove();
        }
    }
}

fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            error!("No tokio runtime, background task not started");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::time::{sleep, Instant};

    use super::*;
    use crate::testing::{Call, RecordingTransport};

    fn setup(options: SessionOptions) -> (EventBus, Arc<RecordingTransport>, Session) {
        let bus = EventBus::new();
        let transport = Arc::new(RecordingTransport::default());
        let session = Session::create(
            bus.clone(),
            transport.clone(),
            "c1",
            Endpoint::new("broker", 1883),
            options,
        )
        .unwrap();
        (bus, transport, session)
    }

    fn retrying(retries: u32) -> SessionOptions {
        SessionOptions {
            retry_count: Some(retries),
            backoff_time: 100,
            max_backoff_time: 10_000,
            jitter: false,
            ..Default::default()
        }
    }

    fn emit_connected(bus: &EventBus) {
        bus.emit(
            &events::connected("c1"),
            &Event::Connected {
                session_present: false,
            },
        );
    }

    fn emit_disconnected(bus: &EventBus, reason_code: Option<ReasonCode>) {
        bus.emit(
            &events::disconnected("c1"),
            &Event::Disconnected {
                reason_code,
                reason: None,
            },
        );
    }

    fn notices(session: &Session) -> Arc<Mutex<Vec<DisconnectNotice>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.set_on_disconnect_interceptor(move |notice| sink.lock().push(notice.clone()));
        seen
    }

    #[tokio::test]
    async fn test_create_rejects_empty_host() {
        let transport = Arc::new(RecordingTransport::default());
        let session = Session::create(
            EventBus::new(),
            transport.clone(),
            "c1",
            Endpoint::new("", 1883),
            SessionOptions::default(),
        );
        assert!(session.is_none());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unusable_client_ids() {
        let bus = EventBus::new();
        let transport = Arc::new(RecordingTransport::default());
        let neighbour = Session::create(
            bus.clone(),
            transport.clone(),
            "a",
            Endpoint::new("broker", 1883),
            SessionOptions::default(),
        )
        .unwrap();

        for client_id in ["a#b", ""] {
            let session = Session::create(
                bus.clone(),
                transport.clone(),
                client_id,
                Endpoint::new("broker", 1883),
                SessionOptions::default(),
            );
            assert!(session.is_none());
        }

        assert_eq!(transport.calls().len(), 1);
        assert_eq!(bus.listener_count_with_prefix(&events::client_prefix("a")), 2);
        assert!(!neighbour.is_removed());
    }

    #[tokio::test]
    async fn test_create_registers_transport_session() {
        let (bus, transport, session) = setup(SessionOptions::default());
        assert_eq!(
            transport.calls(),
            vec![Call::Create {
                client_id: "c1".into(),
                host: "broker".into(),
                port: 1883,
                ssl: false,
            }]
        );
        assert_eq!(session.local_status(), ConnectionStatus::Disconnected);
        assert_eq!(bus.listener_count_with_prefix("c1#"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_connect_retries_with_backoff() {
        let (_bus, transport, session) = setup(retrying(3));
        let start = Instant::now();

        session.connect(None);
        sleep(Duration::from_secs(5)).await;

        let offsets: Vec<u128> = transport
            .connects()
            .iter()
            .map(|(at, _)| at.duration_since(start).as_millis())
            .collect();
        assert_eq!(offsets, vec![0, 100, 300, 700]);
        assert_eq!(session.retry_count(), 3);
        assert_eq!(session.local_status(), ConnectionStatus::Connecting);
        assert!(!session.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_without_retry_count() {
        let (_bus, transport, session) = setup(SessionOptions::default());
        session.connect(None);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_count(), 1);
        assert!(!session.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_retry_chain() {
        let (_bus, transport, session) = setup(retrying(3));

        session.connect(None);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(session.retry_count(), 1);

        let restart = Instant::now();
        session.connect(None);
        assert_eq!(session.retry_count(), 0);

        sleep(Duration::from_secs(5)).await;
        let after_restart: Vec<u128> = transport
            .connects()
            .iter()
            .filter(|(at, _)| *at >= restart)
            .map(|(at, _)| at.duration_since(restart).as_millis())
            .collect();
        // one chain only: the restart plus three retries
        assert_eq!(after_restart, vec![0, 100, 300, 700]);
        assert_eq!(transport.connect_count(), 2 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_stops_retries() {
        let (bus, transport, session) = setup(retrying(5));
        let mut status = session.subscribe_status();

        session.connect(None);
        sleep(Duration::from_millis(150)).await;
        emit_connected(&bus);

        assert_eq!(session.local_status(), ConnectionStatus::Connected);
        assert_eq!(session.retry_count(), 0);
        assert!(!session.has_pending_retry());
        assert_eq!(session.last_disconnect_reason_code(), None);
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Connected);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_consults_interceptor_with_last_reason() {
        let (bus, transport, session) = setup(retrying(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            session.set_on_reconnect_interceptor(move |ctx: ReconnectContext| {
                seen.lock().push(ctx.clone());
                async move {
                    sleep(Duration::from_millis(50)).await;
                    Some(OptionsPatch::default().with_credentials("svc", "fresh"))
                }
            });
        }

        session.connect(None);
        emit_disconnected(&bus, Some(0x86));
        sleep(Duration::from_secs(1)).await;

        let ctx = seen.lock().clone();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].reason_code, Some(0x86));
        assert_eq!(ctx[0].retry_count, 1);

        let connects = transport.connects();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1].1.password.as_deref(), Some("fresh"));
        assert_eq!(session.options().username.as_deref(), Some("svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_interceptor_pending_drops_retry() {
        let (_bus, transport, session) = setup(retrying(3));
        session.set_on_reconnect_interceptor(|_ctx: ReconnectContext| async {
            sleep(Duration::from_millis(500)).await;
            None::<OptionsPatch>
        });

        session.connect(None);
        sleep(Duration::from_millis(200)).await;
        session.disconnect();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(session.local_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_classification() {
        let (bus, _transport, session) = setup(SessionOptions::default());
        let seen = notices(&session);

        session.connect(None);
        emit_disconnected(&bus, Some(0x05));
        emit_connected(&bus);
        emit_disconnected(&bus, Some(0x8E));
        session.disconnect();
        emit_disconnected(&bus, None);

        let kinds: Vec<(DisconnectKind, ReasonCode)> =
            seen.lock().iter().map(|n| (n.kind, n.reason_code)).collect();
        assert_eq!(
            kinds,
            vec![
                (DisconnectKind::ConnectFailure, 0x05),
                (DisconnectKind::AutoDisconnected, 0x8E),
                (DisconnectKind::ForceDisconnected, UNSPECIFIED_ERROR),
            ]
        );
        assert_eq!(session.local_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_connecting() {
        let (bus, _transport, session) = setup(SessionOptions::default());
        session.connect(None);
        emit_disconnected(&bus, Some(0x87));
        assert_eq!(session.local_status(), ConnectionStatus::Connecting);
        assert_eq!(session.last_disconnect_reason_code(), Some(0x87));
    }

    #[tokio::test]
    async fn test_panicking_disconnect_interceptor_falls_back_to_default_code() {
        let (bus, _transport, session) = setup(SessionOptions::default());
        session.set_on_disconnect_interceptor(|_| panic!("interceptor failure"));

        session.connect(None);
        emit_disconnected(&bus, Some(0x87));
        assert_eq!(session.last_disconnect_reason_code(), Some(UNSPECIFIED_ERROR));
    }

    #[tokio::test]
    async fn test_auto_reconnect_uses_interceptor_options() {
        let options = SessionOptions {
            auto_reconnect: true,
            ..Default::default()
        };
        let (bus, transport, session) = setup(options);
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = Arc::clone(&reasons);
            session.set_on_reconnect_interceptor(move |ctx: ReconnectContext| {
                reasons.lock().push(ctx.reason_code);
                async { Some(OptionsPatch::default().with_keep_alive(15)) }
            });
        }

        session.connect(None);
        emit_connected(&bus);
        emit_disconnected(&bus, Some(0x8B));

        let mut status = session.subscribe_status();
        status
            .wait_for(|s| s.is_connecting())
            .await
            .unwrap();

        assert_eq!(*reasons.lock(), vec![Some(0x8B)]);
        let connects = transport.connects();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[1].1.keep_alive, 15);
        assert_eq!(session.options().keep_alive, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_after_retry_budget_is_spent() {
        let options = SessionOptions {
            auto_reconnect: true,
            ..retrying(1)
        };
        let (bus, transport, session) = setup(options);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            session.set_on_reconnect_interceptor(move |ctx: ReconnectContext| {
                seen.lock().push((ctx.reason_code, ctx.retry_count));
                async { None }
            });
        }

        session.connect(None);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(session.retry_count(), 1);
        assert!(!session.has_pending_retry());

        emit_connected(&bus);
        seen.lock().clear();
        let dropped_at = Instant::now();
        emit_disconnected(&bus, Some(0x8E));

        let mut status = session.subscribe_status();
        status.wait_for(|s| s.is_connecting()).await.unwrap();

        assert_eq!(*seen.lock(), vec![(Some(0x8E), 0)]);
        let connects = transport.connects();
        assert_eq!(connects.len(), 3);
        assert_eq!(connects[2].0, dropped_at);
        assert_eq!(session.retry_count(), 0);
        assert!(session.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_only_from_connected() {
        let options = SessionOptions {
            auto_reconnect: true,
            ..Default::default()
        };
        let (bus, transport, session) = setup(options);

        session.connect(None);
        emit_disconnected(&bus, Some(0x80));
        session.disconnect();
        emit_disconnected(&bus, Some(0x80));
        sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_connect_error_becomes_disconnected_event() {
        let (_bus, transport, session) = setup(SessionOptions::default());
        transport.fail("connect");
        let seen = notices(&session);

        session.connect(None);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, DisconnectKind::ConnectFailure);
        assert_eq!(seen[0].reason_code, 0x87);
    }

    #[tokio::test]
    async fn test_on_connect_callback_sees_connected_status() {
        let (bus, _transport, session) = setup(SessionOptions::default());
        let observed = Arc::new(Mutex::new(None));
        let handle = {
            let observed = Arc::clone(&observed);
            let probe = session.clone();
            session.set_on_connect_callback(move |_| *observed.lock() = Some(probe.local_status()))
        };

        session.connect(None);
        emit_connected(&bus);
        assert_eq!(*observed.lock(), Some(ConnectionStatus::Connected));

        assert!(handle.remove());
        assert_eq!(bus.listener_count(&events::connected("c1")), 1);
    }

    #[tokio::test]
    async fn test_remove_is_final() {
        let (bus, transport, session) = setup(SessionOptions::default());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            session.set_on_connect_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        session.remove();
        assert!(session.is_removed());
        assert_eq!(bus.listener_count_with_prefix("c1#"), 0);

        emit_connected(&bus);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.local_status(), ConnectionStatus::Disconnected);

        session.connect(None);
        session.remove();
        assert_eq!(transport.connect_count(), 0);
        assert!(transport.calls().contains(&Call::Remove { client_id: "c1".into() }));
    }

    #[tokio::test]
    async fn test_status_query_delegates_to_transport() {
        let (_bus, transport, session) = setup(SessionOptions::default());
        transport.set_status("c1", "connected");
        assert_eq!(session.get_connection_status(), ConnectionStatus::Connected);
        assert_eq!(session.local_status(), ConnectionStatus::Disconnected);

        transport.set_status("c1", "bogus");
        assert_eq!(session.get_connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_dropping_last_handle_detaches_lifecycle_listeners() {
        let (bus, _transport, session) = setup(SessionOptions::default());
        drop(session);
        assert_eq!(bus.listener_count_with_prefix("c1#"), 0);
    }
}
