//! Interception points of the connection lifecycle.
//!
//! - The disconnect interceptor is a plain callback, invoked synchronously
//!   from the DISCONNECTED event with a classified [`DisconnectNotice`].
//! - The reconnect interceptor is asynchronous. It is awaited before every
//!   retry and every automatic reconnect, and may return an [`OptionsPatch`]
//!   (e.g. refreshed credentials) merged into the next attempt.
//!
//! A session holds at most one interceptor of each kind. Setting a new one
//! replaces the previous; a stale [`InterceptorHandle`] then removes nothing.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{events::ReasonCode, options::OptionsPatch, state::ConnectionStatus};

/// How a DISCONNECTED event relates to the session's state when it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// An attempt failed while the session was connecting.
    ConnectFailure,

    /// The session had already been disconnected by the application.
    ForceDisconnected,

    /// An established connection dropped.
    AutoDisconnected,
}

impl DisconnectKind {
    /// Classifies by the status observed when the event arrived.
    pub fn classify(previous: ConnectionStatus) -> Self {
        match previous {
            ConnectionStatus::Connecting => DisconnectKind::ConnectFailure,
            ConnectionStatus::Disconnected => DisconnectKind::ForceDisconnected,
            ConnectionStatus::Connected => DisconnectKind::AutoDisconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectKind::ConnectFailure => "connect_failure",
            DisconnectKind::ForceDisconnected => "force_disconnected",
            DisconnectKind::AutoDisconnected => "auto_disconnected",
        }
    }
}

impl fmt::Display for DisconnectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Argument of the disconnect interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub kind: DisconnectKind,
    pub reason_code: ReasonCode,
    pub reason: Option<String>,
    /// Retries already spent in the current connect cycle.
    pub retry_count: u32,
}

/// Argument of the reconnect interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectContext {
    pub client_id: String,
    /// Reason code of the last disconnect, if one was observed.
    pub reason_code: Option<ReasonCode>,
    /// Retry about to be attempted, `0` for an automatic reconnect.
    pub retry_count: u32,
}

pub type DisconnectInterceptor = Arc<dyn Fn(&DisconnectNotice) + Send + Sync>;

/// Supplies option overrides before a reconnect attempt.
///
/// Implemented for any `Fn(ReconnectContext) -> impl Future<Output =
/// Option<OptionsPatch>>`, so a closure is usually enough:
///
/// ```ignore
/// session.set_on_reconnect_interceptor(move |ctx: ReconnectContext| {
///     let vault = vault.clone();
///     async move {
///         let token = vault.fetch_token().await.ok()?;
///         Some(OptionsPatch::default().with_credentials("svc", token))
///     }
/// });
/// ```
#[async_trait]
pub trait ReconnectInterceptor: Send + Sync {
    async fn on_reconnect(&self, ctx: ReconnectContext) -> Option<OptionsPatch>;
}

#[async_trait]
impl<F, Fut> ReconnectInterceptor for F
where
    F: Fn(ReconnectContext) -> Fut + Send + Sync,
    Fut: Future<Output = Option<OptionsPatch>> + Send + 'static,
{
    async fn on_reconnect(&self, ctx: ReconnectContext) -> Option<OptionsPatch> {
        (self)(ctx).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Disconnect,
    Reconnect,
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    disconnect: Option<(u64, DisconnectInterceptor)>,
    reconnect: Option<(u64, Arc<dyn ReconnectInterceptor>)>,
}

/// Interceptor slots of one session.
#[derive(Default)]
pub(crate) struct Hooks {
    slots: Mutex<Slots>,
}

impl Hooks {
    pub(crate) fn set_disconnect(self: &Arc<Self>, interceptor: DisconnectInterceptor) -> InterceptorHandle {
        let mut slots = self.slots.lock();
        slots.next_id += 1;
        let id = slots.next_id;
        slots.disconnect = Some((id, interceptor));
        self.handle(HookKind::Disconnect, id)
    }

    pub(crate) fn set_reconnect(
        self: &Arc<Self>,
        interceptor: Arc<dyn ReconnectInterceptor>,
    ) -> InterceptorHandle {
        let mut slots = self.slots.lock();
        slots.next_id += 1;
        let id = slots.next_id;
        slots.reconnect = Some((id, interceptor));
        self.handle(HookKind::Reconnect, id)
    }

    pub(crate) fn disconnect(&self) -> Option<DisconnectInterceptor> {
        self.slots.lock().disconnect.as_ref().map(|(_, i)| Arc::clone(i))
    }

    pub(crate) fn reconnect(&self) -> Option<Arc<dyn ReconnectInterceptor>> {
        self.slots.lock().reconnect.as_ref().map(|(_, i)| Arc::clone(i))
    }

    pub(crate) fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.disconnect = None;
        slots.reconnect = None;
    }

    fn handle(self: &Arc<Self>, kind: HookKind, id: u64) -> InterceptorHandle {
        InterceptorHandle {
            hooks: Arc::downgrade(self),
            kind,
            id,
        }
    }

    fn remove(&self, kind: HookKind, id: u64) -> bool {
        let mut slots = self.slots.lock();
        let matches = match kind {
            HookKind::Disconnect => slots.disconnect.as_ref().is_some_and(|(slot, _)| *slot == id),
            HookKind::Reconnect => slots.reconnect.as_ref().is_some_and(|(slot, _)| *slot == id),
        };
        if matches {
            match kind {
                HookKind::Disconnect => slots.disconnect = None,
                HookKind::Reconnect => slots.reconnect = None,
            }
        }
        matches
    }
}

/// Removes the interceptor it was returned for, unless it was replaced since.
#[derive(Debug, Clone)]
pub struct InterceptorHandle {
    hooks: Weak<Hooks>,
    kind: HookKind,
    id: u64,
}

impl InterceptorHandle {
    pub(crate) fn detached() -> Self {
        Self {
            hooks: Weak::new(),
            kind: HookKind::Disconnect,
            id: 0,
        }
    }

    pub fn remove(&self) -> bool {
        self.hooks
            .upgrade()
            .is_some_and(|hooks| hooks.remove(self.kind, self.id))
    }
}
