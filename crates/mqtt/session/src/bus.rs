//! Publish/subscribe registry keyed by string event identifiers.
//!
//! The bus is an explicit value: construct one, clone it into every component
//! that emits or listens. Clones share the same registry.
//!
//! Delivery is synchronous. `emit` snapshots the handlers registered under the
//! identifier and invokes them in registration order after releasing the
//! registry lock, so a handler may register or remove listeners (including
//! itself) without deadlocking. A panicking handler is caught and logged; the
//! remaining handlers still run and the emitter never observes the panic.

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::RwLock;
use tracing::{error, trace};

use crate::events::Event;

/// Listener callback.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, event_id: &str, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event_id) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|listener| listener.id != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            listeners.remove(event_id);
        }
        removed
    }
}

/// Shared event registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `event_id`.
    ///
    /// The returned handle removes exactly this registration. Dropping the
    /// handle does not remove the listener.
    pub fn add_listener<F>(&self, event_id: impl Into<String>, handler: F) -> ListenerHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_handler(event_id, Arc::new(handler))
    }

    /// Registers an already shared handler.
    pub fn add_handler(&self, event_id: impl Into<String>, handler: Handler) -> ListenerHandle {
        let event_id = event_id.into();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .listeners
            .write()
            .entry(event_id.clone())
            .or_default()
            .push(Listener { id, handler });

        trace!(event_id = %event_id, listener = id, "Listener registered");

        ListenerHandle {
            registry: Arc::downgrade(&self.registry),
            event_id,
            id,
        }
    }

    /// Delivers `event` to every handler registered under `event_id` at the
    /// time of the call.
    ///
    /// # Returns
    /// The number of handlers invoked, including those that panicked.
    pub fn emit(&self, event_id: &str, event: &Event) -> usize {
        let handlers: Vec<Handler> = {
            let listeners = self.registry.listeners.read();
            match listeners.get(event_id) {
                Some(entries) => entries.iter().map(|l| Arc::clone(&l.handler)).collect(),
                None => return 0,
            }
        };

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(event_id = %event_id, "Event listener panicked, continuing delivery");
            }
        }

        handlers.len()
    }

    /// Removes every listener registered under `event_id`.
    ///
    /// # Returns
    /// The number of listeners removed.
    pub fn remove_all_listeners(&self, event_id: &str) -> usize {
        self.registry
            .listeners
            .write()
            .remove(event_id)
            .map_or(0, |entries| entries.len())
    }

    pub fn listener_count(&self, event_id: &str) -> usize {
        self.registry
            .listeners
            .read()
            .get(event_id)
            .map_or(0, Vec::len)
    }

    /// Counts listeners across all identifiers starting with `prefix`.
    pub fn listener_count_with_prefix(&self, prefix: &str) -> usize {
        self.registry
            .listeners
            .read()
            .iter()
            .filter(|(event_id, _)| event_id.starts_with(prefix))
            .map(|(_, entries)| entries.len())
            .sum()
    }

    /// Identifiers that currently have at least one listener.
    pub fn event_ids(&self) -> Vec<String> {
        self.registry.listeners.read().keys().cloned().collect()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.registry.listeners.read();
        f.debug_struct("EventBus")
            .field("event_ids", &listeners.len())
            .field(
                "listeners",
                &listeners.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

/// Removes one registration from the bus it was created on.
///
/// Removal is idempotent. The handle does not keep the bus alive.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    registry: Weak<Registry>,
    event_id: String,
    id: u64,
}

impl ListenerHandle {
    /// A handle that is not attached to any bus. `remove` is a no-op.
    pub fn detached(event_id: impl Into<String>) -> Self {
        Self {
            registry: Weak::new(),
            event_id: event_id.into(),
            id: u64::MAX,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Deregisters the listener.
    ///
    /// # Returns
    /// `true` if the listener was still registered.
    pub fn remove(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.event_id, self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn connected() -> Event {
        Event::Connected {
            session_present: false,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| {
                let log = Arc::clone(&log);
                Arc::new(move |_: &Event| log.lock().unwrap().push(name)) as Handler
            }
        };
        (log, make)
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.add_handler("a", make("first"));
        bus.add_handler("a", make("second"));
        bus.add_handler("b", make("other"));

        assert_eq!(bus.emit("a", &connected()), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = EventBus::new();
        assert_eq!(bus.emit("nobody", &connected()), 0);
    }

    #[test]
    fn test_handle_removes_only_its_listener() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = bus.add_handler("a", make("first"));
        bus.add_handler("a", make("second"));

        assert!(first.remove());
        assert!(!first.remove());
        bus.emit("a", &connected());

        assert_eq!(*log.lock().unwrap(), vec!["second"]);
        assert_eq!(bus.listener_count("a"), 1);
    }

    #[test]
    fn test_same_handler_registered_twice_is_removed_once() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let handler = make("shared");
        let first = bus.add_handler("a", Arc::clone(&handler));
        bus.add_handler("a", handler);

        first.remove();
        bus.emit("a", &connected());
        assert_eq!(*log.lock().unwrap(), vec!["shared"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.add_listener("a", |_| panic!("listener failure"));
        bus.add_handler("a", make("after"));

        assert_eq!(bus.emit("a", &connected()), 2);
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn test_listener_can_remove_itself_during_delivery() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(AtomicU64::new(0));

        let handle = {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            bus.add_listener("once", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot.lock().unwrap().take() {
                    handle.remove();
                }
            })
        };
        *slot.lock().unwrap() = Some(handle);

        bus.emit("once", &connected());
        bus.emit("once", &connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("once"), 0);
    }

    #[test]
    fn test_listener_added_during_delivery_waits_for_next_emit() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        {
            let bus_inner = bus.clone();
            let hits = Arc::clone(&hits);
            bus.add_listener("grow", move |_| {
                let hits = Arc::clone(&hits);
                bus_inner.add_listener("grow", move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        assert_eq!(bus.emit("grow", &connected()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count("grow"), 2);
    }

    #[test]
    fn test_remove_all_listeners_and_prefix_count() {
        let bus = EventBus::new();
        bus.add_listener("c1#CONNECTED", |_| {});
        bus.add_listener("c1#CONNECTED", |_| {});
        bus.add_listener("c1#DISCONNECTED", |_| {});
        bus.add_listener("c10#CONNECTED", |_| {});

        assert_eq!(bus.listener_count_with_prefix("c1#"), 3);
        assert_eq!(bus.remove_all_listeners("c1#CONNECTED"), 2);
        assert_eq!(bus.listener_count_with_prefix("c1#"), 1);
        assert_eq!(bus.listener_count("c10#CONNECTED"), 1);
        assert!(!bus.event_ids().contains(&"c1#CONNECTED".to_string()));
    }

    #[test]
    fn test_handle_outliving_bus() {
        let handle = {
            let bus = EventBus::new();
            bus.add_listener("a", |_| {})
        };
        assert!(!handle.remove());
        assert!(!ListenerHandle::detached("x").remove());
    }

    #[test]
    fn test_clones_share_registry() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.add_listener("a", |_| {});
        assert_eq!(bus.listener_count("a"), 1);
    }

    #[test]
    fn test_concurrent_registration() {
        let bus = EventBus::new();
        let threads: Vec<_> = (0..8)
            .map(|n| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let handle = bus.add_listener(format!("t{n}"), |_| {});
                        bus.add_listener("shared", |_| {});
                        handle.remove();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(bus.listener_count("shared"), 800);
        assert_eq!(bus.listener_count_with_prefix("t"), 0);
    }
}
