//! Typed publish/subscribe registry for inbound events and state changes

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tether_shared::{ConnectionState, Envelope};
use tracing::error;

/// Handler for application events
pub type EventHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handler for connection-state changes
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    events: HashMap<String, Vec<(u64, EventHandler)>>,
    any: Vec<(u64, EventHandler)>,
    state: Vec<(u64, StateHandler)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Event(String, u64),
    Any(u64),
    State(u64),
}

/// Dispatches events to registered handlers
///
/// Dispatch runs over a snapshot taken under the lock and calls handlers with
/// the lock released, so handlers may subscribe or unsubscribe freely. A
/// panicking handler is logged and the remaining handlers still run.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for one event type
    pub fn subscribe(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> Subscription {
        let event_type = event_type.into();
        let mut registry = self.registry();
        let id = registry.next_id();
        registry
            .events
            .entry(event_type.clone())
            .or_default()
            .push((id, handler));
        self.subscription(Slot::Event(event_type, id))
    }

    /// Register a handler for every forwarded event
    pub fn subscribe_any(self: &Arc<Self>, handler: EventHandler) -> Subscription {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.any.push((id, handler));
        self.subscription(Slot::Any(id))
    }

    /// Register a handler for connection-state changes
    pub fn subscribe_state(self: &Arc<Self>, handler: StateHandler) -> Subscription {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.state.push((id, handler));
        self.subscription(Slot::State(id))
    }

    fn subscription(self: &Arc<Self>, slot: Slot) -> Subscription {
        Subscription {
            bus: Arc::downgrade(self),
            slot,
        }
    }

    fn remove(&self, slot: &Slot) {
        let mut registry = self.registry();
        match slot {
            Slot::Event(event_type, id) => {
                if let Some(handlers) = registry.events.get_mut(event_type) {
                    handlers.retain(|(h, _)| h != id);
                    if handlers.is_empty() {
                        registry.events.remove(event_type);
                    }
                }
            }
            Slot::Any(id) => registry.any.retain(|(h, _)| h != id),
            Slot::State(id) => registry.state.retain(|(h, _)| h != id),
        }
    }

    /// Deliver an event to its typed handlers, then to wildcard handlers
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn emit(&self, envelope: &Envelope) -> usize {
        self.dispatch(envelope, true)
    }

    /// Deliver an event to its typed handlers only
    ///
    /// Used for lifecycle messages the application may subscribe to by name
    /// but which are not part of the wildcard stream.
    pub fn emit_typed(&self, envelope: &Envelope) -> usize {
        self.dispatch(envelope, false)
    }

    fn dispatch(&self, envelope: &Envelope, include_any: bool) -> usize {
        let snapshot: Vec<EventHandler> = {
            let registry = self.registry();
            let any: &[(u64, EventHandler)] = if include_any { &registry.any } else { &[] };
            let handlers = registry
                .events
                .get(&envelope.msg_type)
                .into_iter()
                .flatten()
                .chain(any.iter())
                .map(|(_, handler)| handler.clone())
                .collect();
            handlers
        };

        let mut delivered = 0;
        for handler in &snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(event = %envelope.msg_type, "Event handler panicked"),
            }
        }
        delivered
    }

    /// Deliver a state change to every state handler
    pub fn emit_state(&self, state: ConnectionState) -> usize {
        let snapshot: Vec<StateHandler> = self
            .registry()
            .state
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        let mut delivered = 0;
        for handler in &snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(state))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(%state, "State handler panicked"),
            }
        }
        delivered
    }

    #[cfg(test)]
    fn handler_count(&self, event_type: &str) -> usize {
        self.registry().events.get(event_type).map_or(0, Vec::len)
    }
}

/// Registration handle returned by the `subscribe*` calls
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<EventBus>,
    slot: Slot,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.slot);
        }
    }
}
