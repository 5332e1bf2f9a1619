//! # Events
//!
//! Runtimes and peers both emit named events. Handlers registered by name
//! are called synchronously from `emit`; every event is also published on a
//! broadcast channel for tasks that want to await one.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::value::Value;

pub const CONTEXT_ATTACH: &str = "context:attach";
pub const CONTEXT_DETACH: &str = "context:detach";
pub const PEER_CONNECT: &str = "peer:connect";
pub const PEER_DISCONNECT: &str = "peer:disconnect";
pub const TASK_RESULT: &str = "task:result";

/// Callback for a named event. Unsubscribing compares handlers by pointer.
pub type EventHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Wraps a closure as an [`EventHandler`].
pub fn handler(f: impl Fn(&str, &Value) + Send + Sync + 'static) -> EventHandler {
    Arc::new(f)
}

#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub data: Value,
}

pub struct EventEmitter {
    handlers: DashMap<String, Vec<EventHandler>>,
    tx: broadcast::Sender<Event>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { handlers: DashMap::new(), tx }
    }

    /// Registers `handler` for `name`. Returns true if it is the first one.
    pub fn on(&self, name: &str, handler: EventHandler) -> bool {
        let mut entry = self.handlers.entry(name.to_string()).or_default();
        entry.push(handler);
        entry.len() == 1
    }

    /// Removes `handler` from `name`. Returns true if no handler is left.
    pub fn off(&self, name: &str, handler: &EventHandler) -> bool {
        let now_empty = match self.handlers.get_mut(name) {
            Some(mut entry) => {
                entry.retain(|h| !Arc::ptr_eq(h, handler));
                entry.is_empty()
            }
            None => return true,
        };
        if now_empty {
            self.handlers.remove_if(name, |_, v| v.is_empty());
        }
        now_empty
    }

    pub fn has_listeners(&self, name: &str) -> bool {
        self.handlers.get(name).is_some_and(|v| !v.is_empty())
    }

    pub fn emit(&self, name: &str, data: Value) {
        // Handlers may subscribe or unsubscribe, so call them on a snapshot.
        let snapshot: Vec<EventHandler> = self
            .handlers
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        for h in snapshot {
            h(name, &data);
        }
        let _ = self.tx.send(Event { name: name.to_string(), data });
    }

    /// A receiver of every event emitted from now on.
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
