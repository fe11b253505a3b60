//! Event dispatch.
//!
//! The controller only knows the [`EventDispatcher`] seam. Two
//! implementations are provided:
//! - [`EventBus`] - registry of handler closures, called in registration order
//! - [`ChannelDispatcher`] - forwards events into an unbounded mpsc channel
//!
//! # Example
//!
//! ```
//! use wasession::events::{Event, EventBus, EventDispatcher};
//!
//! let bus = EventBus::new();
//! let id = bus.add_handler(|event| {
//!     if let Event::Connected = event {
//!         // ...
//!     }
//! });
//! bus.dispatch(Event::Connected);
//! assert!(bus.remove_handler(id));
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;

use super::Event;

/// Receives lifecycle events. Fire-and-forget; must not block.
pub trait EventDispatcher: Send + Sync + 'static {
    /// Deliver one event.
    fn dispatch(&self, event: Event);
}

/// Boxed event handler.
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync + 'static>;

/// Registry of event handlers.
pub struct EventBus {
    handlers: RwLock<Vec<(u32, EventHandler)>>,
    next_id: AtomicU32,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a handler and return its id.
    pub fn add_handler<F>(&self, handler: F) -> u32
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if the id was not registered.
    pub fn remove_handler(&self, id: u32) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher for EventBus {
    fn dispatch(&self, event: Event) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        if handlers.is_empty() {
            tracing::debug!("No handlers for {} event", event.name());
        }
        for (_, handler) in handlers.iter() {
            handler(&event);
        }
    }
}

/// Dispatcher that forwards events into a channel.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventDispatcher for ChannelDispatcher {
    fn dispatch(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!("Dropping {} event, receiver is gone", e.0.name());
        }
    }
}
