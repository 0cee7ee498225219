//! Internal event bus: an append-only log plus async fan-out to typed
//! handlers.
//!
//! `emit` appends to the log and enqueues the event for delivery; a single
//! spawned consumer drains the queue in FIFO order and invokes every handler
//! registered for the event's type. Handler failures and panics are isolated
//! per handler so one bad subscriber cannot stall delivery.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{Event, EventType};

/// Handlers are plain async closures keyed by event type.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct EventBus {
    log: RwLock<Vec<Event>>,
    handlers: DashMap<EventType, Vec<EventHandler>>,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Create the bus and spawn its delivery loop. Must be called from
    /// within a Tokio runtime. The loop exits once the last handle to the
    /// bus is dropped.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            log: RwLock::new(Vec::new()),
            handlers: DashMap::new(),
            tx,
        });
        tokio::spawn(Self::deliver_loop(Arc::downgrade(&bus), rx));
        bus
    }

    /// Register a handler for one event type. No ordering is guaranteed
    /// between handlers of the same event.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Append an event to the log and enqueue it for delivery.
    pub fn emit(&self, event_type: EventType, payload: Value) {
        let event = Event::new(event_type, payload);
        self.log
            .write()
            .expect("event log lock poisoned")
            .push(event.clone());
        // The delivery loop only stops when the bus itself is gone.
        let _ = self.tx.send(event);
    }

    /// Snapshot of the full append-only log.
    pub fn events(&self) -> Vec<Event> {
        self.log.read().expect("event log lock poisoned").clone()
    }

    /// Snapshot of logged events of one type, in emission order.
    pub fn events_of(&self, event_type: EventType) -> Vec<Event> {
        self.log
            .read()
            .expect("event log lock poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    async fn deliver_loop(bus: Weak<EventBus>, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            let handlers: Vec<EventHandler> = match bus.upgrade() {
                Some(bus) => bus
                    .handlers
                    .get(&event.event_type)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default(),
                None => break,
            };

            for handler in handlers {
                match AssertUnwindSafe(handler(event.clone())).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        event_type = ?event.event_type,
                        error = %e,
                        "Event handler returned an error"
                    ),
                    Err(_) => warn!(
                        event_type = ?event.event_type,
                        "Event handler panicked"
                    ),
                }
            }
        }
        debug!("Event delivery loop stopped");
    }
}
