//! Publish/subscribe fan-out for core events.
//!
//! Components hold a cloned [`EventBus`] and never know who is listening.
//! Async consumers take a broadcast receiver via [`EventBus::subscribe`];
//! synchronous consumers register an [`EventSink`].

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{Event, EventPayload};

const CHANNEL_CAPACITY: usize = 1024;

/// Synchronous event consumer
pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event);
}

/// Cloneable handle to a shared event fan-out
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    sender: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                sender,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a synchronous sink
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.sender.subscribe()
    }

    /// Publish a payload to all sinks and subscribers
    pub fn publish(&self, payload: EventPayload) -> Event {
        let event = Event::new(payload);
        debug!(event = event.name(), "Publishing event");

        let sinks = self
            .inner
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks {
            sink.record(&event);
        }

        // No subscribers is fine
        let _ = self.inner.sender.send(event.clone());
        event
    }
}

/// In-memory sink that keeps every event it sees
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
