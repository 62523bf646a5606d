//! Event bus for item notifications
//!
//! Items publish `item_changed` and `item_updated` events here after a write
//! commits. Consumers (audit sinks, bridges, tests) subscribe per event type
//! or to everything at once.

use dashmap::DashMap;
use chrono::DateTime;
use shng_core::{Event, EventData, EventKind, Tz};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Raw event as carried on the bus
pub type RawEvent = Event<serde_json::Value>;

/// Publish/subscribe hub for item events
pub struct EventBus {
    /// Senders keyed by event kind
    listeners: DashMap<EventKind, broadcast::Sender<RawEvent>>,
    /// Sender for subscribers to all events
    match_all_sender: broadcast::Sender<RawEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to events of one kind
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<RawEvent> {
        trace!(kind = %kind, "Subscribing to event kind");
        self.listeners
            .entry(kind)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to a typed event
    pub fn subscribe_typed<T: EventData + serde::de::DeserializeOwned>(
        &self,
    ) -> TypedEventReceiver<T> {
        TypedEventReceiver::new(self.subscribe(T::KIND))
    }

    /// Subscribe to all events
    pub fn subscribe_all(&self) -> broadcast::Receiver<RawEvent> {
        self.match_all_sender.subscribe()
    }

    /// Deliver an event to its kind's subscribers and to match-all subscribers
    pub fn fire(&self, event: RawEvent) {
        debug!(kind = %event.kind, item = %event.path, "Firing event");

        if let Some(sender) = self.listeners.get(&event.kind) {
            // No active receivers is not an error
            let _ = sender.send(event.clone());
        }
        let _ = self.match_all_sender.send(event);
    }

    /// Fire a typed event stamped with the item clock time of the write
    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, time_fired: DateTime<Tz>) {
        let event = Event::typed(data, time_fired);
        let data = serde_json::to_value(&event.data).unwrap_or_default();
        self.fire(event.with_data(data));
    }

    /// Whether anybody listens for `kind`
    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        self.match_all_sender.receiver_count() > 0
            || self
                .listeners
                .get(&kind)
                .is_some_and(|s| s.receiver_count() > 0)
    }

    /// Number of event kinds with a channel
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A receiver yielding deserialized event data
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<RawEvent>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    fn new(rx: broadcast::Receiver<RawEvent>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Receive the next event whose payload deserializes as `T`
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.with_data(data));
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Result<Event<T>, broadcast::error::TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.with_data(data));
            }
        }
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
