//! Event bus — pub/sub over Tokio broadcast channels.
//!
//! Subscribers that lag past the channel capacity lose the oldest events;
//! lifecycle volume is small enough that in practice only `metric` events
//! are at risk, which matches their droppable contract.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::events::DeliberationEvent;

/// Broadcast channel capacity.
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to an [`EventBus`].
pub type SharedEventBus = Arc<EventBus>;

/// Event bus fanning deliberation events out to subscribers.
pub struct EventBus {
    sender: broadcast::Sender<DeliberationEvent>,
}

impl EventBus {
    /// Create a new bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this bus.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Publishing with no subscribers
    /// is not an error.
    pub fn publish(&self, event: DeliberationEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliberationEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver {
            receiver: self.subscribe(),
            filter,
        }
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter for selective subscription.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this session.
    pub session_id: Option<String>,
    /// Only events of these types.
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Filter matching all events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one session.
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Restrict to specific event types.
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Whether an event matches this filter.
    pub fn matches(&self, event: &DeliberationEvent) -> bool {
        if let Some(ref sid) = self.session_id {
            if event.session_id() != sid {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

/// Receiver that only yields events matching its filter.
///
/// Lagged skips are tolerated: dropped events are counted and skipped, and
/// the stream continues from the oldest retained event.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<DeliberationEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Receive the next matching event; `None` when the bus is closed.
    pub async fn recv(&mut self) -> Option<DeliberationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscriber lagged, continuing");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
