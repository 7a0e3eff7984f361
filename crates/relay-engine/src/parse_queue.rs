use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::warn;

use crate::event::JsonEvent;

/// An event waiting to be verified and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub event: JsonEvent,
    pub relay: String,
    /// Drop the event unless its author is in the user's network.
    pub in_network_only: bool,
}

/// Bounded buffer between socket frame handling and the parse loop. When full, the oldest
/// item is discarded.
pub struct ParseQueue {
    capacity: usize,
    items: Mutex<VecDeque<QueuedEvent>>,
}

impl ParseQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, item: QueuedEvent) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            if let Some(dropped) = items.pop_front() {
                warn!(event_id = %dropped.event.id, relay = %dropped.relay, "Parse queue full, dropping oldest event");
            }
        }
        items.push_back(item);
    }

    pub async fn pop(&self, count: usize) -> Vec<QueuedEvent> {
        let mut items = self.items.lock().await;
        let count = count.min(items.len());
        items.drain(..count).collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}
