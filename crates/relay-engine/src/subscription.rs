use std::collections::BTreeMap;
use std::time::Instant;

use crate::filter::{Filter, SubscriptionId};

/// State of one relay's side of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayCursor {
    /// A `REQ` has been written to this relay's socket.
    pub requested: bool,
    /// The relay is done with this subscription (CLOSE sent, or CLOSED received).
    pub closed: bool,
    /// Oldest `created_at` delivered by this relay, used as the paging cursor.
    pub oldest_event_seen_at: Option<u64>,
}

/// Runtime state for one filter and the relays it has been queued against.
#[derive(Debug, Clone)]
pub struct RelaySubscription {
    pub filter: Filter,
    pub subscription_id: SubscriptionId,
    pub reference_count: usize,
    /// `None` while the subscription waits for admission.
    pub start_date: Option<Instant>,
    pub relays: BTreeMap<String, RelayCursor>,
}

impl RelaySubscription {
    pub fn new(filter: Filter) -> Self {
        Self {
            subscription_id: filter.id(),
            filter,
            reference_count: 0,
            start_date: None,
            relays: BTreeMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.start_date.is_some()
    }

    pub fn is_one_time(&self) -> bool {
        self.filter.is_one_time()
    }

    pub fn oldest_event_seen_at(&self, relay: &str) -> Option<u64> {
        self.relays
            .get(relay)
            .and_then(|cursor| cursor.oldest_event_seen_at)
    }

    /// Relays that were sent a `REQ` and have not been closed yet.
    pub fn open_relays(&self) -> impl Iterator<Item = &str> {
        self.relays
            .iter()
            .filter(|(_, cursor)| cursor.requested && !cursor.closed)
            .map(|(relay, _)| relay.as_str())
    }

    pub fn all_relays_closed(&self) -> bool {
        self.relays.values().all(|cursor| cursor.closed)
    }

    pub(crate) fn record_event(&mut self, relay: &str, created_at: u64) {
        if let Some(cursor) = self.relays.get_mut(relay) {
            cursor.oldest_event_seen_at = Some(match cursor.oldest_event_seen_at {
                Some(oldest) => oldest.min(created_at),
                None => created_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn test_cursor_tracks_minimum_per_relay() {
        let filter = Filter::new().kinds([EventKind::Text]);
        let mut subscription = RelaySubscription::new(filter.clone());
        subscription.relays.insert("wss://a".to_string(), RelayCursor::default());
        subscription.relays.insert("wss://b".to_string(), RelayCursor::default());

        subscription.record_event("wss://a", 50);
        subscription.record_event("wss://a", 30);
        subscription.record_event("wss://a", 40);
        subscription.record_event("wss://b", 90);
        subscription.record_event("wss://unknown", 1);

        assert_eq!(subscription.subscription_id, filter.id());
        assert_eq!(subscription.oldest_event_seen_at("wss://a"), Some(30));
        assert_eq!(subscription.oldest_event_seen_at("wss://b"), Some(90));
        assert_eq!(subscription.oldest_event_seen_at("wss://unknown"), None);
    }
}
