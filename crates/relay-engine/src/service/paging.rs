use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::debug;

use super::RelayService;
use crate::event::unix_timestamp;
use crate::filter::{Filter, SubscriptionId};

/// Walks a filter backwards in time, one page per relay.
///
/// Every relay keeps its own cursor: the oldest `created_at` it has delivered so far. Loading
/// more closes the old REQ on each relay that has a cursor and replaces it with one bounded by
/// `until = cursor`; relays that delivered nothing yet keep their current subscription.
pub struct PagedSubscription {
    service: RelayService,
    filter: Filter,
    start_date: u64,
    subscriptions: Mutex<Vec<(SubscriptionId, String)>>,
}

impl PagedSubscription {
    pub(super) async fn open(service: RelayService, filter: Filter, relays: Vec<String>) -> Self {
        let start_date = unix_timestamp();
        let first_page = filter.clone().until(start_date);
        let mut subscriptions = Vec::with_capacity(relays.len());
        for relay in relays {
            let id = service.inner.manager.queue_subscription(&first_page, &relay).await;
            subscriptions.push((id, relay));
        }
        service.process_subscription_queue().await;

        Self {
            service,
            filter,
            start_date,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    pub fn start_date(&self) -> u64 {
        self.start_date
    }

    /// The subscription currently open on each relay.
    pub async fn subscription_ids(&self) -> Vec<(SubscriptionId, String)> {
        self.subscriptions.lock().await.clone()
    }

    /// Requests the next older page from every relay that has delivered events.
    pub async fn load_more(&self) {
        let manager = &self.service.inner.manager;
        let mut subscriptions = self.subscriptions.lock().await;

        let mut cursors: BTreeMap<String, u64> = BTreeMap::new();
        let mut kept = Vec::with_capacity(subscriptions.len());
        for (id, relay) in subscriptions.drain(..) {
            let cursor = manager
                .subscription(&id)
                .await
                .and_then(|subscription| subscription.oldest_event_seen_at(&relay));
            match cursor {
                Some(oldest) => {
                    // Other relays may still share the id, so only this relay's side is closed.
                    if manager.decrement_subscription_count(&id).await {
                        manager.close_relay_subscription(&id, &relay).await;
                    }
                    cursors.insert(relay, oldest);
                }
                None => kept.push((id, relay)),
            }
        }

        for (relay, until) in cursors {
            let page = self.filter.clone().until(until);
            debug!(relay = %relay, until, "Loading older page");
            let id = manager.queue_subscription(&page, &relay).await;
            kept.push((id, relay));
        }
        *subscriptions = kept;
        drop(subscriptions);

        self.service.process_subscription_queue().await;
    }

    /// Releases every subscription this pager holds.
    pub async fn close(&self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().await.drain(..).collect();
        for (id, _) in subscriptions {
            self.service.decrement_subscription_count(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nostr_sdk::prelude::Keys;

    use super::super::test_support::*;
    use super::*;
    use crate::event::EventKind;

    fn event_frame(subscription_id: &str, id: &str, created_at: u64) -> String {
        serde_json::json!([
            "EVENT",
            subscription_id,
            {"id": id, "pubkey": "abc", "created_at": created_at, "kind": 1, "tags": [], "content": "", "sig": "00"}
        ])
        .to_string()
    }

    #[tokio::test]
    async fn test_load_more_pages_each_relay_independently() {
        let service = service_with(Keys::generate(), Arc::new(RecordingAnalytics::default()));
        let manager = service.subscription_manager();
        let (_, mut one) = manager.add_socket(RELAY_ONE).await.unwrap();
        let (_, mut two) = manager.add_socket(RELAY_TWO).await.unwrap();

        let pager = service
            .open_paged_subscription(Filter::new().kinds([EventKind::Text]).limit(20))
            .await;
        let first = pager.subscription_ids().await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0, first[1].0);
        let first_id = first[0].0.clone();
        assert_eq!(drain(&mut one)[0][2]["until"], pager.start_date());
        drain(&mut two);

        service.handle_frame(RELAY_ONE, &event_frame(&first_id, "a", 300)).await;
        service.handle_frame(RELAY_ONE, &event_frame(&first_id, "b", 200)).await;

        pager.load_more().await;
        let second = pager.subscription_ids().await;
        assert_eq!(second.len(), 2);
        // Relay two delivered nothing and keeps its subscription.
        assert!(second.contains(&(first_id.clone(), RELAY_TWO.to_string())));
        let (paged_id, _) = second
            .iter()
            .find(|(_, relay)| relay == RELAY_ONE)
            .unwrap()
            .clone();
        assert_ne!(paged_id, first_id);

        let paged = manager.subscription(&paged_id).await.unwrap();
        assert_eq!(paged.filter.until, Some(200));
        let frames = drain(&mut one);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], serde_json::json!(["CLOSE", first_id]));
        assert_eq!(frames[1][0], "REQ");
        assert_eq!(frames[1][2]["until"], 200);
        assert!(drain(&mut two).is_empty());

        // Relay two still holds the shared id.
        let shared = manager.subscription(&first_id).await.unwrap();
        assert!(shared.relays[RELAY_ONE].closed);
        assert!(!shared.relays[RELAY_TWO].closed);

        pager.close().await;
        assert!(manager.all().await.is_empty());
        assert_eq!(drain(&mut one), vec![serde_json::json!(["CLOSE", paged_id])]);
        assert_eq!(drain(&mut two), vec![serde_json::json!(["CLOSE", first_id])]);
    }
}
