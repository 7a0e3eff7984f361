use tracing::debug;

use super::{PagedSubscription, RelayService};
use crate::event::EventKind;
use crate::filter::{Filter, SubscriptionId};

impl RelayService {
    /// Queues `filter` on every given relay (the user's relays when `None`) and runs an
    /// admission cycle. Admission itself may happen later, when a slot frees up.
    ///
    /// Each returned id must eventually be handed back to
    /// [`RelayService::decrement_subscription_count`].
    pub async fn open_subscriptions(
        &self,
        filter: &Filter,
        relays: Option<&[String]>,
    ) -> Vec<SubscriptionId> {
        let relays = match relays {
            Some(relays) => relays.to_vec(),
            None => self.relay_addresses(),
        };
        let mut ids = Vec::with_capacity(relays.len());
        for relay in &relays {
            ids.push(self.inner.manager.queue_subscription(filter, relay).await);
        }
        debug!(subscription_id = %filter.id(), relays = relays.len(), "Queued subscription");
        self.process_subscription_queue().await;
        ids
    }

    /// Releases one reference. Returns false once the subscription has been closed.
    pub async fn decrement_subscription_count(&self, id: &str) -> bool {
        self.inner.manager.decrement_subscription_count(id).await
    }

    /// Asks every user relay once for the event with this id.
    pub async fn request_event(&self, event_id: &str) -> Vec<SubscriptionId> {
        let filter = Filter::new().ids([event_id]).limit(1);
        self.open_subscriptions(&filter, None).await
    }

    /// Asks for the newest version of a parameterized replaceable event.
    pub async fn request_replaceable_event(
        &self,
        author: &str,
        kind: EventKind,
        d_tag: &str,
    ) -> Vec<SubscriptionId> {
        let filter = Filter::new()
            .authors([author])
            .kinds([kind])
            .d_tags([d_tag])
            .limit(1);
        self.open_subscriptions(&filter, None).await
    }

    /// Asks for the author's profile, optionally only if newer than `since`.
    pub async fn request_metadata(&self, author: &str, since: Option<u64>) -> Vec<SubscriptionId> {
        self.request_latest(author, EventKind::Metadata, since).await
    }

    pub async fn request_contact_list(
        &self,
        author: &str,
        since: Option<u64>,
    ) -> Vec<SubscriptionId> {
        self.request_latest(author, EventKind::ContactList, since).await
    }

    async fn request_latest(
        &self,
        author: &str,
        kind: EventKind,
        since: Option<u64>,
    ) -> Vec<SubscriptionId> {
        let mut filter = Filter::new().authors([author]).kinds([kind]).limit(1);
        if let Some(since) = since {
            filter = filter.since(since);
        }
        self.open_subscriptions(&filter, None).await
    }

    /// Opens a backwards-paging subscription over the user's relays.
    pub async fn open_paged_subscription(&self, filter: Filter) -> PagedSubscription {
        PagedSubscription::open(self.clone(), filter, self.relay_addresses()).await
    }
}
