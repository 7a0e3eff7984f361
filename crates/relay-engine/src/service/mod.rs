//! The relay service: socket pool, timers, parse loop and the public engine operations.

mod dispatch;
mod fetch;
mod paging;
mod publish;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nostr_sdk::prelude::Keys;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analytics::{Analytics, TracingAnalytics};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::nip05::Nip05Client;
use crate::parse_queue::{ParseQueue, QueuedEvent};
use crate::processor::EventProcessor;
use crate::relay_metadata::RelayMetadataClient;
use crate::signer::{EventSigner, KeysSigner};
use crate::social_graph::SocialGraphCache;
use crate::socket::{parse_relay_url, spawn_connection, SocketEvent};
use crate::store::Store;
use crate::subscription_manager::SubscriptionManager;

pub use paging::PagedSubscription;

struct Inner {
    config: EngineConfig,
    keys: Keys,
    user_key: String,
    store: Store,
    processor: EventProcessor,
    manager: SubscriptionManager,
    parse_queue: ParseQueue,
    social_graph: Arc<SocialGraphCache>,
    signer: Arc<dyn EventSigner>,
    analytics: Arc<dyn Analytics>,
    metadata_client: RelayMetadataClient,
    nip05: Nip05Client,
    socket_events: mpsc::UnboundedSender<SocketEvent>,
    socket_events_rx: Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

/// One engine per signed-in session. Cloning is cheap and shares the engine.
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<Inner>,
}

impl RelayService {
    /// Builds a service that signs locally and reports to the log. Must be called inside a
    /// tokio runtime.
    pub fn new(config: EngineConfig, keys: Keys, store: Store) -> Result<Self, Error> {
        Self::with_collaborators(
            config,
            keys,
            store,
            Arc::new(KeysSigner),
            Arc::new(TracingAnalytics),
        )
    }

    pub fn with_collaborators(
        config: EngineConfig,
        keys: Keys,
        store: Store,
        signer: Arc<dyn EventSigner>,
        analytics: Arc<dyn Analytics>,
    ) -> Result<Self, Error> {
        let user_key = keys.public_key().to_hex();
        let social_graph = SocialGraphCache::new(store.clone(), user_key.clone())?;
        let http = reqwest::Client::builder()
            .timeout(config.socket_timeout)
            .build()?;
        let (socket_events, socket_events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                manager: SubscriptionManager::new(config.admission()),
                parse_queue: ParseQueue::new(config.parse_queue_capacity),
                processor: EventProcessor::new(store.clone()),
                metadata_client: RelayMetadataClient::new(http.clone()),
                nip05: Nip05Client::new(http),
                config,
                keys,
                user_key,
                store,
                social_graph,
                signer,
                analytics,
                socket_events,
                socket_events_rx: Mutex::new(Some(socket_events_rx)),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn user_key(&self) -> &str {
        &self.inner.user_key
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn subscription_manager(&self) -> &SubscriptionManager {
        &self.inner.manager
    }

    pub fn social_graph(&self) -> &Arc<SocialGraphCache> {
        &self.inner.social_graph
    }

    pub fn parse_queue(&self) -> &ParseQueue {
        &self.inner.parse_queue
    }

    /// Spawns the frame dispatcher, the parse loop and both timers, then opens the pool.
    pub async fn start(&self) {
        let Some(socket_events) = self.inner.socket_events_rx.lock().await.take() else {
            warn!("Relay service already started");
            return;
        };
        self.inner.started.store(true, Ordering::SeqCst);

        tokio::spawn(self.clone().run_dispatch(socket_events));
        tokio::spawn(self.clone().run_parse_loop());
        tokio::spawn(self.clone().run_queue_timer());
        tokio::spawn(self.clone().run_retry_timer());

        info!(user = %self.inner.user_key, "Relay service started");
        self.process_subscription_queue().await;
    }

    /// Stops every background task and drops all sockets.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.manager.close_all_sockets().await;
        info!("Relay service stopped");
    }

    /// Re-opens the pool after the host comes back to the foreground. Open sockets are kept.
    pub async fn enter_foreground(&self) {
        self.process_subscription_queue().await;
    }

    pub async fn handle_memory_pressure(&self) {
        self.inner.social_graph.handle_memory_pressure().await;
    }

    /// The user's relays: their published relay list, else the bootstrap relays. Invalid and
    /// excluded addresses are dropped.
    pub fn relay_addresses(&self) -> Vec<String> {
        let stored = self
            .inner
            .store
            .read(|tx| tx.author_relays(&self.inner.user_key))
            .unwrap_or_else(|err| {
                warn!(error = %err, "Could not read relay list");
                Vec::new()
            });
        let candidates = if stored.is_empty() {
            self.inner.config.relays.clone()
        } else {
            stored
        };

        let mut relays: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match parse_relay_url(&candidate) {
                Ok(relay) if self.inner.config.is_excluded_relay(&relay) => {
                    debug!(relay = %relay, "Skipping excluded relay");
                }
                Ok(relay) => {
                    if !relays.contains(&relay) {
                        relays.push(relay);
                    }
                }
                Err(err) => debug!(error = %err, "Skipping relay"),
            }
        }
        relays
    }

    /// Opens a socket for every user relay and every relay a subscription is queued on, unless
    /// one is already open. Does nothing before [`RelayService::start`].
    pub async fn open_sockets(&self) {
        if !self.inner.started.load(Ordering::SeqCst) {
            return;
        }
        let mut relays = self.relay_addresses();
        for subscription in self.inner.manager.all().await {
            for relay in subscription.relays.keys() {
                if !relays.contains(relay) && !self.inner.config.is_excluded_relay(relay) {
                    relays.push(relay.clone());
                }
            }
        }

        for relay in relays {
            if let Some((socket, outbound)) = self.inner.manager.add_socket(&relay).await {
                debug!(relay = %relay, socket_id = socket.id(), "Opening socket");
                spawn_connection(
                    socket.id(),
                    relay,
                    outbound,
                    self.inner.socket_events.clone(),
                    self.inner.config.socket_timeout,
                    self.inner.cancel.child_token(),
                );
            }
        }
    }

    /// One admission cycle: connect missing sockets, admit queued subscriptions, drop stale
    /// one-time subscriptions.
    pub async fn process_subscription_queue(&self) {
        self.open_sockets().await;
        self.inner.manager.process_subscription_queue().await;
        self.inner.manager.stale_subscriptions().await;
    }

    async fn run_queue_timer(self) {
        let period = self.inner.config.queue_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => self.process_subscription_queue().await,
            }
        }
    }

    async fn run_retry_timer(self) {
        let period = self.inner.config.retry_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.retry_failed_publishes().await {
                        warn!(error = %err, "Publish retry sweep failed");
                    }
                    if let Err(err) = self.delete_expired_events() {
                        warn!(error = %err, "Expired event cleanup failed");
                    }
                }
            }
        }
    }

    async fn run_parse_loop(self) {
        let batch_size = self.inner.config.parse_batch_size;
        let backoff = self.inner.config.parse_idle_backoff;
        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }
            let batch = self.inner.parse_queue.pop(batch_size).await;
            if batch.is_empty() {
                tokio::select! {
                    _ = self.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }
            for item in batch {
                self.parse_queued(item).await;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Verifies and stores one queued event. Failures only affect that event.
    pub(crate) async fn parse_queued(&self, item: QueuedEvent) {
        if item.in_network_only && !self.inner.social_graph.is_in_network(&item.event.pubkey).await {
            debug!(event_id = %item.event.id, author = %item.event.pubkey, "Dropping out-of-network event");
            return;
        }
        match self.inner.processor.parse(&item.event, Some(&item.relay)) {
            Ok(Some(event)) => debug!(row_id = event.row_id, relay = %item.relay, "Stored event"),
            Ok(None) => {}
            Err(Error::InvalidSignature(event_id)) => {
                self.inner.analytics.invalid_signature(&item.relay, &event_id);
            }
            Err(err) => debug!(event_id = %item.event.id, error = %err, "Dropped event"),
        }
    }

    pub async fn verify_nip05(&self, identifier: &str, pubkey: &str) -> Result<bool, Error> {
        self.inner.nip05.verify(identifier, pubkey).await
    }

    /// Deletes events whose NIP-40 expiration has passed.
    pub fn delete_expired_events(&self) -> Result<usize, Error> {
        let now = crate::event::unix_timestamp();
        let deleted = self.inner.store.write(|tx| tx.delete_expired_events(now))?;
        if deleted > 0 {
            info!(deleted, "Deleted expired events");
        }
        Ok(deleted)
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    pub const RELAY_ONE: &str = "wss://relay.one";
    pub const RELAY_TWO: &str = "wss://relay.two";

    /// Records analytics calls as `kind:relay:detail` strings.
    #[derive(Default)]
    pub struct RecordingAnalytics {
        pub calls: Mutex<Vec<String>>,
    }

    impl Analytics for RecordingAnalytics {
        fn rate_limited(&self, relay: &str, message: &str) {
            self.calls.lock().unwrap().push(format!("rate_limited:{relay}:{message}"));
        }

        fn relay_error(&self, relay: &str, message: &str) {
            self.calls.lock().unwrap().push(format!("relay_error:{relay}:{message}"));
        }

        fn publish_rejected(&self, relay: &str, event_id: &str, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("publish_rejected:{relay}:{event_id}:{message}"));
        }

        fn invalid_signature(&self, relay: &str, event_id: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("invalid_signature:{relay}:{event_id}"));
        }
    }

    pub fn service_with(keys: Keys, analytics: Arc<RecordingAnalytics>) -> RelayService {
        let config = EngineConfig {
            relays: vec![RELAY_ONE.to_string(), RELAY_TWO.to_string()],
            fetch_relay_metadata: false,
            ..EngineConfig::default()
        };
        RelayService::with_collaborators(
            config,
            keys,
            Store::open_in_memory().unwrap(),
            Arc::new(KeysSigner),
            analytics,
        )
        .unwrap()
    }

    pub fn drain(receiver: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::test_support::*;
    use super::*;
    use crate::store::Follow;

    #[tokio::test]
    async fn test_relay_addresses_prefer_user_relay_list() {
        let keys = Keys::generate();
        let service = service_with(keys.clone(), Arc::new(RecordingAnalytics::default()));
        assert_eq!(service.relay_addresses(), vec![RELAY_ONE, RELAY_TWO]);

        let user = keys.public_key().to_hex();
        service
            .store()
            .write(|tx| {
                tx.replace_author_relays(
                    &user,
                    &[
                        "wss://relay.three/".to_string(),
                        "wss://search.nostr.band".to_string(),
                        "nonsense".to_string(),
                    ],
                )
            })
            .unwrap();
        assert_eq!(service.relay_addresses(), vec!["wss://relay.three"]);
    }

    #[tokio::test]
    async fn test_open_sockets_waits_for_start() {
        let service = service_with(Keys::generate(), Arc::new(RecordingAnalytics::default()));
        service.open_sockets().await;
        assert!(service.subscription_manager().sockets().await.is_empty());
        assert_eq!(service.config().parse_batch_size, 30);
    }

    #[tokio::test]
    async fn test_in_network_gate_drops_strangers() {
        let keys = Keys::generate();
        let service = service_with(keys.clone(), Arc::new(RecordingAnalytics::default()));
        let friend = Keys::generate();
        let stranger = Keys::generate();
        service
            .store()
            .write(|tx| {
                tx.replace_follows(
                    &keys.public_key().to_hex(),
                    &[Follow::new(friend.public_key().to_hex())],
                    1,
                )
            })
            .unwrap();
        let friend_key = friend.public_key().to_hex();
        for _ in 0..100 {
            if service.social_graph().follows(&friend_key).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(service.social_graph().follows(&friend_key).await);

        let draft = crate::signer::EventDraft::new(crate::event::EventKind::Text, "hi");
        for (author, expected) in [(&friend, true), (&stranger, false)] {
            let event = KeysSigner.sign(&draft, author).await.unwrap();
            service
                .parse_queued(QueuedEvent {
                    event: event.clone(),
                    relay: RELAY_ONE.to_string(),
                    in_network_only: true,
                })
                .await;
            let stored = service.store().read(|tx| tx.event_by_id(&event.id)).unwrap();
            assert_eq!(stored.is_some(), expected);
        }
    }

    #[tokio::test]
    async fn test_invalid_signature_reported() {
        let analytics = Arc::new(RecordingAnalytics::default());
        let service = service_with(Keys::generate(), analytics.clone());
        let draft = crate::signer::EventDraft::new(crate::event::EventKind::Text, "hi");
        let mut event = KeysSigner.sign(&draft, &Keys::generate()).await.unwrap();
        event.content = "changed".to_string();

        service
            .parse_queued(QueuedEvent {
                event: event.clone(),
                relay: RELAY_ONE.to_string(),
                in_network_only: false,
            })
            .await;
        let calls = analytics.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![format!("invalid_signature:{RELAY_ONE}:{}", event.id)]);
    }
}
