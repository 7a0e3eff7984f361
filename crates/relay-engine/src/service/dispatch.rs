use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RelayService;
use crate::event::{unix_timestamp, EventKind};
use crate::message::{ClientMessage, RelayMessage};
use crate::parse_queue::QueuedEvent;
use crate::signer::EventDraft;
use crate::socket::SocketEvent;
use crate::Error;

const RATE_LIMITED: &str = "rate limited";
const TOO_MANY_REQS: &str = "ERROR: too many concurrent REQs";
const BAD_REQ: &str = "bad req:";

impl RelayService {
    pub(super) async fn run_dispatch(self, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle_socket_event(event).await,
                None => break,
            }
        }
    }

    async fn handle_socket_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::Connected { socket_id, url } => {
                info!(relay = %url, socket_id, "Connected to relay");
                self.inner.manager.process_subscription_queue().await;
                if self.inner.config.fetch_relay_metadata {
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = service.query_relay_metadata_if_needed(&url).await {
                            debug!(relay = %url, error = %err, "Relay metadata unavailable");
                        }
                    });
                }
            }
            SocketEvent::Text { url, text, .. } => self.handle_frame(&url, &text).await,
            SocketEvent::Disconnected { socket_id, url } => {
                info!(relay = %url, socket_id, "Disconnected from relay");
                self.inner.manager.remove_socket(socket_id).await;
            }
            SocketEvent::Error {
                socket_id,
                url,
                error,
            } => {
                warn!(relay = %url, socket_id, error = %error, "Relay socket failed");
                self.inner.manager.remove_socket(socket_id).await;
            }
        }
    }

    /// Routes one text frame received from `relay`. Unknown and malformed frames are logged
    /// and dropped.
    pub async fn handle_frame(&self, relay: &str, text: &str) {
        match RelayMessage::from_json(text) {
            Ok(message) => self.handle_message(relay, message).await,
            Err(Error::UnknownFrame(kind)) => debug!(relay = %relay, kind = %kind, "Ignoring unknown frame"),
            Err(err) => warn!(relay = %relay, error = %err, "Malformed relay frame"),
        }
    }

    async fn handle_message(&self, relay: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let filter = self
                    .inner
                    .manager
                    .record_event(&subscription_id, relay, event.created_at)
                    .await;
                // Events for subscriptions we no longer hold get the strict gate.
                let in_network_only = match &filter {
                    Some(filter) => filter.in_network,
                    None => true,
                };
                let fulfilled = filter.as_ref().is_some_and(|filter| filter.is_fulfilled(&event));

                self.inner
                    .parse_queue
                    .push(QueuedEvent {
                        event,
                        relay: relay.to_string(),
                        in_network_only,
                    })
                    .await;

                if fulfilled {
                    debug!(subscription_id = %subscription_id, "One-time subscription fulfilled");
                    self.inner.manager.force_close_subscription(&subscription_id).await;
                }
            }
            RelayMessage::Eose { subscription_id } => {
                let Some(subscription) = self.inner.manager.subscription(&subscription_id).await
                else {
                    return;
                };
                if subscription.is_one_time() {
                    self.inner
                        .manager
                        .close_relay_subscription(&subscription_id, relay)
                        .await;
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => self.handle_ok(relay, &event_id, success, &message),
            RelayMessage::Notice { message } => {
                if message.contains(RATE_LIMITED) {
                    self.inner.analytics.rate_limited(relay, &message);
                } else if message.starts_with(TOO_MANY_REQS) || message.starts_with(BAD_REQ) {
                    self.inner.analytics.relay_error(relay, &message);
                } else {
                    debug!(relay = %relay, notice = %message, "Relay notice");
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                self.inner
                    .manager
                    .relay_closed_subscription(&subscription_id, relay)
                    .await;
                if message.contains(RATE_LIMITED) {
                    self.inner.analytics.rate_limited(relay, &message);
                } else {
                    self.inner.analytics.relay_error(relay, &message);
                }
            }
            RelayMessage::Auth { challenge } => {
                if let Err(err) = self.authenticate(relay, &challenge).await {
                    warn!(relay = %relay, error = %err, "Relay authentication failed");
                }
            }
        }
    }

    fn handle_ok(&self, relay: &str, event_id: &str, success: bool, message: &str) {
        if success || message.contains("duplicate") || message.contains("replaced") {
            let recorded = self.inner.store.write(|tx| {
                let known = tx.mark_published(event_id, relay)?;
                if known && success {
                    let deleted = tx.track_deletion(event_id, relay)?;
                    if deleted > 0 {
                        debug!(relay = %relay, event_id = %event_id, deleted, "Deletion confirmed");
                    }
                }
                Ok(known)
            });
            match recorded {
                Ok(true) => debug!(relay = %relay, event_id = %event_id, "Event published"),
                Ok(false) => debug!(relay = %relay, event_id = %event_id, "OK for unknown event"),
                Err(err) => warn!(error = %err, "Could not record publish"),
            }
        } else {
            self.inner.analytics.publish_rejected(relay, event_id, message);
        }
    }

    /// Answers a NIP-42 challenge with a signed kind 22242 event. The event is never stored.
    async fn authenticate(&self, relay: &str, challenge: &str) -> Result<(), Error> {
        let draft = EventDraft::new(EventKind::ClientAuth, "")
            .tag(["relay", relay])
            .tag(["challenge", challenge])
            .created_at(unix_timestamp());
        let event = self.inner.signer.sign(&draft, &self.inner.keys).await?;
        let frame = ClientMessage::Auth { event: &event }.to_json()?;

        match self.inner.manager.socket(relay).await {
            Some(socket) if socket.send(frame) => {
                debug!(relay = %relay, "Sent AUTH");
                Ok(())
            }
            _ => Err(Error::InvalidRelayUrl(format!("{relay} is not connected"))),
        }
    }

    async fn query_relay_metadata_if_needed(&self, relay: &str) -> Result<(), Error> {
        let now = unix_timestamp();
        let ttl = self.inner.config.relay_metadata_ttl.as_secs();
        let fetched_at = self
            .inner
            .store
            .read(|tx| tx.relay_metadata_fetched_at(relay))?;
        if fetched_at.is_some_and(|at| now.saturating_sub(at) < ttl) {
            return Ok(());
        }

        let metadata = self.inner.metadata_client.fetch(relay).await?;
        self.inner
            .store
            .write(|tx| tx.save_relay_metadata(relay, &metadata, now))?;
        info!(relay = %relay, name = ?metadata.name, "Stored relay metadata");
        Ok(())
    }
}
