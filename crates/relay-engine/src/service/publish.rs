//! Publishing with at-least-once delivery.
//!
//! A published event is signed, stored locally and its target relays recorded before anything
//! touches the network. Delivery is confirmed only by a relay `OK`; the retry sweep re-sends
//! every event of the user that still has unconfirmed targets inside the retry window.

use nostr_sdk::prelude::Keys;
use tracing::{debug, info};

use super::RelayService;
use crate::event::{unix_timestamp, JsonEvent};
use crate::message::ClientMessage;
use crate::signer::EventDraft;
use crate::socket::{parse_relay_url, send_once};
use crate::Error;

impl RelayService {
    /// Publishes to the user's relays.
    pub async fn publish_to_all(&self, draft: &EventDraft, keys: &Keys) -> Result<JsonEvent, Error> {
        let relays = self.relay_addresses();
        self.publish_to(draft, keys, &relays).await
    }

    /// Publishes to `relays`. Relays without an open socket are reached by the retry sweep.
    pub async fn publish_to(
        &self,
        draft: &EventDraft,
        keys: &Keys,
        relays: &[String],
    ) -> Result<JsonEvent, Error> {
        let event = self.sign_and_save(draft, keys, relays).await?;
        let frame = ClientMessage::Event { event: &event }.to_json()?;

        let mut sent = 0;
        for relay in relays {
            match self.inner.manager.socket(relay).await {
                Some(socket) if socket.send(frame.clone()) => sent += 1,
                _ => debug!(relay = %relay, event_id = %event.id, "Relay not connected, deferring"),
            }
        }
        info!(event_id = %event.id, kind = event.kind, sent, targets = relays.len(), "Published event");
        Ok(event)
    }

    /// Publishes to one relay, opening a throwaway connection if the pool has none.
    pub async fn publish_to_relay(
        &self,
        draft: &EventDraft,
        keys: &Keys,
        relay: &str,
    ) -> Result<JsonEvent, Error> {
        let relay = parse_relay_url(relay)?;
        let event = self
            .sign_and_save(draft, keys, std::slice::from_ref(&relay))
            .await?;
        let frame = ClientMessage::Event { event: &event }.to_json()?;

        match self.inner.manager.socket(&relay).await {
            Some(socket) if socket.send(frame.clone()) => {}
            _ => send_once(&relay, frame, self.inner.config.socket_timeout).await?,
        }
        info!(event_id = %event.id, relay = %relay, "Published event");
        Ok(event)
    }

    async fn sign_and_save(
        &self,
        draft: &EventDraft,
        keys: &Keys,
        relays: &[String],
    ) -> Result<JsonEvent, Error> {
        let event = self.inner.signer.sign(draft, keys).await?;
        self.inner.processor.parse(&event, None)?;
        self.inner
            .store
            .write(|tx| tx.set_should_publish_to(&event.id, relays))?;
        Ok(event)
    }

    /// Re-sends the user's unconfirmed events to their missing relays. Targets older than the
    /// retry window are given up on. Returns the number of frames written.
    pub async fn retry_failed_publishes(&self) -> Result<usize, Error> {
        let since = unix_timestamp().saturating_sub(self.inner.config.publish_retry_window.as_secs());
        let user = self.inner.user_key.as_str();

        let abandoned = self
            .inner
            .store
            .write(|tx| tx.clear_publish_targets_before(user, since))?;
        if abandoned > 0 {
            info!(abandoned, "Gave up on old publish targets");
        }

        let pending = self
            .inner
            .store
            .read(|tx| tx.unpublished_events(user, since))?;
        let mut sent = 0;
        for (event, relays) in pending {
            let frame = ClientMessage::Event { event: &event }.to_json()?;
            for relay in relays {
                if let Some(socket) = self.inner.manager.socket(&relay).await {
                    if socket.send(frame.clone()) {
                        sent += 1;
                    }
                }
            }
        }
        if sent > 0 {
            info!(sent, "Retried unpublished events");
        }
        Ok(sent)
    }
}
