//! Turns wire events into verified rows.
//!
//! The signature is checked before the store is touched, so a forged event never changes stored
//! state. Parsing then resolves the row the event belongs to (an existing stub or a new one),
//! hydrates it and applies kind-specific side effects in one transaction.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{is_valid_pubkey, unix_timestamp, EventKind, JsonEvent};
use crate::store::{AuthorMetadata, Follow, Store, StoreTx, StoredEvent};
use crate::Error;

#[derive(Clone)]
pub struct EventProcessor {
    store: Store,
}

impl EventProcessor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stores `json_event`, returning the hydrated row, or `None` if the event was already
    /// known (it is still marked as seen on `relay`).
    pub fn parse(
        &self,
        json_event: &JsonEvent,
        relay: Option<&str>,
    ) -> Result<Option<StoredEvent>, Error> {
        let kind = EventKind::from_u16(json_event.kind).ok_or(Error::UnknownKind(json_event.kind))?;
        if json_event.is_expired(unix_timestamp()) {
            return Err(Error::ExpiredEvent(json_event.id.clone()));
        }

        self.store.write(|tx| {
            if tx.hydrated_event_exists(&json_event.id)? {
                if let Some(relay) = relay {
                    tx.mark_seen(&json_event.id, relay)?;
                }
                return Ok(None);
            }
            verify(json_event)?;

            let row_id = match tx.event_by_id(&json_event.id)? {
                Some(existing) => existing.row_id,
                None => match json_event.replaceable_id() {
                    Some(replaceable_id) => {
                        let existing = tx.event_by_replaceable_id(
                            replaceable_id,
                            &json_event.pubkey,
                            json_event.kind,
                        )?;
                        match existing {
                            Some(stub) if stub.is_stub() => stub.row_id,
                            Some(current)
                                if current.created_at.unwrap_or_default()
                                    >= json_event.created_at =>
                            {
                                debug!(event_id = %json_event.id, "Ignoring older replaceable event");
                                return Ok(None);
                            }
                            Some(outdated) => {
                                tx.delete_event(outdated.row_id)?;
                                tx.insert_stub_by_id(&json_event.id)?
                            }
                            None => tx.insert_stub_by_id(&json_event.id)?,
                        }
                    }
                    None => tx.insert_stub_by_id(&json_event.id)?,
                },
            };

            hydrate_row(tx, row_id, json_event, kind, relay).map(Some)
        })
    }

    /// Hydrates a specific stub row. Fails with [`Error::AlreadyHydrated`] for rows that are
    /// not stubs.
    pub fn hydrate(
        &self,
        row_id: i64,
        json_event: &JsonEvent,
        relay: Option<&str>,
    ) -> Result<StoredEvent, Error> {
        let kind = EventKind::from_u16(json_event.kind).ok_or(Error::UnknownKind(json_event.kind))?;
        verify(json_event)?;
        self.store
            .write(|tx| hydrate_row(tx, row_id, json_event, kind, relay))
    }
}

fn verify(json_event: &JsonEvent) -> Result<(), Error> {
    if json_event.verify_signature() {
        return Ok(());
    }
    warn!(event_id = %json_event.id, author = %json_event.pubkey, "Invalid signature, dropping event");
    Err(Error::InvalidSignature(json_event.id.clone()))
}

/// Fills a stub row with an event whose signature has already been checked.
fn hydrate_row(
    tx: &mut StoreTx<'_>,
    row_id: i64,
    json_event: &JsonEvent,
    kind: EventKind,
    relay: Option<&str>,
) -> Result<StoredEvent, Error> {
    let stored = tx
        .event_by_row(row_id)?
        .ok_or_else(|| Error::AlreadyHydrated(json_event.id.clone()))?;
    if !stored.is_stub() {
        return Err(Error::AlreadyHydrated(json_event.id.clone()));
    }

    let created_at = json_event.created_at.min(unix_timestamp());
    tx.ensure_author(&json_event.pubkey)?;
    tx.write_hydrated(row_id, json_event, created_at)?;
    tx.mark_verified(row_id)?;
    if let Some(relay) = relay {
        tx.mark_seen(&json_event.id, relay)?;
    }

    match kind {
        EventKind::ContactList => apply_contact_list(tx, json_event, created_at)?,
        EventKind::Metadata => apply_metadata(tx, json_event, created_at)?,
        EventKind::RelayList => {
            let relays: Vec<String> = json_event.tag_values("r").map(str::to_string).collect();
            tx.replace_author_relays(&json_event.pubkey, &relays)?;
        }
        EventKind::Delete => {
            apply_references(tx, row_id, json_event)?;
            // Our own deletions are tracked when a relay acknowledges them.
            if let Some(relay) = relay {
                let deleted = tx.track_deletion(&json_event.id, relay)?;
                debug!(event_id = %json_event.id, relay = %relay, deleted, "Applied deletion");
            }
        }
        _ => apply_references(tx, row_id, json_event)?,
    }
    tx.apply_pending_deletions(row_id)?;

    tx.event_by_row(row_id)?
        .ok_or_else(|| Error::AlreadyHydrated(json_event.id.clone()))
}

fn apply_contact_list(
    tx: &mut StoreTx<'_>,
    json_event: &JsonEvent,
    created_at: u64,
) -> Result<(), Error> {
    if let Some(last) = tx.contact_list_updated_at(&json_event.pubkey)? {
        if last >= created_at {
            debug!(event_id = %json_event.id, "Skipping outdated contact list");
            return Ok(());
        }
    }

    let follows: Vec<Follow> = json_event
        .tags
        .iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("p"))
        .filter_map(|tag| {
            let pubkey = tag.get(1)?;
            if !is_valid_pubkey(pubkey) {
                debug!(pubkey = %pubkey, "Ignoring invalid key in contact list");
                return None;
            }
            Some(Follow {
                pubkey: pubkey.clone(),
                petname: tag.get(3).filter(|name| !name.is_empty()).cloned(),
            })
        })
        .collect();
    tx.replace_follows(&json_event.pubkey, &follows, created_at)?;

    // Legacy relay list: {"wss://relay": {"read": true, "write": true}, ...}
    if !json_event.content.trim().is_empty() {
        match serde_json::from_str::<HashMap<String, Value>>(&json_event.content) {
            Ok(relays) => {
                let mut relays: Vec<String> = relays.into_keys().collect();
                relays.sort();
                tx.replace_author_relays(&json_event.pubkey, &relays)?;
            }
            Err(err) => debug!(error = %err, "Contact list content is not a relay map"),
        }
    }
    Ok(())
}

fn apply_metadata(tx: &StoreTx<'_>, json_event: &JsonEvent, created_at: u64) -> Result<(), Error> {
    if let Some(last) = tx.metadata_updated_at(&json_event.pubkey)? {
        if last >= created_at {
            return Ok(());
        }
    }
    match serde_json::from_str::<AuthorMetadata>(&json_event.content) {
        Ok(metadata) => tx.apply_metadata(&json_event.pubkey, &metadata, created_at)?,
        Err(err) => warn!(event_id = %json_event.id, error = %err, "Could not parse metadata"),
    }
    Ok(())
}

/// Links `e`, `a` and `p` tags, creating stubs for events not downloaded yet.
fn apply_references(tx: &StoreTx<'_>, row_id: i64, json_event: &JsonEvent) -> Result<(), Error> {
    for tag in &json_event.tags {
        let (Some(name), Some(value)) = (tag.first(), tag.get(1)) else {
            continue;
        };
        match name.as_str() {
            "e" => {
                let referenced = tx.find_or_create_stub_by_id(value)?;
                if referenced != row_id {
                    let marker = tag.get(3).map(String::as_str);
                    tx.add_event_reference(row_id, referenced, marker)?;
                }
            }
            "a" => {
                let mut parts = value.splitn(3, ':');
                let (Some(kind), Some(author), Some(d)) = (parts.next(), parts.next(), parts.next())
                else {
                    debug!(tag = %value, "Ignoring malformed a tag");
                    continue;
                };
                let Ok(kind) = kind.parse::<u16>() else {
                    debug!(tag = %value, "Ignoring a tag with non-numeric kind");
                    continue;
                };
                if !is_valid_pubkey(author) {
                    continue;
                }
                let referenced = tx.find_or_create_stub_by_replaceable_id(d, author, kind)?;
                tx.add_event_reference(row_id, referenced, None)?;
            }
            "p" if is_valid_pubkey(value) => {
                tx.ensure_author(value)?;
                tx.add_author_reference(row_id, value)?;
            }
            _ => {}
        }
    }
    Ok(())
}
