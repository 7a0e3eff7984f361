use rusqlite::{params, OptionalExtension, Row};

use super::StoreTx;
use crate::event::{unix_timestamp, JsonEvent};
use crate::Error;

const EVENT_COLUMNS: &str =
    "row_id, event_id, author, kind, created_at, content, tags, sig, replaceable_id, expires_at, is_verified";

/// An event row. Stubs only know their id, or their replaceable id, author and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub row_id: i64,
    pub identifier: Option<String>,
    pub author: Option<String>,
    pub kind: Option<u16>,
    pub created_at: Option<u64>,
    pub content: Option<String>,
    pub tags: Vec<Vec<String>>,
    pub signature: Option<String>,
    pub replaceable_id: Option<String>,
    pub expires_at: Option<u64>,
    pub is_verified: bool,
}

impl StoredEvent {
    pub fn is_stub(&self) -> bool {
        self.author.is_none() || self.created_at.is_none() || self.identifier.is_none()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let tags: String = row.get(6)?;
        Ok(Self {
            row_id: row.get(0)?,
            identifier: row.get(1)?,
            author: row.get(2)?,
            kind: row.get::<_, Option<i64>>(3)?.map(|kind| kind as u16),
            created_at: row.get::<_, Option<i64>>(4)?.map(|at| at as u64),
            content: row.get(5)?,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            signature: row.get(7)?,
            replaceable_id: row.get(8)?,
            expires_at: row.get::<_, Option<i64>>(9)?.map(|at| at as u64),
            is_verified: row.get(10)?,
        })
    }
}

impl StoreTx<'_> {
    fn query_event(&self, clause: &str, params: impl rusqlite::Params) -> Result<Option<StoredEvent>, Error> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE {clause} LIMIT 1");
        Ok(self
            .tx
            .query_row(&sql, params, StoredEvent::from_row)
            .optional()?)
    }

    pub fn event_by_row(&self, row_id: i64) -> Result<Option<StoredEvent>, Error> {
        self.query_event("row_id = ?1", params![row_id])
    }

    pub fn event_by_id(&self, event_id: &str) -> Result<Option<StoredEvent>, Error> {
        self.query_event("event_id = ?1", params![event_id])
    }

    pub fn event_by_replaceable_id(
        &self,
        replaceable_id: &str,
        author: &str,
        kind: u16,
    ) -> Result<Option<StoredEvent>, Error> {
        self.query_event(
            "replaceable_id = ?1 AND author = ?2 AND kind = ?3",
            params![replaceable_id, author, kind as i64],
        )
    }

    pub fn hydrated_event_exists(&self, event_id: &str) -> Result<bool, Error> {
        Ok(self.tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE event_id = ?1 \
             AND author IS NOT NULL AND created_at IS NOT NULL)",
            params![event_id],
            |row| row.get(0),
        )?)
    }

    pub fn insert_stub_by_id(&self, event_id: &str) -> Result<i64, Error> {
        self.tx.execute(
            "INSERT INTO events (event_id, received_at) VALUES (?1, ?2)",
            params![event_id, unix_timestamp() as i64],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn find_or_create_stub_by_id(&self, event_id: &str) -> Result<i64, Error> {
        match self.event_by_id(event_id)? {
            Some(event) => Ok(event.row_id),
            None => self.insert_stub_by_id(event_id),
        }
    }

    pub fn find_or_create_stub_by_replaceable_id(
        &self,
        replaceable_id: &str,
        author: &str,
        kind: u16,
    ) -> Result<i64, Error> {
        if let Some(event) = self.event_by_replaceable_id(replaceable_id, author, kind)? {
            return Ok(event.row_id);
        }
        self.ensure_author(author)?;
        self.tx.execute(
            "INSERT INTO events (author, kind, replaceable_id, received_at) VALUES (?1, ?2, ?3, ?4)",
            params![author, kind as i64, replaceable_id, unix_timestamp() as i64],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Fills a stub row from wire JSON. `created_at` is the value to store, which may differ
    /// from the signed one.
    pub fn write_hydrated(
        &self,
        row_id: i64,
        event: &JsonEvent,
        created_at: u64,
    ) -> Result<(), Error> {
        let tags = serde_json::to_string(&event.tags)?;
        let raw_json = event.to_json()?;
        self.tx.execute(
            "UPDATE events SET event_id = ?2, author = ?3, kind = ?4, created_at = ?5, content = ?6, \
             tags = ?7, sig = ?8, replaceable_id = ?9, expires_at = ?10, raw_json = ?11, \
             received_at = COALESCE(received_at, ?12) \
             WHERE row_id = ?1",
            params![
                row_id,
                &event.id,
                &event.pubkey,
                event.kind as i64,
                created_at as i64,
                &event.content,
                tags,
                &event.sig,
                event.replaceable_id(),
                event.expiration().map(|at| at as i64),
                raw_json,
                unix_timestamp() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete_event(&self, row_id: i64) -> Result<(), Error> {
        self.tx
            .execute("DELETE FROM events WHERE row_id = ?1", params![row_id])?;
        Ok(())
    }

    pub fn mark_verified(&self, row_id: i64) -> Result<(), Error> {
        self.tx.execute(
            "UPDATE events SET is_verified = 1 WHERE row_id = ?1",
            params![row_id],
        )?;
        Ok(())
    }

    /// The signed wire form of a hydrated event.
    pub fn raw_event(&self, event_id: &str) -> Result<Option<JsonEvent>, Error> {
        let raw: Option<Option<String>> = self
            .tx
            .query_row(
                "SELECT raw_json FROM events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => Ok(Some(JsonEvent::from_json(&json)?)),
            None => Ok(None),
        }
    }

    // References

    pub fn add_event_reference(
        &self,
        row_id: i64,
        referenced_row: i64,
        marker: Option<&str>,
    ) -> Result<(), Error> {
        self.tx.execute(
            "INSERT OR IGNORE INTO event_references (event_row, referenced_row, marker) VALUES (?1, ?2, ?3)",
            params![row_id, referenced_row, marker],
        )?;
        Ok(())
    }

    pub fn add_author_reference(&self, row_id: i64, pubkey: &str) -> Result<(), Error> {
        self.tx.execute(
            "INSERT OR IGNORE INTO author_references (event_row, pubkey) VALUES (?1, ?2)",
            params![row_id, pubkey],
        )?;
        Ok(())
    }

    pub fn event_references(&self, row_id: i64) -> Result<Vec<StoredEvent>, Error> {
        let sql = format!(
            "SELECT {} FROM events e JOIN event_references r ON r.referenced_row = e.row_id \
             WHERE r.event_row = ?1 ORDER BY e.row_id",
            EVENT_COLUMNS
                .split(", ")
                .map(|column| format!("e.{column}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params![row_id], StoredEvent::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn author_references(&self, row_id: i64) -> Result<Vec<String>, Error> {
        self.strings(
            "SELECT pubkey FROM author_references WHERE event_row = ?1 ORDER BY pubkey",
            params![row_id],
        )
    }

    // Relay bookkeeping

    fn relay_flags(&self, event_id: &str, relay: &str, column: &str) -> Result<bool, Error> {
        let sql = format!(
            "INSERT INTO event_relays (event_row, relay, {column}) \
             SELECT row_id, ?2, 1 FROM events WHERE event_id = ?1 \
             ON CONFLICT(event_row, relay) DO UPDATE SET {column} = 1"
        );
        Ok(self.tx.execute(&sql, params![event_id, relay])? > 0)
    }

    pub fn mark_seen(&self, event_id: &str, relay: &str) -> Result<(), Error> {
        self.relay_flags(event_id, relay, "seen")?;
        Ok(())
    }

    /// Records a relay acknowledgement. Returns false for events the store does not know.
    pub fn mark_published(&self, event_id: &str, relay: &str) -> Result<bool, Error> {
        self.relay_flags(event_id, relay, "published")
    }

    pub fn set_should_publish_to(&self, event_id: &str, relays: &[String]) -> Result<(), Error> {
        for relay in relays {
            self.relay_flags(event_id, relay, "should_publish")?;
        }
        Ok(())
    }

    pub fn seen_on(&self, event_id: &str) -> Result<Vec<String>, Error> {
        self.relays_where(event_id, "seen = 1")
    }

    pub fn published_to(&self, event_id: &str) -> Result<Vec<String>, Error> {
        self.relays_where(event_id, "published = 1")
    }

    pub fn should_be_published_to(&self, event_id: &str) -> Result<Vec<String>, Error> {
        self.relays_where(event_id, "should_publish = 1")
    }

    fn relays_where(&self, event_id: &str, condition: &str) -> Result<Vec<String>, Error> {
        let sql = format!(
            "SELECT r.relay FROM event_relays r JOIN events e ON e.row_id = r.event_row \
             WHERE e.event_id = ?1 AND r.{condition} ORDER BY r.relay"
        );
        self.strings(&sql, params![event_id])
    }

    // Deletions

    /// Marks the targets of the kind 5 event `deletion_id` as deleted on `relay`. Only hydrated
    /// targets by the deletion's author count, and a replaceable target only up to the
    /// deletion's `created_at`. Does nothing for other kinds.
    pub fn track_deletion(&self, deletion_id: &str, relay: &str) -> Result<usize, Error> {
        Ok(self.tx.execute(
            "INSERT OR IGNORE INTO event_deletions (event_row, relay) \
             SELECT t.row_id, ?2 FROM events d \
             JOIN event_references r ON r.event_row = d.row_id \
             JOIN events t ON t.row_id = r.referenced_row \
             WHERE d.event_id = ?1 AND d.kind = 5 AND t.author = d.author \
             AND t.created_at IS NOT NULL \
             AND (t.replaceable_id IS NULL OR t.created_at <= d.created_at)",
            params![deletion_id, relay],
        )?)
    }

    /// Applies deletions that arrived before the event in `row_id` was hydrated, on every relay
    /// the deletion was seen on or published to.
    pub fn apply_pending_deletions(&self, row_id: i64) -> Result<usize, Error> {
        Ok(self.tx.execute(
            "INSERT OR IGNORE INTO event_deletions (event_row, relay) \
             SELECT t.row_id, er.relay FROM events t \
             JOIN event_references r ON r.referenced_row = t.row_id \
             JOIN events d ON d.row_id = r.event_row \
             JOIN event_relays er ON er.event_row = d.row_id \
             WHERE t.row_id = ?1 AND d.kind = 5 AND d.is_verified = 1 AND d.author = t.author \
             AND (t.replaceable_id IS NULL OR t.created_at <= d.created_at) \
             AND (er.seen = 1 OR er.published = 1)",
            params![row_id],
        )?)
    }

    /// Relays an event is known to be deleted on.
    pub fn deleted_on(&self, event_id: &str) -> Result<Vec<String>, Error> {
        self.strings(
            "SELECT x.relay FROM event_deletions x JOIN events e ON e.row_id = x.event_row \
             WHERE e.event_id = ?1 ORDER BY x.relay",
            params![event_id],
        )
    }

    /// Events by `author` created at or after `since` that still owe a publish to some relay,
    /// with the relays they owe it to.
    pub fn unpublished_events(
        &self,
        author: &str,
        since: u64,
    ) -> Result<Vec<(JsonEvent, Vec<String>)>, Error> {
        let mut stmt = self.tx.prepare(
            "SELECT e.event_id, e.raw_json, r.relay FROM events e \
             JOIN event_relays r ON r.event_row = e.row_id \
             WHERE e.author = ?1 AND e.created_at >= ?2 AND e.raw_json IS NOT NULL \
             AND r.should_publish = 1 AND r.published = 0 \
             ORDER BY e.created_at, e.row_id, r.relay",
        )?;
        let rows = stmt.query_map(params![author, since as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut pending: Vec<(JsonEvent, Vec<String>)> = Vec::new();
        for row in rows {
            let (event_id, raw_json, relay) = row?;
            match pending.last_mut() {
                Some((event, relays)) if event.id == event_id => relays.push(relay),
                _ => pending.push((JsonEvent::from_json(&raw_json)?, vec![relay])),
            }
        }
        Ok(pending)
    }

    /// Gives up on outstanding publishes of events created before `before`.
    pub fn clear_publish_targets_before(&self, author: &str, before: u64) -> Result<usize, Error> {
        Ok(self.tx.execute(
            "UPDATE event_relays SET should_publish = 0 \
             WHERE should_publish = 1 AND published = 0 AND event_row IN \
             (SELECT row_id FROM events WHERE author = ?1 AND created_at < ?2)",
            params![author, before as i64],
        )?)
    }

    /// Deletes events whose NIP-40 expiration has passed.
    pub fn delete_expired_events(&self, now: u64) -> Result<usize, Error> {
        Ok(self.tx.execute(
            "DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now as i64],
        )?)
    }

    pub(super) fn strings(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>, Error> {
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
