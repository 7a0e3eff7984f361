//! SQLite persistence for events, authors, follows and relays.
//!
//! All access goes through [`Store::read`] or [`Store::write`], each of which runs a closure
//! inside one transaction. Writes may queue [`StoreChange`] notifications; they are broadcast
//! only after the transaction commits.

mod authors;
mod events;
mod relays;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction};
use tokio::sync::broadcast;

use crate::Error;

pub use authors::{AuthorMetadata, Follow};
pub use events::StoredEvent;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Committed changes other components may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// `author` replaced their contact list.
    FollowsChanged {
        author: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, Error> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Runs `f` in a transaction that is rolled back afterwards.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        let mut conn = self.db.lock().map_err(|_| Error::MutexPoisoned)?;
        let tx = StoreTx::new(conn.transaction()?);
        let value = f(&tx)?;
        Ok(value)
    }

    /// Runs `f` in a transaction, commits it, then broadcasts any queued changes.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreTx<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let (value, changes) = {
            let mut conn = self.db.lock().map_err(|_| Error::MutexPoisoned)?;
            let mut tx = StoreTx::new(conn.transaction()?);
            let value = f(&mut tx)?;
            let StoreTx { tx, changes } = tx;
            tx.commit()?;
            (value, changes)
        };
        for change in changes {
            // No receivers is fine.
            let _ = self.changes.send(change);
        }
        Ok(value)
    }
}

/// A scoped unit of work against the store.
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
    changes: Vec<StoreChange>,
}

impl<'conn> StoreTx<'conn> {
    fn new(tx: Transaction<'conn>) -> Self {
        Self {
            tx,
            changes: Vec::new(),
        }
    }

    fn notify(&mut self, change: StoreChange) {
        self.changes.push(change);
    }
}

fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (\
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,\
            event_id TEXT UNIQUE,\
            author TEXT,\
            kind INTEGER,\
            created_at INTEGER,\
            content TEXT,\
            tags TEXT NOT NULL DEFAULT '[]',\
            sig TEXT,\
            replaceable_id TEXT,\
            expires_at INTEGER,\
            raw_json TEXT,\
            received_at INTEGER,\
            is_verified INTEGER NOT NULL DEFAULT 0\
        );\
        CREATE INDEX IF NOT EXISTS idx_events_replaceable ON events(replaceable_id, author, kind);\
        CREATE INDEX IF NOT EXISTS idx_events_author ON events(author, created_at);\
        CREATE TABLE IF NOT EXISTS event_references (\
            event_row INTEGER NOT NULL REFERENCES events(row_id) ON DELETE CASCADE,\
            referenced_row INTEGER NOT NULL REFERENCES events(row_id) ON DELETE CASCADE,\
            marker TEXT,\
            PRIMARY KEY (event_row, referenced_row)\
        );\
        CREATE TABLE IF NOT EXISTS author_references (\
            event_row INTEGER NOT NULL REFERENCES events(row_id) ON DELETE CASCADE,\
            pubkey TEXT NOT NULL,\
            PRIMARY KEY (event_row, pubkey)\
        );\
        CREATE TABLE IF NOT EXISTS event_relays (\
            event_row INTEGER NOT NULL REFERENCES events(row_id) ON DELETE CASCADE,\
            relay TEXT NOT NULL,\
            seen INTEGER NOT NULL DEFAULT 0,\
            published INTEGER NOT NULL DEFAULT 0,\
            should_publish INTEGER NOT NULL DEFAULT 0,\
            PRIMARY KEY (event_row, relay)\
        );\
        CREATE TABLE IF NOT EXISTS event_deletions (\
            event_row INTEGER NOT NULL REFERENCES events(row_id) ON DELETE CASCADE,\
            relay TEXT NOT NULL,\
            PRIMARY KEY (event_row, relay)\
        );\
        CREATE TABLE IF NOT EXISTS authors (\
            pubkey TEXT PRIMARY KEY,\
            name TEXT,\
            display_name TEXT,\
            about TEXT,\
            picture TEXT,\
            nip05 TEXT,\
            metadata_updated_at INTEGER,\
            contact_list_updated_at INTEGER\
        );\
        CREATE TABLE IF NOT EXISTS follows (\
            source TEXT NOT NULL,\
            destination TEXT NOT NULL,\
            petname TEXT,\
            PRIMARY KEY (source, destination)\
        );\
        CREATE INDEX IF NOT EXISTS idx_follows_destination ON follows(destination);\
        CREATE TABLE IF NOT EXISTS author_relays (\
            pubkey TEXT NOT NULL,\
            relay TEXT NOT NULL,\
            PRIMARY KEY (pubkey, relay)\
        );\
        CREATE TABLE IF NOT EXISTS relays (\
            address TEXT PRIMARY KEY,\
            name TEXT,\
            description TEXT,\
            pubkey TEXT,\
            contact TEXT,\
            supported_nips TEXT,\
            software TEXT,\
            version TEXT,\
            metadata_fetched_at INTEGER\
        );",
    )?;

    Ok(())
}
