use std::collections::HashSet;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{StoreChange, StoreTx};
use crate::Error;

/// Profile fields from a kind 0 event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorMetadata {
    pub name: Option<String>,
    #[serde(alias = "displayName")]
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub nip05: Option<String>,
}

/// One `p` entry of a contact list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Follow {
    pub pubkey: String,
    pub petname: Option<String>,
}

impl Follow {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            petname: None,
        }
    }
}

impl StoreTx<'_> {
    pub fn ensure_author(&self, pubkey: &str) -> Result<(), Error> {
        self.tx.execute(
            "INSERT OR IGNORE INTO authors (pubkey) VALUES (?1)",
            params![pubkey],
        )?;
        Ok(())
    }

    pub fn author_metadata(&self, pubkey: &str) -> Result<Option<AuthorMetadata>, Error> {
        Ok(self
            .tx
            .query_row(
                "SELECT name, display_name, about, picture, nip05 FROM authors WHERE pubkey = ?1",
                params![pubkey],
                |row| {
                    Ok(AuthorMetadata {
                        name: row.get(0)?,
                        display_name: row.get(1)?,
                        about: row.get(2)?,
                        picture: row.get(3)?,
                        nip05: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    fn author_timestamp(&self, pubkey: &str, column: &str) -> Result<Option<u64>, Error> {
        let sql = format!("SELECT {column} FROM authors WHERE pubkey = ?1");
        let value: Option<Option<i64>> = self
            .tx
            .query_row(&sql, params![pubkey], |row| row.get(0))
            .optional()?;
        Ok(value.flatten().map(|at| at as u64))
    }

    pub fn metadata_updated_at(&self, pubkey: &str) -> Result<Option<u64>, Error> {
        self.author_timestamp(pubkey, "metadata_updated_at")
    }

    pub fn contact_list_updated_at(&self, pubkey: &str) -> Result<Option<u64>, Error> {
        self.author_timestamp(pubkey, "contact_list_updated_at")
    }

    pub fn apply_metadata(
        &self,
        pubkey: &str,
        metadata: &AuthorMetadata,
        updated_at: u64,
    ) -> Result<(), Error> {
        self.ensure_author(pubkey)?;
        self.tx.execute(
            "UPDATE authors SET name = ?2, display_name = ?3, about = ?4, picture = ?5, nip05 = ?6, \
             metadata_updated_at = ?7 WHERE pubkey = ?1",
            params![
                pubkey,
                metadata.name,
                metadata.display_name,
                metadata.about,
                metadata.picture,
                metadata.nip05,
                updated_at as i64
            ],
        )?;
        Ok(())
    }

    /// Replaces everyone `source` follows and queues a [`StoreChange::FollowsChanged`] when the
    /// set actually changed.
    pub fn replace_follows(
        &mut self,
        source: &str,
        follows: &[Follow],
        updated_at: u64,
    ) -> Result<(), Error> {
        self.ensure_author(source)?;
        let existing: HashSet<String> = self.follows(source)?.into_iter().collect();

        let mut seen = HashSet::new();
        let mut added = Vec::new();
        for follow in follows {
            if !seen.insert(follow.pubkey.as_str()) {
                continue;
            }
            self.ensure_author(&follow.pubkey)?;
            self.tx.execute(
                "INSERT INTO follows (source, destination, petname) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(source, destination) DO UPDATE SET petname = excluded.petname",
                params![source, &follow.pubkey, &follow.petname],
            )?;
            if !existing.contains(&follow.pubkey) {
                added.push(follow.pubkey.clone());
            }
        }

        let mut removed: Vec<String> = existing
            .into_iter()
            .filter(|pubkey| !seen.contains(pubkey.as_str()))
            .collect();
        removed.sort();
        for pubkey in &removed {
            self.tx.execute(
                "DELETE FROM follows WHERE source = ?1 AND destination = ?2",
                params![source, pubkey],
            )?;
        }

        self.tx.execute(
            "UPDATE authors SET contact_list_updated_at = ?2 WHERE pubkey = ?1",
            params![source, updated_at as i64],
        )?;

        if !added.is_empty() || !removed.is_empty() {
            self.notify(StoreChange::FollowsChanged {
                author: source.to_string(),
                added,
                removed,
            });
        }
        Ok(())
    }

    pub fn follows(&self, source: &str) -> Result<Vec<String>, Error> {
        self.strings(
            "SELECT destination FROM follows WHERE source = ?1 ORDER BY destination",
            params![source],
        )
    }

    /// Whether anyone `user` follows follows `key`.
    pub fn is_two_hop(&self, user: &str, key: &str) -> Result<bool, Error> {
        Ok(self.tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM follows first \
             JOIN follows second ON second.source = first.destination \
             WHERE first.source = ?1 AND second.destination = ?2)",
            params![user, key],
            |row| row.get(0),
        )?)
    }

    pub fn replace_author_relays(&self, pubkey: &str, relays: &[String]) -> Result<(), Error> {
        self.ensure_author(pubkey)?;
        self.tx.execute(
            "DELETE FROM author_relays WHERE pubkey = ?1",
            params![pubkey],
        )?;
        for relay in relays {
            self.tx.execute(
                "INSERT OR IGNORE INTO author_relays (pubkey, relay) VALUES (?1, ?2)",
                params![pubkey, relay],
            )?;
        }
        Ok(())
    }

    pub fn author_relays(&self, pubkey: &str) -> Result<Vec<String>, Error> {
        self.strings(
            "SELECT relay FROM author_relays WHERE pubkey = ?1 ORDER BY relay",
            params![pubkey],
        )
    }
}
