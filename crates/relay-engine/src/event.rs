use std::time::{SystemTime, UNIX_EPOCH};

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Hex-encoded event id.
pub type EventId = String;
/// Hex-encoded x-only public key.
pub type PubKey = String;

/// Event kinds the engine knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Metadata,
    Text,
    ContactList,
    DirectMessage,
    Delete,
    Repost,
    Like,
    GenericRepost,
    ChannelMessage,
    Report,
    Label,
    ZapRequest,
    ZapReceipt,
    MuteList,
    RelayList,
    ClientAuth,
    FollowSet,
    LongFormContent,
}

impl EventKind {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Metadata => 0,
            Self::Text => 1,
            Self::ContactList => 3,
            Self::DirectMessage => 4,
            Self::Delete => 5,
            Self::Repost => 6,
            Self::Like => 7,
            Self::GenericRepost => 16,
            Self::ChannelMessage => 42,
            Self::Report => 1984,
            Self::Label => 1985,
            Self::ZapRequest => 9734,
            Self::ZapReceipt => 9735,
            Self::MuteList => 10000,
            Self::RelayList => 10002,
            Self::ClientAuth => 22242,
            Self::FollowSet => 30000,
            Self::LongFormContent => 30023,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        let kind = match value {
            0 => Self::Metadata,
            1 => Self::Text,
            3 => Self::ContactList,
            4 => Self::DirectMessage,
            5 => Self::Delete,
            6 => Self::Repost,
            7 => Self::Like,
            16 => Self::GenericRepost,
            42 => Self::ChannelMessage,
            1984 => Self::Report,
            1985 => Self::Label,
            9734 => Self::ZapRequest,
            9735 => Self::ZapReceipt,
            10000 => Self::MuteList,
            10002 => Self::RelayList,
            22242 => Self::ClientAuth,
            30000 => Self::FollowSet,
            30023 => Self::LongFormContent,
            _ => return None,
        };
        Some(kind)
    }

    /// NIP-33 parameterized replaceable range.
    pub fn is_parameterized_replaceable(self) -> bool {
        (30000..40000).contains(&self.as_u16())
    }
}

/// A signed event exactly as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonEvent {
    pub id: EventId,
    pub pubkey: PubKey,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl JsonEvent {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_sdk_event(event: &Event) -> Result<Self, Error> {
        Self::from_json(&event.as_json())
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// First value of every tag with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Value of the first tag named `name` that has one.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// The `d` tag of a parameterized replaceable event. A missing tag counts as the empty
    /// identifier.
    pub fn replaceable_id(&self) -> Option<&str> {
        let kind = EventKind::from_u16(self.kind)?;
        if !kind.is_parameterized_replaceable() {
            return None;
        }
        Some(self.tag_value("d").unwrap_or(""))
    }

    /// NIP-40 expiration timestamp.
    pub fn expiration(&self) -> Option<u64> {
        self.tag_value("expiration")
            .and_then(|value| value.parse().ok())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration().is_some_and(|expires_at| expires_at <= now)
    }

    /// Checks the id and Schnorr signature against the canonical
    /// `[0, pubkey, created_at, kind, tags, content]` serialization.
    pub fn verify_signature(&self) -> bool {
        let json = match self.to_json() {
            Ok(json) => json,
            Err(_) => return false,
        };
        match Event::from_json(json) {
            Ok(event) => event.verify().is_ok(),
            Err(_) => false,
        }
    }
}

/// Validates a hex public key.
pub fn is_valid_pubkey(value: &str) -> bool {
    PublicKey::from_hex(value).is_ok()
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_tags(kind: u16, tags: Vec<Vec<&str>>) -> JsonEvent {
        JsonEvent {
            id: "id".to_string(),
            pubkey: "pubkey".to_string(),
            created_at: 100,
            kind,
            tags: tags
                .into_iter()
                .map(|tag| tag.into_iter().map(str::to_string).collect())
                .collect(),
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EventKind::from_u16(3), Some(EventKind::ContactList));
        assert_eq!(EventKind::ContactList.as_u16(), 3);
        assert_eq!(EventKind::from_u16(2), None);
        assert!(EventKind::LongFormContent.is_parameterized_replaceable());
        assert!(!EventKind::RelayList.is_parameterized_replaceable());
    }

    #[test]
    fn test_replaceable_id_only_for_parameterized_kinds() {
        let article = event_with_tags(30023, vec![vec!["d", "my-article"]]);
        assert_eq!(article.replaceable_id(), Some("my-article"));

        let untagged = event_with_tags(30000, vec![]);
        assert_eq!(untagged.replaceable_id(), Some(""));

        let note = event_with_tags(1, vec![vec!["d", "ignored"]]);
        assert_eq!(note.replaceable_id(), None);
    }

    #[test]
    fn test_expiration_tag() {
        let event = event_with_tags(1, vec![vec!["expiration", "50"]]);
        assert_eq!(event.expiration(), Some(50));
        assert!(event.is_expired(50));
        assert!(!event.is_expired(49));

        let garbage = event_with_tags(1, vec![vec!["expiration", "soon"]]);
        assert!(!garbage.is_expired(u64::MAX));
    }

    #[test]
    fn test_tag_values_skip_short_tags() {
        let event = event_with_tags(1, vec![vec!["e"], vec!["e", "one"], vec!["p", "x"], vec!["e", "two"]]);
        let values: Vec<&str> = event.tag_values("e").collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[test]
    fn test_tag_value_outlives_name() {
        let event = event_with_tags(30023, vec![vec!["d"], vec!["d", "slug"], vec!["d", "other"]]);
        let value = {
            let name = String::from("d");
            event.tag_value(&name)
        };
        assert_eq!(value, Some("slug"));
        assert_eq!(event.tag_value("p"), None);
    }

    #[test]
    fn test_signature_verification() {
        let keys = Keys::generate();
        let event = EventBuilder::text_note("hello")
            .sign_with_keys(&keys)
            .unwrap();
        let mut json_event = JsonEvent::from_sdk_event(&event).unwrap();
        assert!(json_event.verify_signature());

        json_event.content = "tampered".to_string();
        assert!(!json_event.verify_signature());
    }
}
