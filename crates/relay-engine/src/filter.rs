use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::event::{EventKind, JsonEvent};

/// Identity of a subscription, derived from the filter content.
pub type SubscriptionId = String;

/// An immutable query descriptor sent to relays inside a `REQ` frame.
///
/// Two filters with the same content produce the same [`Filter::id`] no matter the order in
/// which list fields were populated, so independent callers asking the same question share
/// one relay subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub author_keys: Vec<String>,
    pub event_ids: Vec<String>,
    pub kinds: Vec<EventKind>,
    pub e_tags: Vec<String>,
    pub p_tags: Vec<String>,
    pub d_tags: Vec<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Only keep events whose author is inside the user's network.
    pub in_network: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.author_keys.extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn e_tags<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.e_tags.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn p_tags<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.p_tags.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn d_tags<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.d_tags.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn in_network(mut self, in_network: bool) -> Self {
        self.in_network = in_network;
        self
    }

    /// Deterministic identity: sha256 over a JSON array of every field, list fields sorted
    /// first. JSON keeps field boundaries unambiguous whatever the values contain.
    pub fn id(&self) -> SubscriptionId {
        let mut kinds: Vec<u16> = self.kinds.iter().map(|kind| kind.as_u16()).collect();
        kinds.sort_unstable();
        kinds.dedup();

        let canonical = json!([
            sorted(&self.author_keys),
            sorted(&self.event_ids),
            kinds,
            sorted(&self.e_tags),
            sorted(&self.p_tags),
            sorted(&self.d_tags),
            self.search,
            self.limit,
            self.since,
            self.until,
            self.in_network,
        ]);

        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    /// `limit == 1` filters close themselves once satisfied.
    pub fn is_one_time(&self) -> bool {
        self.limit == Some(1)
    }

    /// True when a one-time filter has received the single event it asked for.
    pub fn is_fulfilled(&self, event: &JsonEvent) -> bool {
        if !self.is_one_time() {
            return false;
        }
        let kind_matches = self.kinds.is_empty()
            || self
                .kinds
                .iter()
                .any(|kind| kind.as_u16() == event.kind);
        let author_matches =
            self.author_keys.is_empty() || self.author_keys.contains(&event.pubkey);
        let id_matches = self.event_ids.is_empty() || self.event_ids.contains(&event.id);
        let d_matches = self.d_tags.is_empty()
            || event
                .tag_value("d")
                .is_some_and(|value| self.d_tags.iter().any(|d| d == value));

        kind_matches && author_matches && id_matches && d_matches
    }

    /// The `filterObject` of a `REQ` frame. Empty lists are omitted.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        insert_list(&mut object, "authors", &self.author_keys);
        insert_list(&mut object, "ids", &self.event_ids);
        if !self.kinds.is_empty() {
            let kinds: Vec<u16> = self.kinds.iter().map(|kind| kind.as_u16()).collect();
            object.insert("kinds".to_string(), json!(kinds));
        }
        insert_list(&mut object, "#e", &self.e_tags);
        insert_list(&mut object, "#p", &self.p_tags);
        insert_list(&mut object, "#d", &self.d_tags);
        if let Some(search) = &self.search {
            object.insert("search".to_string(), json!(search));
        }
        if let Some(limit) = self.limit {
            object.insert("limit".to_string(), json!(limit));
        }
        if let Some(since) = self.since {
            object.insert("since".to_string(), json!(since));
        }
        if let Some(until) = self.until {
            object.insert("until".to_string(), json!(until));
        }
        Value::Object(object)
    }
}

fn sorted(values: &[String]) -> Vec<&str> {
    let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
}

fn insert_list(object: &mut Map<String, Value>, key: &str, values: &[String]) {
    if !values.is_empty() {
        object.insert(key.to_string(), json!(values));
    }
}
