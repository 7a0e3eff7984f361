use async_trait::async_trait;
use nostr_sdk::prelude::*;

use crate::event::{EventKind, JsonEvent};
use crate::Error;

/// An event that has not been signed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub kind: EventKind,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    /// Defaults to the signing time.
    pub created_at: Option<u64>,
}

impl EventDraft {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(parts.into_iter().map(Into::into).collect());
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Capability that turns a draft into a signed event. Encryption envelopes (gift wraps and
/// the like) live behind this seam too.
#[async_trait]
pub trait EventSigner: Send + Sync {
    async fn sign(&self, draft: &EventDraft, keys: &Keys) -> Result<JsonEvent, Error>;
}

/// Signs locally with nostr-sdk keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeysSigner;

#[async_trait]
impl EventSigner for KeysSigner {
    async fn sign(&self, draft: &EventDraft, keys: &Keys) -> Result<JsonEvent, Error> {
        let tags = draft
            .tags
            .iter()
            .map(|parts| Tag::parse(parts.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder =
            EventBuilder::new(Kind::from(draft.kind.as_u16()), draft.content.clone()).tags(tags);
        if let Some(created_at) = draft.created_at {
            builder = builder.custom_created_at(Timestamp::from(created_at));
        }

        let event = builder
            .sign_with_keys(keys)
            .map_err(|err| Error::Signing(err.to_string()))?;
        JsonEvent::from_sdk_event(&event)
    }
}
