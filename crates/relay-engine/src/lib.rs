//! Client-side Nostr relay protocol engine.
//!
//! The engine keeps a pool of relay WebSockets, shares subscriptions between callers that ask
//! the same question, verifies and stores incoming events in SQLite, and publishes the user's
//! events with at-least-once delivery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          RELAY-ENGINE                            │
//! │                                                                  │
//! │  callers ──► RelayService ──► SubscriptionManager ──► sockets    │
//! │               │   ▲             (queue, budget,        │         │
//! │               │   │              refcounts)            ▼         │
//! │               │   └───── frame dispatch ◄───────── Nostr relays  │
//! │               │              │                                   │
//! │               ▼              ▼                                   │
//! │         publish/retry    ParseQueue ──► EventProcessor           │
//! │               │                            │                     │
//! │               ▼                            ▼                     │
//! │            SQLite Store ◄──────────────────┘                     │
//! │               │ follow changes                                   │
//! │               ▼                                                  │
//! │         SocialGraphCache (in-network gating)                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Event Kinds
//!
//! Only the kinds in [`EventKind`] are stored. Contact lists (3), metadata (0) and relay lists
//! (10002) update author rows as a side effect; other kinds record their `e`, `a` and `p`
//! references, creating stubs for events that have not arrived yet. Deletions (5) also mark
//! their author's targets as deleted on the relay that delivered or acknowledged them.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_engine::{EngineConfig, EventDraft, EventKind, RelayService, Store};
//! use nostr_sdk::prelude::Keys;
//!
//! let config = EngineConfig::from_env();
//! let store = Store::open(&config.db_path)?;
//! let keys = Keys::generate();
//! let service = RelayService::new(config, keys.clone(), store)?;
//! service.start().await;
//!
//! let ids = service.request_metadata(&keys.public_key().to_hex(), None).await;
//! service.publish_to_all(&EventDraft::new(EventKind::Text, "gm"), &keys).await?;
//! for id in ids {
//!     service.decrement_subscription_count(&id).await;
//! }
//! ```

mod analytics;
mod config;
mod error;
mod event;
mod filter;
mod message;
mod nip05;
mod parse_queue;
mod processor;
mod relay_metadata;
mod service;
mod signer;
mod social_graph;
mod socket;
mod store;
mod subscription;
mod subscription_manager;

pub use analytics::{Analytics, TracingAnalytics};
pub use config::{parse_relays, EngineConfig};
pub use error::Error;
pub use event::{is_valid_pubkey, unix_timestamp, EventId, EventKind, JsonEvent, PubKey};
pub use filter::{Filter, SubscriptionId};
pub use message::{ClientMessage, RelayMessage};
pub use nip05::{well_known_url, Nip05Client};
pub use parse_queue::{ParseQueue, QueuedEvent};
pub use processor::EventProcessor;
pub use relay_metadata::{metadata_url, RelayMetadata, RelayMetadataClient, NOSTR_JSON_MIME};
pub use service::{PagedSubscription, RelayService};
pub use signer::{EventDraft, EventSigner, KeysSigner};
pub use social_graph::SocialGraphCache;
pub use socket::{parse_relay_url, RelaySocket, SocketEvent, SocketId};
pub use store::{AuthorMetadata, Follow, Store, StoreChange, StoreTx, StoredEvent};
pub use subscription::{RelayCursor, RelaySubscription};
pub use subscription_manager::{AdmissionConfig, SubscriptionManager};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
