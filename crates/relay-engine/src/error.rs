use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::nostr::key::Error),
    #[error("nostr tag error: {0}")]
    NostrTag(#[from] nostr_sdk::nostr::event::tag::Error),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid signature on event {0}")]
    InvalidSignature(String),
    #[error("event {0} is already hydrated")]
    AlreadyHydrated(String),
    #[error("unknown event kind: {0}")]
    UnknownKind(u16),
    #[error("event {0} has expired")]
    ExpiredEvent(String),
    #[error("malformed relay frame: {0}")]
    MalformedFrame(String),
    #[error("unknown relay frame type: {0}")]
    UnknownFrame(String),
    #[error("mutex poisoned")]
    MutexPoisoned,
    #[error("operation timed out")]
    Timeout,
}
