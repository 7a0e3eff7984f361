use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nostr_sdk::prelude::Keys;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use relay_engine::{
    EngineConfig, EventDraft, EventKind, EventSigner, JsonEvent, KeysSigner, RelayService, Store,
};

/// A relay that answers every REQ with one profile of `author` followed by EOSE, and accepts
/// every published event. Every frame it receives is forwarded to the returned channel.
async fn mock_relay(author: Keys) -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let profile = KeysSigner
        .sign(&EventDraft::new(EventKind::Metadata, r#"{"name":"alice"}"#), &author)
        .await
        .unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let profile = profile.clone();
            let seen = seen_tx.clone();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    let _ = seen.send(frame.clone());
                    let replies = match frame[0].as_str() {
                        Some("REQ") => vec![
                            json!(["EVENT", frame[1], profile]),
                            json!(["EOSE", frame[1]]),
                        ],
                        Some("EVENT") => vec![json!(["OK", frame[1]["id"], true, ""])],
                        _ => Vec::new(),
                    };
                    for reply in replies {
                        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (url, seen_rx)
}

async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn fetches_profile_and_publishes_through_mock_relay() {
    let author = Keys::generate();
    let (relay, mut seen) = mock_relay(author.clone()).await;

    let store = Store::open_in_memory().unwrap();
    let keys = Keys::generate();
    let config = EngineConfig {
        relays: vec![relay.clone()],
        fetch_relay_metadata: false,
        ..EngineConfig::default()
    };
    let service = RelayService::new(config, keys.clone(), store.clone()).unwrap();
    service.start().await;

    let author_key = author.public_key().to_hex();
    service.request_metadata(&author_key, None).await;

    assert!(
        eventually(|| {
            store
                .read(|tx| tx.author_metadata(&author_key))
                .unwrap()
                .and_then(|metadata| metadata.name)
                .as_deref()
                == Some("alice")
        })
        .await
    );

    let event: JsonEvent = service
        .publish_to_all(&EventDraft::new(EventKind::Text, "gm"), &keys)
        .await
        .unwrap();
    assert!(
        eventually(|| {
            store.read(|tx| tx.published_to(&event.id)).unwrap() == vec![relay.clone()]
        })
        .await
    );

    // The fulfilled lookup was closed on the relay.
    let mut kinds = Vec::new();
    while let Ok(frame) = seen.try_recv() {
        kinds.push(frame[0].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(kinds.first().map(String::as_str), Some("REQ"));
    assert!(kinds.iter().any(|kind| kind == "CLOSE"));
    assert_eq!(kinds.last().map(String::as_str), Some("EVENT"));
    assert_eq!(service.retry_failed_publishes().await.unwrap(), 0);

    service.shutdown().await;
}

#[tokio::test]
#[ignore]
async fn publish_against_live_relay() {
    let relay = std::env::var("NOSTR_TEST_RELAY").expect("NOSTR_TEST_RELAY missing");
    let secret = std::env::var("NOSTR_TEST_KEY").expect("NOSTR_TEST_KEY missing");
    let keys = Keys::parse(&secret).expect("invalid secret key");

    let store = Store::open_in_memory().unwrap();
    let config = EngineConfig {
        relays: vec![relay],
        ..EngineConfig::default()
    };
    let service = RelayService::new(config, keys.clone(), store.clone()).unwrap();
    service.start().await;

    let draft = EventDraft::new(
        EventKind::Text,
        format!("relay-engine test {}", relay_engine::unix_timestamp()),
    );
    let event = service.publish_to_all(&draft, &keys).await.unwrap();
    assert!(
        eventually(|| !store.read(|tx| tx.published_to(&event.id)).unwrap().is_empty()).await
    );
    service.shutdown().await;
}
