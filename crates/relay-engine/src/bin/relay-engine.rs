use std::path::PathBuf;

use clap::Parser;
use nostr_sdk::prelude::{Keys, ToBech32};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_engine::{EngineConfig, EventDraft, EventKind, Filter, RelayService, Store};

#[derive(Debug, Parser)]
#[command(name = "relay-engine")]
#[command(about = "Sync a Nostr account's profile, follows and feed into SQLite")]
struct Args {
    /// Bootstrap relays; falls back to NOSTR_RELAYS.
    #[arg(long)]
    relay: Vec<String>,
    #[arg(long, env = "RELAY_ENGINE_DB")]
    db: Option<PathBuf>,
    /// Hex or nsec secret key. A fresh key is generated when absent.
    #[arg(long, env = "NOSTR_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,
    /// Publish a text note to the user's relays after start.
    #[arg(long)]
    publish: Option<String>,
    /// Also follow the in-network text feed.
    #[arg(long)]
    follow_feed: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if !args.relay.is_empty() {
        config.relays = args.relay;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if config.relays.is_empty() {
        return Err("no relays configured (use --relay or NOSTR_RELAYS)".into());
    }

    let keys = match args.secret_key {
        Some(secret) => Keys::parse(&secret)?,
        None => {
            let keys = Keys::generate();
            warn!(npub = %keys.public_key().to_bech32()?, "Using a throwaway key");
            keys
        }
    };
    let user = keys.public_key().to_hex();

    let store = Store::open(&config.db_path)?;
    info!(db = %config.db_path.display(), relays = config.relays.len(), "Starting relay engine");
    let service = RelayService::new(config, keys.clone(), store)?;
    service.start().await;

    let mut subscriptions = service.request_metadata(&user, None).await;
    subscriptions.extend(service.request_contact_list(&user, None).await);
    if args.follow_feed {
        let feed = Filter::new()
            .kinds([EventKind::Text])
            .since(relay_engine::unix_timestamp())
            .in_network(true);
        subscriptions.extend(service.open_subscriptions(&feed, None).await);
    }

    if let Some(text) = args.publish {
        let event = service
            .publish_to_all(&EventDraft::new(EventKind::Text, text), &keys)
            .await?;
        info!(event_id = %event.id, "Queued note for publishing");
    }

    tokio::signal::ctrl_c().await?;
    for id in subscriptions {
        service.decrement_subscription_count(&id).await;
    }
    service.shutdown().await;
    Ok(())
}
