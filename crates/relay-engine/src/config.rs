//! Engine configuration.
//!
//! Defaults carry every tuning constant. [`EngineConfig::from_env`] overlays:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `NOSTR_RELAYS` | `relays` (comma or whitespace separated) |
//! | `RELAY_ENGINE_DB` | `db_path` |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::subscription_manager::AdmissionConfig;

const DEFAULT_DB_PATH: &str = "./data/relay-engine.db";
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bootstrap relays, used until the user's own relay list is known.
    pub relays: Vec<String>,
    pub db_path: PathBuf,
    /// Maximum number of simultaneously open subscriptions.
    pub subscription_limit: usize,
    /// Slots held back for one-time lookups.
    pub min_one_time_subscriptions: usize,
    pub stale_subscription_after: Duration,
    /// Admission queue and socket pool tick.
    pub queue_interval: Duration,
    /// Publish retry and expired-event cleanup tick.
    pub retry_interval: Duration,
    pub parse_batch_size: usize,
    pub parse_idle_backoff: Duration,
    pub parse_queue_capacity: usize,
    /// Connect timeout for pool sockets and the full exchange for one-shot sends.
    pub socket_timeout: Duration,
    /// How far back the retry sweep looks for unpublished events.
    pub publish_retry_window: Duration,
    pub relay_metadata_ttl: Duration,
    pub fetch_relay_metadata: bool,
    /// Relays on these hosts (or their subdomains) are never connected to.
    pub excluded_relay_hosts: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            subscription_limit: 10,
            min_one_time_subscriptions: 1,
            stale_subscription_after: Duration::from_secs(5),
            queue_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(60),
            parse_batch_size: 30,
            parse_idle_backoff: Duration::from_millis(50),
            parse_queue_capacity: 10_000,
            socket_timeout: Duration::from_secs(10),
            publish_retry_window: 5 * DAY,
            relay_metadata_ttl: 3 * DAY,
            fetch_relay_metadata: true,
            excluded_relay_hosts: vec!["nostr.band".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = env::var("NOSTR_RELAYS") {
            config.relays = parse_relays(&value);
        }
        if let Ok(value) = env::var("RELAY_ENGINE_DB") {
            if !value.trim().is_empty() {
                config.db_path = PathBuf::from(value.trim());
            }
        }
        config
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            subscription_limit: self.subscription_limit,
            min_one_time_subscriptions: self.min_one_time_subscriptions,
            stale_after: self.stale_subscription_after,
        }
    }

    pub fn is_excluded_relay(&self, relay: &str) -> bool {
        let host = url::Url::parse(relay)
            .ok()
            .and_then(|url| url.host_str().map(str::to_lowercase));
        let Some(host) = host else {
            return false;
        };
        self.excluded_relay_hosts.iter().any(|excluded| {
            host == *excluded || host.ends_with(&format!(".{excluded}"))
        })
    }
}

pub fn parse_relays(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|relay| !relay.is_empty())
        .map(str::to_string)
        .collect()
}
