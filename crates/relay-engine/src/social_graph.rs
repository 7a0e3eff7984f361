//! Cached answers to "is this author in my network?".
//!
//! Three sets live behind one async mutex: the user's one-hop follows (always including the
//! user), a positive two-hop cache and a negative cache. The one-hop set is authoritative and
//! kept current from store change notifications; the other two fill lazily from single
//! database queries. Any unfollow anywhere in the graph clears both lazy caches.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::{Store, StoreChange};
use crate::Error;

#[derive(Debug, Default)]
struct GraphState {
    followed: HashSet<String>,
    two_hop: HashSet<String>,
    out_of_network: HashSet<String>,
}

impl GraphState {
    fn clear_lazy(&mut self) {
        self.two_hop.clear();
        self.out_of_network.clear();
    }
}

pub struct SocialGraphCache {
    user_key: String,
    store: Store,
    state: Mutex<GraphState>,
    cancel: CancellationToken,
}

impl SocialGraphCache {
    /// Loads the user's follows and starts following store changes. Must be called inside a
    /// tokio runtime.
    pub fn new(store: Store, user_key: impl Into<String>) -> Result<Arc<Self>, Error> {
        let user_key = user_key.into();
        let changes = store.subscribe();
        let followed = load_followed(&store, &user_key)?;

        let cache = Arc::new(Self {
            user_key,
            store,
            state: Mutex::new(GraphState {
                followed,
                ..GraphState::default()
            }),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(watch_changes(
            Arc::downgrade(&cache),
            changes,
            cache.cancel.clone(),
        ));
        Ok(cache)
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    /// Whether the user directly follows `key`. The user counts as following themselves.
    pub async fn follows(&self, key: &str) -> bool {
        self.state.lock().await.followed.contains(key)
    }

    /// One-hop or two-hop membership. Cache misses cost one query and are remembered.
    pub async fn is_in_network(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.followed.contains(key) || state.two_hop.contains(key) {
            return true;
        }
        if state.out_of_network.contains(key) {
            return false;
        }

        match self.store.read(|tx| tx.is_two_hop(&self.user_key, key)) {
            Ok(true) => {
                state.two_hop.insert(key.to_string());
                true
            }
            Ok(false) => {
                state.out_of_network.insert(key.to_string());
                false
            }
            Err(err) => {
                warn!(error = %err, key = %key, "Network membership query failed");
                false
            }
        }
    }

    /// Drops the lazily built caches. The one-hop set is kept.
    pub async fn handle_memory_pressure(&self) {
        self.state.lock().await.clear_lazy();
        debug!("Cleared social graph caches");
    }

    async fn apply_change(&self, change: StoreChange) {
        let StoreChange::FollowsChanged {
            author,
            added,
            removed,
        } = change;
        let mut state = self.state.lock().await;

        if author == self.user_key {
            for key in &added {
                state.two_hop.remove(key);
                state.followed.insert(key.clone());
            }
            for key in &removed {
                if *key != self.user_key {
                    state.followed.remove(key);
                }
            }
            // New follows bring new two-hop keys we may have cached as outsiders.
            if !removed.is_empty() {
                state.clear_lazy();
            } else if !added.is_empty() {
                state.out_of_network.clear();
            }
        } else if state.followed.contains(&author) {
            if !removed.is_empty() {
                state.clear_lazy();
            }
            for key in added {
                state.out_of_network.remove(&key);
                if !state.followed.contains(&key) {
                    state.two_hop.insert(key);
                }
            }
        } else if !removed.is_empty() {
            state.clear_lazy();
        }
    }

    async fn rebuild(&self) {
        match load_followed(&self.store, &self.user_key) {
            Ok(followed) => {
                let mut state = self.state.lock().await;
                state.followed = followed;
                state.clear_lazy();
            }
            Err(err) => warn!(error = %err, "Could not reload follows"),
        }
    }
}

impl Drop for SocialGraphCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn load_followed(store: &Store, user_key: &str) -> Result<HashSet<String>, Error> {
    let mut followed: HashSet<String> = store.read(|tx| tx.follows(user_key))?.into_iter().collect();
    followed.insert(user_key.to_string());
    Ok(followed)
}

async fn watch_changes(
    cache: Weak<SocialGraphCache>,
    mut changes: broadcast::Receiver<StoreChange>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = changes.recv() => received,
        };
        let Some(cache) = cache.upgrade() else {
            break;
        };
        match received {
            Ok(change) => cache.apply_change(change).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed follow changes, rebuilding social graph cache");
                cache.rebuild().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::Follow;

    fn follow(store: &Store, source: &str, keys: &[&str]) {
        let follows: Vec<Follow> = keys.iter().map(|key| Follow::new(*key)).collect();
        store
            .write(|tx| {
                let at = tx.contact_list_updated_at(source)?.unwrap_or_default() + 1;
                tx.replace_follows(source, &follows, at)
            })
            .unwrap();
    }

    async fn eventually(cache: &SocialGraphCache, key: &str, expected: bool) -> bool {
        for _ in 0..100 {
            if cache.is_in_network(key).await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_one_and_two_hop_membership() {
        let store = Store::open_in_memory().unwrap();
        follow(&store, "me", &["x", "y"]);
        follow(&store, "x", &["z"]);

        let cache = SocialGraphCache::new(store.clone(), "me").unwrap();
        assert!(cache.follows("me").await);
        assert!(cache.follows("x").await);
        assert!(cache.is_in_network("x").await);
        assert!(cache.is_in_network("z").await);
        assert!(!cache.follows("z").await);
        assert!(!cache.is_in_network("stranger").await);
    }

    #[tokio::test]
    async fn test_unfollow_invalidates_two_hop() {
        let store = Store::open_in_memory().unwrap();
        follow(&store, "me", &["x", "y"]);
        follow(&store, "x", &["z"]);
        let cache = SocialGraphCache::new(store.clone(), "me").unwrap();
        assert!(cache.is_in_network("z").await);

        follow(&store, "me", &["y"]);

        assert!(eventually(&cache, "z", false).await);
        assert!(!cache.follows("x").await);
        assert!(cache.follows("y").await);
    }

    #[tokio::test]
    async fn test_new_follow_of_followed_author_clears_negative_entry() {
        let store = Store::open_in_memory().unwrap();
        follow(&store, "me", &["x"]);
        let cache = SocialGraphCache::new(store.clone(), "me").unwrap();
        assert!(!cache.is_in_network("w").await);

        follow(&store, "x", &["w"]);
        assert!(eventually(&cache, "w", true).await);
    }

    #[tokio::test]
    async fn test_user_follow_moves_key_out_of_two_hop() {
        let store = Store::open_in_memory().unwrap();
        follow(&store, "me", &["x"]);
        follow(&store, "x", &["z"]);
        let cache = SocialGraphCache::new(store.clone(), "me").unwrap();
        assert!(cache.is_in_network("z").await);

        follow(&store, "me", &["x", "z"]);
        for _ in 0..100 {
            if cache.follows("z").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.follows("z").await);
        let state = cache.state.lock().await;
        assert!(!state.two_hop.contains("z"));
    }

    #[tokio::test]
    async fn test_memory_pressure_keeps_one_hop() {
        let store = Store::open_in_memory().unwrap();
        follow(&store, "me", &["x"]);
        follow(&store, "x", &["z"]);
        let cache = SocialGraphCache::new(store.clone(), "me").unwrap();
        assert!(cache.is_in_network("z").await);
        assert!(!cache.is_in_network("w").await);

        cache.handle_memory_pressure().await;
        {
            let state = cache.state.lock().await;
            assert!(state.two_hop.is_empty());
            assert!(state.out_of_network.is_empty());
            assert!(state.followed.contains("x"));
        }
        assert!(cache.is_in_network("z").await);
    }
}
