//! Single-writer table of subscriptions and relay sockets.
//!
//! Every read and write goes through one [`tokio::sync::Mutex`], so queueing, admission,
//! reference counting and socket bookkeeping are linearized. The manager only mutates memory
//! and writes frames into socket channels; it never awaits the network.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::filter::{Filter, SubscriptionId};
use crate::message::ClientMessage;
use crate::socket::{RelaySocket, SocketId};
use crate::subscription::{RelayCursor, RelaySubscription};

/// Admission and staleness limits.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum number of simultaneously open subscriptions.
    pub subscription_limit: usize,
    /// Slots long-running subscriptions may never take.
    pub min_one_time_subscriptions: usize,
    /// Age after which an unanswered one-time subscription is dropped.
    pub stale_after: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            subscription_limit: 10,
            min_one_time_subscriptions: 1,
            stale_after: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    /// Kept in queue order so admission is first come, first served.
    subscriptions: Vec<RelaySubscription>,
    sockets: Vec<RelaySocket>,
    next_socket_id: SocketId,
}

impl ManagerState {
    fn position(&self, id: &str) -> Option<usize> {
        self.subscriptions
            .iter()
            .position(|subscription| subscription.subscription_id == id)
    }

    fn socket(&self, url: &str) -> Option<&RelaySocket> {
        self.sockets.iter().find(|socket| socket.url() == url)
    }

    /// Writes `CLOSE` to every relay still holding the subscription and marks them closed.
    fn send_close(&self, subscription: &mut RelaySubscription) {
        let frame = match (ClientMessage::Close {
            subscription_id: &subscription.subscription_id,
        })
        .to_json()
        {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "Could not encode CLOSE");
                return;
            }
        };
        for (relay, cursor) in subscription.relays.iter_mut() {
            if cursor.requested && !cursor.closed {
                if let Some(socket) = self.socket(relay) {
                    socket.send(frame.clone());
                }
            }
            cursor.closed = true;
        }
    }

    fn remove_and_close(&mut self, index: usize) -> RelaySubscription {
        let mut subscription = self.subscriptions.remove(index);
        self.send_close(&mut subscription);
        subscription
    }

    /// Sends `REQ` for every relay entry of an active subscription that has not been asked yet
    /// and has a socket to ask through.
    fn request_pending(&mut self, index: usize) {
        let Self {
            subscriptions,
            sockets,
            ..
        } = self;
        let subscription = &mut subscriptions[index];
        let frame = match (ClientMessage::Req {
            subscription_id: &subscription.subscription_id,
            filter: &subscription.filter,
        })
        .to_json()
        {
            Ok(frame) => frame,
            Err(err) => {
                error!(error = %err, "Could not encode REQ");
                return;
            }
        };
        for (relay, cursor) in subscription.relays.iter_mut() {
            if cursor.requested || cursor.closed {
                continue;
            }
            if let Some(socket) = sockets.iter().find(|socket| socket.url() == relay) {
                if socket.send(frame.clone()) {
                    cursor.requested = true;
                    debug!(subscription_id = %subscription.subscription_id, relay = %relay, "Sent REQ");
                }
            }
        }
    }
}

pub struct SubscriptionManager {
    config: AdmissionConfig,
    state: Mutex<ManagerState>,
}

impl SubscriptionManager {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
        }
    }

    // Subscriptions

    /// Registers interest in `filter` on `relay`. Equal filters share one subscription and bump
    /// its reference count. No network traffic happens until the queue is processed.
    pub async fn queue_subscription(&self, filter: &Filter, relay: &str) -> SubscriptionId {
        let mut state = self.state.lock().await;
        let id = filter.id();
        let index = match state.position(&id) {
            Some(index) => index,
            None => {
                state.subscriptions.push(RelaySubscription::new(filter.clone()));
                state.subscriptions.len() - 1
            }
        };
        let subscription = &mut state.subscriptions[index];
        subscription.reference_count += 1;
        let cursor = subscription.relays.entry(relay.to_string()).or_default();
        if cursor.closed {
            *cursor = RelayCursor::default();
        }
        id
    }

    /// Drops one reference. At zero the subscription is removed, CLOSE is written to its relays
    /// and `false` is returned.
    pub async fn decrement_subscription_count(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return false;
        };
        if state.subscriptions[index].reference_count <= 1 {
            state.remove_and_close(index);
            return false;
        }
        state.subscriptions[index].reference_count -= 1;
        true
    }

    /// Removes a subscription regardless of its reference count.
    pub async fn force_close_subscription(&self, id: &str) -> Option<RelaySubscription> {
        let mut state = self.state.lock().await;
        let index = state.position(id)?;
        Some(state.remove_and_close(index))
    }

    /// Closes one relay's side of a subscription. Returns true if that was the last open relay
    /// and the subscription is gone.
    pub async fn close_relay_subscription(&self, id: &str, relay: &str) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(index) = state.position(id) else {
            return false;
        };
        let frame = ClientMessage::Close { subscription_id: id }.to_json();
        let subscription = &mut state.subscriptions[index];
        if let Some(cursor) = subscription.relays.get_mut(relay) {
            if cursor.requested && !cursor.closed {
                match frame {
                    Ok(frame) => {
                        if let Some(socket) = state.sockets.iter().find(|s| s.url() == relay) {
                            socket.send(frame);
                        }
                    }
                    Err(err) => error!(error = %err, "Could not encode CLOSE"),
                }
            }
            cursor.closed = true;
        }
        if state.subscriptions[index].all_relays_closed() {
            state.subscriptions.remove(index);
            return true;
        }
        false
    }

    /// Records that the relay closed the subscription on its own (`CLOSED`); no frame is sent.
    pub async fn relay_closed_subscription(&self, id: &str, relay: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return false;
        };
        if let Some(cursor) = state.subscriptions[index].relays.get_mut(relay) {
            cursor.closed = true;
        }
        if state.subscriptions[index].all_relays_closed() {
            state.subscriptions.remove(index);
            return true;
        }
        false
    }

    /// Moves the relay's paging cursor and returns the subscription's filter.
    pub async fn record_event(&self, id: &str, relay: &str, created_at: u64) -> Option<Filter> {
        let mut state = self.state.lock().await;
        let index = state.position(id)?;
        let subscription = &mut state.subscriptions[index];
        subscription.record_event(relay, created_at);
        Some(subscription.filter.clone())
    }

    pub async fn subscription(&self, id: &str) -> Option<RelaySubscription> {
        let state = self.state.lock().await;
        state
            .position(id)
            .map(|index| state.subscriptions[index].clone())
    }

    pub async fn all(&self) -> Vec<RelaySubscription> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn active(&self) -> Vec<RelaySubscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|subscription| subscription.is_active())
            .cloned()
            .collect()
    }

    /// Admits waiting subscriptions within the concurrency budget and sends every pending REQ.
    ///
    /// Long-running subscriptions may take at most `limit - min_one_time` slots; one-time
    /// subscriptions fill whatever remains.
    pub async fn process_subscription_queue(&self) {
        let mut state = self.state.lock().await;
        let limit = self.config.subscription_limit;
        let long_capacity = limit.saturating_sub(self.config.min_one_time_subscriptions);

        let active = state.subscriptions.iter().filter(|s| s.is_active()).count();
        let active_long = state
            .subscriptions
            .iter()
            .filter(|s| s.is_active() && !s.is_one_time())
            .count();

        let mut open_slots = limit.saturating_sub(active);
        let mut long_slots = long_capacity.saturating_sub(active_long).min(open_slots);
        let now = Instant::now();

        for subscription in state.subscriptions.iter_mut() {
            if long_slots == 0 {
                break;
            }
            if !subscription.is_active() && !subscription.is_one_time() {
                subscription.start_date = Some(now);
                long_slots -= 1;
                open_slots -= 1;
                debug!(subscription_id = %subscription.subscription_id, "Admitted subscription");
            }
        }
        for subscription in state.subscriptions.iter_mut() {
            if open_slots == 0 {
                break;
            }
            if !subscription.is_active() && subscription.is_one_time() {
                subscription.start_date = Some(now);
                open_slots -= 1;
                debug!(subscription_id = %subscription.subscription_id, "Admitted one-time subscription");
            }
        }

        for index in 0..state.subscriptions.len() {
            if state.subscriptions[index].is_active() {
                state.request_pending(index);
            }
        }

        let active = state.subscriptions.iter().filter(|s| s.is_active()).count();
        debug!(
            active,
            waiting = state.subscriptions.len() - active,
            "Processed subscription queue"
        );
    }

    /// Removes active one-time subscriptions older than the staleness limit, closes them on
    /// their relays, and returns them.
    pub async fn stale_subscriptions(&self) -> Vec<RelaySubscription> {
        let mut state = self.state.lock().await;
        let stale_after = self.config.stale_after;
        let stale_ids: Vec<SubscriptionId> = state
            .subscriptions
            .iter()
            .filter(|subscription| {
                subscription.is_one_time()
                    && subscription
                        .start_date
                        .is_some_and(|started| started.elapsed() >= stale_after)
            })
            .map(|subscription| subscription.subscription_id.clone())
            .collect();

        let mut stale = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(index) = state.position(&id) {
                stale.push(state.remove_and_close(index));
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Closed stale one-time subscriptions");
        }
        stale
    }

    // Sockets

    /// Creates the socket handle for `url` unless one already exists. The caller owns the
    /// returned receiver and is expected to hand it to a connection task.
    pub async fn add_socket(&self, url: &str) -> Option<(RelaySocket, mpsc::UnboundedReceiver<String>)> {
        let mut state = self.state.lock().await;
        if state.socket(url).is_some() {
            return None;
        }
        state.next_socket_id += 1;
        let (socket, receiver) = RelaySocket::new(state.next_socket_id, url);
        state.sockets.push(socket.clone());
        Some((socket, receiver))
    }

    /// Deliberately closes the socket for `url`. Dropping the handle ends its connection task.
    pub async fn close_socket(&self, url: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.sockets.iter().position(|socket| socket.url() == url) else {
            return false;
        };
        state.sockets.remove(index);
        reset_relay(&mut state, url);
        true
    }

    /// Forgets a socket that disconnected or failed. Ids guard against removing a newer
    /// socket for the same relay.
    pub async fn remove_socket(&self, socket_id: SocketId) -> Option<RelaySocket> {
        let mut state = self.state.lock().await;
        let index = state
            .sockets
            .iter()
            .position(|socket| socket.id() == socket_id)?;
        let socket = state.sockets.remove(index);
        reset_relay(&mut state, socket.url());
        Some(socket)
    }

    pub async fn socket(&self, url: &str) -> Option<RelaySocket> {
        self.state.lock().await.socket(url).cloned()
    }

    pub async fn sockets(&self) -> Vec<RelaySocket> {
        self.state.lock().await.sockets.clone()
    }

    pub async fn close_all_sockets(&self) {
        let mut state = self.state.lock().await;
        let urls: Vec<String> = state.sockets.iter().map(|s| s.url().to_string()).collect();
        state.sockets.clear();
        for url in urls {
            reset_relay(&mut state, &url);
        }
    }
}

/// Subscriptions that were requested through a lost socket must be asked again.
fn reset_relay(state: &mut ManagerState, url: &str) {
    for subscription in state.subscriptions.iter_mut() {
        if let Some(cursor) = subscription.relays.get_mut(url) {
            if !cursor.closed {
                cursor.requested = false;
            }
        }
    }
}
