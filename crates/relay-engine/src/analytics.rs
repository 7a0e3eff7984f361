use tracing::{info, warn};

/// Fire-and-forget sink for relay-side problems worth counting.
pub trait Analytics: Send + Sync {
    fn rate_limited(&self, relay: &str, message: &str);
    fn relay_error(&self, relay: &str, message: &str);
    fn publish_rejected(&self, relay: &str, event_id: &str, message: &str);
    fn invalid_signature(&self, relay: &str, event_id: &str);
}

/// Reports everything as log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAnalytics;

impl Analytics for TracingAnalytics {
    fn rate_limited(&self, relay: &str, message: &str) {
        info!(relay = %relay, message = %message, "Relay rate limited us");
    }

    fn relay_error(&self, relay: &str, message: &str) {
        warn!(relay = %relay, message = %message, "Relay reported an error");
    }

    fn publish_rejected(&self, relay: &str, event_id: &str, message: &str) {
        warn!(relay = %relay, event_id = %event_id, message = %message, "Relay rejected event");
    }

    fn invalid_signature(&self, relay: &str, event_id: &str) {
        warn!(relay = %relay, event_id = %event_id, "Relay sent event with invalid signature");
    }
}
