use crate::clock::Clock;
use crate::config::Channel;
use crate::records::LivenessRecord;
use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Heartbeat of the local dispatcher.
///
/// The dispatcher refreshes the channel's heartbeat record on every tick and the gateway treats
/// the dispatcher as alive while the record is younger than the freshness window.
/// This is a best-effort "someone is probably listening" signal, not a lease.
#[derive(Clone)]
pub struct LivenessMonitor {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    channel: Channel,
    freshness_window: Duration,
}

impl LivenessMonitor {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, channel: Channel, freshness_window: Duration) -> Self {
        Self {
            store,
            clock,
            channel,
            freshness_window,
        }
    }

    /// Sets the heartbeat to the current time. Failures are logged and retried on the next tick.
    pub async fn refresh(&self) {
        let record = LivenessRecord {
            channel: self.channel.liveness_key(),
            ttl: self.clock.now_secs(),
        };

        if let Err(e) = self.store.put_liveness(&record).await {
            error!("Failed to refresh the heartbeat of {}: {e}", self.channel);
        }
    }

    /// True if the heartbeat exists and is fresher than the window.
    /// An unreadable heartbeat counts as no heartbeat so the gateway falls back to the original handler.
    pub async fn is_alive(&self) -> bool {
        let record = match self.store.get_liveness(&self.channel).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!("No heartbeat for {}", self.channel);
                return false;
            }
            Err(e) => {
                warn!("Failed to read the heartbeat of {}: {e}", self.channel);
                return false;
            }
        };

        let age = self.clock.now_secs() - record.ttl;
        debug!("Heartbeat of {} is {age}s old", self.channel);

        age < self.freshness_window.as_secs() as i64
    }
}
