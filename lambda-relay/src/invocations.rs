//! Channel-scoped lifecycle of invocation records on top of a [TransportStore].
//!
//! Store failures end here: they are logged and the callers get an empty or absent result,
//! so the polling loops simply try again on the next tick.
use crate::clock::Clock;
use crate::config::Channel;
use crate::records::{error_payload, InvocationRecord, InvocationRequest, InvokeStatus, RecordKey};
use crate::store::{MalformedRecord, SharedStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the gateway found when it checked for a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultPoll {
    /// The record is still pending or in-progress, or it could not be read this time
    Waiting,
    /// The record reached completed or failed
    Ready(InvocationRecord),
    /// The record no longer exists: the dispatcher discarded it or it was cleaned up
    Gone,
}

/// Terminal outcome of running a local handler for a claimed record.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Serialized handler response
    Completed(String),
    /// Serialized `{"error": "..."}` payload
    Failed(String),
}

/// Invocation records of a single channel.
#[derive(Clone)]
pub struct InvocationLog {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    channel: Channel,
    record_ttl: Duration,
}

impl InvocationLog {
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, channel: Channel, record_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            channel,
            record_ttl,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// A new invocation ID: creation time in millis for ordering + a random part for uniqueness
    /// when multiple invocations are enqueued within the same millisecond.
    pub fn new_invoke_id(&self) -> String {
        format!("{:013}-{}", self.clock.now_millis(), Uuid::new_v4().simple())
    }

    /// Writes a pending record for the request. Returns the invocation ID, or None if the record
    /// could not be written.
    pub async fn enqueue(&self, request: &InvocationRequest) -> Option<String> {
        let payload = match serde_json::to_string(request) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to serialize the invocation request: {:?}", e);
                return None;
            }
        };

        let record = InvocationRecord {
            channel: self.channel.as_str().to_owned(),
            invoke_id: self.new_invoke_id(),
            payload,
            status: InvokeStatus::Pending,
            result: None,
            ttl: self.clock.now_secs() + self.record_ttl.as_secs() as i64,
        };

        match self.store.put(&record).await {
            Ok(()) => {
                debug!("Enqueued {}", record.key());
                Some(record.invoke_id)
            }
            Err(e) => {
                error!("Failed to enqueue invocation for {}: {e}", self.channel);
                None
            }
        }
    }

    /// Finds pending records and marks them in-progress with a single batch write.
    /// Returns the claimed records in their new status.
    /// Pending rows that cannot be decoded are replaced with failed records.
    ///
    /// There is no conditional write here: two dispatchers on the same channel could claim
    /// the same record. Only one dispatcher per channel is supported.
    pub async fn claim_pending(&self) -> Vec<InvocationRecord> {
        let pending = match self.store.query(&self.channel, InvokeStatus::Pending).await {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to fetch pending invocations for {}: {e}", self.channel);
                return Vec::new();
            }
        };

        for malformed in &pending.malformed {
            self.release_malformed(malformed).await;
        }

        if pending.records.is_empty() {
            return Vec::new();
        }

        let claimed: Vec<InvocationRecord> = pending
            .records
            .iter()
            .filter_map(|record| record.advance(InvokeStatus::InProgress, None))
            .collect();

        // the records are processed even if the claim was not written, otherwise they would sit in pending
        if let Err(e) = self.store.batch_put(&claimed).await {
            warn!("Failed to mark {} invocations as in-progress: {e}", claimed.len());
        }

        claimed
    }

    /// Overwrites a pending row that cannot be decoded with a failed record holding the reason,
    /// so the gateway waiting for it gets an error instead of polling until its deadline.
    async fn release_malformed(&self, malformed: &MalformedRecord) {
        error!("Cannot decode invocation {}: {}", malformed.key, malformed.reason);

        let record = InvocationRecord {
            channel: malformed.key.channel.clone(),
            invoke_id: malformed.key.invoke_id.clone(),
            payload: String::new(),
            status: InvokeStatus::Failed,
            result: Some(error_payload(&format!("Invalid invocation record: {}", malformed.reason))),
            ttl: self.clock.now_secs() + self.record_ttl.as_secs() as i64,
        };

        if let Err(e) = self.store.put(&record).await {
            error!("Failed to mark {} as failed: {e}", malformed.key);
        }
    }

    /// Writes the terminal status of a claimed record. Returns the written record, or None if the record
    /// was not in-progress or the write failed.
    pub async fn finish(&self, record: &InvocationRecord, outcome: HandlerOutcome) -> Option<InvocationRecord> {
        let (status, result) = match outcome {
            HandlerOutcome::Completed(v) => (InvokeStatus::Completed, v),
            HandlerOutcome::Failed(v) => (InvokeStatus::Failed, v),
        };

        let done = match record.advance(status, Some(result)) {
            Some(v) => v,
            None => {
                error!(
                    "Cannot move {} from {} to {status}. It's a bug.",
                    record.key(),
                    record.status
                );
                return None;
            }
        };

        match self.store.put(&done).await {
            Ok(()) => {
                debug!("{} is {status}", done.key());
                Some(done)
            }
            Err(e) => {
                error!("Failed to write the result of {}: {e}", done.key());
                None
            }
        }
    }

    /// Checks if the invocation reached a terminal status.
    pub async fn poll_result(&self, invoke_id: &str) -> ResultPoll {
        let key = RecordKey::new(&self.channel, invoke_id);
        match self.store.get(&key).await {
            Ok(Some(record)) if record.status.is_terminal() => ResultPoll::Ready(record),
            Ok(Some(_)) => ResultPoll::Waiting,
            Ok(None) => ResultPoll::Gone,
            Err(e) => {
                warn!("Failed to read the result of {key}: {e}");
                ResultPoll::Waiting
            }
        }
    }

    /// Deletes a single record.
    pub async fn discard(&self, invoke_id: &str) {
        let key = RecordKey::new(&self.channel, invoke_id);
        match self.store.delete(&key).await {
            Ok(()) => debug!("Deleted {key}"),
            Err(e) => error!("Failed to delete {key}: {e}"),
        }
    }

    /// Deletes every record of the channel, page by page. Returns the number of deleted records.
    /// Stops at the first failure and reports what was deleted up to that point.
    pub async fn purge(&self) -> usize {
        let mut deleted = 0;
        let mut start = None;

        loop {
            let page = match self.store.scan(&self.channel, start).await {
                Ok(v) => v,
                Err(e) => {
                    error!("Failed to list invocations of {}: {e}", self.channel);
                    break;
                }
            };

            if !page.keys.is_empty() {
                match self.store.batch_delete(&page.keys).await {
                    Ok(v) => deleted += v,
                    Err(e) => {
                        error!("Failed to delete invocations of {}: {e}", self.channel);
                        break;
                    }
                }
            }

            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        info!("Deleted {deleted} invocations of {}", self.channel);
        deleted
    }
}
