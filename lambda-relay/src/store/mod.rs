//! The durable key-value table used as the message channel between the gateway and the dispatcher.
use crate::config::Channel;
use crate::error::StoreError;
use crate::records::{InvocationRecord, InvokeStatus, LivenessRecord, RecordKey};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) mod codec;
pub mod dynamo;
pub mod memory;

/// DynamoDB BatchWriteItem accepts up to 25 put or delete requests.
pub const MAX_BATCH_SIZE: usize = 25;

/// One page of keys returned by [TransportStore::scan].
#[derive(Debug, Default, Clone)]
pub struct ScanPage {
    pub keys: Vec<RecordKey>,
    /// Pass it back to `scan` to get the next page. None on the last page.
    pub next: Option<RecordKey>,
}

/// A row of the channel that exists but cannot be decoded into an [InvocationRecord],
/// e.g. a missing body or a corrupt compressed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub key: RecordKey,
    pub reason: String,
}

/// Rows matched by [TransportStore::query].
#[derive(Debug, Default, Clone)]
pub struct QueryResult {
    pub records: Vec<InvocationRecord>,
    /// Matching rows that could not be decoded. They are reported instead of failing the query
    /// so that one bad row does not hide the others.
    pub malformed: Vec<MalformedRecord>,
}

/// Operations the relay needs from the table.
///
/// Implementations report every failure as a [StoreError]. It is up to the callers to decide
/// if a failure is worth more than a log entry, which for the polling loops it rarely is.
#[async_trait]
pub trait TransportStore: Send + Sync {
    /// Creates or replaces an invocation record.
    async fn put(&self, record: &InvocationRecord) -> Result<(), StoreError>;

    /// Reads a record with a strongly consistent read so a record written a moment ago is not missed.
    async fn get(&self, key: &RecordKey) -> Result<Option<InvocationRecord>, StoreError>;

    /// All records of the channel in the given status.
    async fn query(&self, channel: &Channel, status: InvokeStatus) -> Result<QueryResult, StoreError>;

    /// Creates or replaces multiple records, chunked into [MAX_BATCH_SIZE] requests.
    async fn batch_put(&self, records: &[InvocationRecord]) -> Result<(), StoreError>;

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError>;

    /// Deletes multiple records, chunked into [MAX_BATCH_SIZE] requests.
    /// Returns the number of delete requests that were accepted.
    async fn batch_delete(&self, keys: &[RecordKey]) -> Result<usize, StoreError>;

    /// One page of the channel's record keys starting after `start`.
    async fn scan(&self, channel: &Channel, start: Option<RecordKey>) -> Result<ScanPage, StoreError>;

    /// Creates or refreshes the heartbeat record of the channel.
    async fn put_liveness(&self, record: &LivenessRecord) -> Result<(), StoreError>;

    async fn get_liveness(&self, channel: &Channel) -> Result<Option<LivenessRecord>, StoreError>;
}

/// The store is shared between the relay components and the tasks they spawn.
pub type SharedStore = Arc<dyn TransportStore>;
