use super::{MalformedRecord, QueryResult, ScanPage, TransportStore, MAX_BATCH_SIZE};
use crate::config::Channel;
use crate::error::StoreError;
use crate::records::{InvocationRecord, InvokeStatus, LivenessRecord, RecordKey};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Number of keys per scan page, small enough for tests to cross page boundaries.
const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Default)]
struct Tables {
    records: BTreeMap<RecordKey, InvocationRecord>,
    liveness: HashMap<String, LivenessRecord>,
    /// pending rows that cannot be decoded, with the reason
    malformed: BTreeMap<RecordKey, String>,
    /// every status ever written per key, in write order
    history: HashMap<RecordKey, Vec<InvokeStatus>>,
    batch_requests: usize,
}

/// An in-process [TransportStore] with the same semantics as the DynamoDB table.
/// Used by tests and for trying the relay without AWS.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    page_size: usize,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            page_size: page_size.max(1),
            offline: AtomicBool::new(false),
        }
    }

    /// All requests fail with [StoreError::Unavailable] while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of the channel's invocation records in key order.
    pub fn records(&self, channel: &Channel) -> Vec<InvocationRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| r.channel == channel.as_str())
            .cloned()
            .collect()
    }

    /// Every status written for the key, including writes of records that were deleted since.
    pub fn status_history(&self, key: &RecordKey) -> Vec<InvokeStatus> {
        self.lock().history.get(key).cloned().unwrap_or_default()
    }

    /// Adds a pending row that cannot be decoded. [TransportStore::query] reports it as malformed
    /// and [TransportStore::get] fails on it until the key is overwritten or deleted.
    pub fn put_malformed(&self, key: RecordKey, reason: impl Into<String>) {
        let mut tables = self.lock();
        tables.records.remove(&key);
        tables.malformed.insert(key, reason.into());
    }

    /// Status histories of every key ever written, in key order.
    pub fn status_history_all(&self) -> Vec<(RecordKey, Vec<InvokeStatus>)> {
        let mut all: Vec<_> = self.lock().history.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Number of batch requests sent so far, counting each chunk separately.
    pub fn batch_requests(&self) -> usize {
        self.lock().batch_requests
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // a panic while holding the lock cannot leave the maps half-updated
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl Tables {
    fn write(&mut self, record: &InvocationRecord) {
        let key = record.key();
        self.malformed.remove(&key);
        self.history.entry(key.clone()).or_default().push(record.status);
        self.records.insert(key, record.clone());
    }

    fn remove(&mut self, key: &RecordKey) {
        self.records.remove(key);
        self.malformed.remove(key);
    }
}

#[async_trait]
impl TransportStore for MemoryStore {
    async fn put(&self, record: &InvocationRecord) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock().write(record);
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<InvocationRecord>, StoreError> {
        self.check_online()?;
        let tables = self.lock();
        if let Some(reason) = tables.malformed.get(key) {
            return Err(StoreError::malformed(key.to_string(), reason.clone()));
        }
        Ok(tables.records.get(key).cloned())
    }

    async fn query(&self, channel: &Channel, status: InvokeStatus) -> Result<QueryResult, StoreError> {
        self.check_online()?;
        let tables = self.lock();

        let records = tables
            .records
            .values()
            .filter(|r| r.channel == channel.as_str() && r.status == status)
            .cloned()
            .collect();

        // malformed rows are all pending
        let malformed = match status {
            InvokeStatus::Pending => tables
                .malformed
                .iter()
                .filter(|(key, _)| key.channel == channel.as_str())
                .map(|(key, reason)| MalformedRecord {
                    key: key.clone(),
                    reason: reason.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(QueryResult { records, malformed })
    }

    async fn batch_put(&self, records: &[InvocationRecord]) -> Result<(), StoreError> {
        self.check_online()?;
        let mut tables = self.lock();
        for chunk in records.chunks(MAX_BATCH_SIZE) {
            tables.batch_requests += 1;
            for record in chunk {
                tables.write(record);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock().remove(key);
        Ok(())
    }

    async fn batch_delete(&self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut tables = self.lock();
        for chunk in keys.chunks(MAX_BATCH_SIZE) {
            tables.batch_requests += 1;
            for key in chunk {
                tables.remove(key);
            }
        }
        // DynamoDB does not report if the deleted items existed
        Ok(keys.len())
    }

    async fn scan(&self, channel: &Channel, start: Option<RecordKey>) -> Result<ScanPage, StoreError> {
        self.check_online()?;
        let tables = self.lock();

        let lower = match &start {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };

        let all_keys: BTreeSet<&RecordKey> = tables.records.keys().chain(tables.malformed.keys()).collect();

        let mut keys: Vec<RecordKey> = all_keys
            .range::<&RecordKey, _>((lower, Bound::Unbounded))
            .filter(|key| key.channel == channel.as_str())
            .take(self.page_size + 1)
            .map(|key| (*key).clone())
            .collect();

        // one extra key tells if there is another page
        let next = if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ScanPage { keys, next })
    }

    async fn put_liveness(&self, record: &LivenessRecord) -> Result<(), StoreError> {
        self.check_online()?;
        self.lock().liveness.insert(record.channel.clone(), record.clone());
        Ok(())
    }

    async fn get_liveness(&self, channel: &Channel) -> Result<Option<LivenessRecord>, StoreError> {
        self.check_online()?;
        Ok(self.lock().liveness.get(&channel.liveness_key()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(channel: &str, id: usize, status: InvokeStatus) -> InvocationRecord {
        InvocationRecord {
            channel: channel.to_owned(),
            invoke_id: format!("{id:05}"),
            payload: "{}".to_owned(),
            status,
            result: None,
            ttl: 0,
        }
    }

    #[tokio::test]
    async fn query_is_scoped_by_channel_and_status() {
        let store = MemoryStore::new();
        store.put(&record("svc1", 1, InvokeStatus::Pending)).await.unwrap();
        store.put(&record("svc1", 2, InvokeStatus::Completed)).await.unwrap();
        store.put(&record("svc2", 3, InvokeStatus::Pending)).await.unwrap();

        let pending = store
            .query(&Channel::new("svc1").unwrap(), InvokeStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.records.len(), 1);
        assert_eq!(pending.records[0].invoke_id, "00001");
        assert!(pending.malformed.is_empty());
    }

    #[tokio::test]
    async fn malformed_rows_are_reported_next_to_good_ones() {
        let store = MemoryStore::new();
        let channel = Channel::new("svc1").unwrap();
        store.put(&record("svc1", 1, InvokeStatus::Pending)).await.unwrap();
        let bad = RecordKey::new(&channel, "00002");
        store.put_malformed(bad.clone(), "missing attribute");

        let pending = store.query(&channel, InvokeStatus::Pending).await.unwrap();
        assert_eq!(pending.records.len(), 1);
        assert_eq!(
            pending.malformed,
            vec![MalformedRecord {
                key: bad.clone(),
                reason: "missing attribute".to_owned()
            }]
        );
        assert!(store.get(&bad).await.is_err());

        // the scan lists it so a purge removes it
        let page = store.scan(&channel, None).await.unwrap();
        assert_eq!(page.keys.len(), 2);

        store.put(&record("svc1", 2, InvokeStatus::Failed)).await.unwrap();
        assert!(store.query(&channel, InvokeStatus::Pending).await.unwrap().malformed.is_empty());
        assert_eq!(store.get(&bad).await.unwrap().unwrap().status, InvokeStatus::Failed);
    }

    #[tokio::test]
    async fn batch_writes_are_chunked() {
        let store = MemoryStore::new();
        let records: Vec<_> = (0..60).map(|i| record("svc1", i, InvokeStatus::Pending)).collect();
        store.batch_put(&records).await.unwrap();
        assert_eq!(store.batch_requests(), 3);

        let keys: Vec<_> = records.iter().map(|r| r.key()).collect();
        assert_eq!(store.batch_delete(&keys[..26]).await.unwrap(), 26);
        assert_eq!(store.batch_requests(), 5);
        assert_eq!(store.records(&Channel::new("svc1").unwrap()).len(), 34);
    }

    #[tokio::test]
    async fn scan_pages_through_the_channel() {
        let store = MemoryStore::with_page_size(4);
        for i in 0..10 {
            store.put(&record("svc1", i, InvokeStatus::Pending)).await.unwrap();
        }
        store.put(&record("svc2", 99, InvokeStatus::Pending)).await.unwrap();
        let channel = Channel::new("svc1").unwrap();

        let mut start = None;
        let mut seen = Vec::new();
        loop {
            let page = store.scan(&channel, start).await.unwrap();
            seen.extend(page.keys);
            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 10);
        assert!(seen.iter().all(|k| k.channel == "svc1"));
    }

    #[tokio::test]
    async fn offline_store_fails_every_request() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let channel = Channel::new("svc1").unwrap();

        assert!(matches!(
            store.get_liveness(&channel).await,
            Err(StoreError::Unavailable)
        ));
        assert!(store.put(&record("svc1", 1, InvokeStatus::Pending)).await.is_err());

        store.set_offline(false);
        assert!(store.put(&record("svc1", 1, InvokeStatus::Pending)).await.is_ok());
    }
}
