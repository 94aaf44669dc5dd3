use super::codec::{compress_if_large, decompress_if_marked};
use super::{MalformedRecord, QueryResult, ScanPage, TransportStore, MAX_BATCH_SIZE};
use crate::config::Channel;
use crate::error::StoreError;
use crate::records::{InvocationRecord, InvokeStatus, LivenessRecord, RecordKey, LIVENESS_SORT_KEY};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client as DynamoClient;
use std::collections::HashMap;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Attribute names in the relay table. The table itself is created by the infra binder
/// with `lambdaName` as the partition key, `invokeId` as the sort key and TTL enabled on `ttl`.
const ATTR_CHANNEL: &str = "lambdaName";
const ATTR_INVOKE_ID: &str = "invokeId";
const ATTR_BODY: &str = "body";
const ATTR_STATUS: &str = "invokeStatus";
const ATTR_RESULT: &str = "result";
const ATTR_TTL: &str = "ttl";

/// How many times unprocessed batch items are resent before giving up.
const BATCH_RETRIES: u32 = 3;

type Item = HashMap<String, AttributeValue>;

/// [TransportStore] backed by a DynamoDB table.
#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: DynamoClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Sends write requests in chunks of [MAX_BATCH_SIZE] and resends unprocessed items a few times.
    /// Returns the number of requests DynamoDB accepted.
    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<usize, StoreError> {
        send_in_batches(requests, |pending| self.send_batch(pending)).await
    }

    /// One BatchWriteItem call. Returns the items DynamoDB left unprocessed.
    async fn send_batch(&self, pending: Vec<WriteRequest>) -> Result<Vec<WriteRequest>, StoreError> {
        let resp = self
            .client
            .batch_write_item()
            .request_items(&self.table_name, pending)
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        Ok(resp
            .unprocessed_items
            .and_then(|mut items| items.remove(&self.table_name))
            .unwrap_or_default())
    }
}

/// Passes `requests` to `send` in chunks of [MAX_BATCH_SIZE]. `send` returns the requests that were not processed,
/// which are resent up to [BATCH_RETRIES] times with exponential backoff.
/// Returns the number of accepted requests or [StoreError::Unprocessed] with the number of requests given up on.
async fn send_in_batches<T, F, Fut>(requests: Vec<T>, mut send: F) -> Result<usize, StoreError>
where
    T: Clone,
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<T>, StoreError>>,
{
    let total = requests.len();
    let mut unprocessed_total = 0;

    for chunk in requests.chunks(MAX_BATCH_SIZE) {
        let mut pending = chunk.to_vec();
        let mut attempt = 0;

        while !pending.is_empty() {
            pending = send(pending).await?;

            if pending.is_empty() {
                break;
            }

            attempt += 1;
            if attempt > BATCH_RETRIES {
                warn!("{} batch items left unprocessed after {BATCH_RETRIES} retries", pending.len());
                unprocessed_total += pending.len();
                break;
            }

            debug!("Retrying {} unprocessed batch items, attempt {attempt}", pending.len());
            sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
        }
    }

    if unprocessed_total > 0 {
        return Err(StoreError::Unprocessed(unprocessed_total));
    }

    Ok(total)
}

#[async_trait]
impl TransportStore for DynamoStore {
    async fn put(&self, record: &InvocationRecord) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(record)))
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<InvocationRecord>, StoreError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(key_item(&key.channel, &key.invoke_id)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        resp.item.map(from_item).transpose()
    }

    async fn query(&self, channel: &Channel, status: InvokeStatus) -> Result<QueryResult, StoreError> {
        let mut result = QueryResult::default();
        let mut start_key: Option<Item> = None;

        // a query returns up to 1MB per page
        loop {
            let resp = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("#channel = :channel")
                .filter_expression("#status = :status")
                .expression_attribute_names("#channel", ATTR_CHANNEL)
                .expression_attribute_names("#status", ATTR_STATUS)
                .expression_attribute_values(":channel", AttributeValue::S(channel.as_str().to_owned()))
                .expression_attribute_values(":status", AttributeValue::S(status.as_str().to_owned()))
                .consistent_read(true)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

            collect_items(resp.items.unwrap_or_default(), &mut result);

            match resp.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        Ok(result)
    }

    async fn batch_put(&self, records: &[InvocationRecord]) -> Result<(), StoreError> {
        let requests = records
            .iter()
            .map(|record| {
                let put = PutRequest::builder()
                    .set_item(Some(to_item(record)))
                    .build()
                    .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
                Ok(WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.batch_write(requests).await?;
        Ok(())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(key_item(&key.channel, &key.invoke_id)))
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        Ok(())
    }

    async fn batch_delete(&self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        let requests = keys
            .iter()
            .map(|key| {
                let delete = DeleteRequest::builder()
                    .set_key(Some(key_item(&key.channel, &key.invoke_id)))
                    .build()
                    .map_err(|e| StoreError::InvalidRequest(e.to_string()))?;
                Ok(WriteRequest::builder().delete_request(delete).build())
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.batch_write(requests).await
    }

    async fn scan(&self, channel: &Channel, start: Option<RecordKey>) -> Result<ScanPage, StoreError> {
        // only the keys are needed to delete the records
        let resp = self
            .client
            .query()
            .table_name(&self.table_name)
            .key_condition_expression("#channel = :channel")
            .projection_expression("#channel, #invoke_id")
            .expression_attribute_names("#channel", ATTR_CHANNEL)
            .expression_attribute_names("#invoke_id", ATTR_INVOKE_ID)
            .expression_attribute_values(":channel", AttributeValue::S(channel.as_str().to_owned()))
            .set_exclusive_start_key(start.map(|key| key_item(&key.channel, &key.invoke_id)))
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        let keys = resp
            .items
            .unwrap_or_default()
            .iter()
            .map(item_key)
            .collect::<Result<Vec<_>, StoreError>>()?;

        let next = match resp.last_evaluated_key {
            Some(key) if !key.is_empty() => Some(item_key(&key)?),
            _ => None,
        };

        Ok(ScanPage { keys, next })
    }

    async fn put_liveness(&self, record: &LivenessRecord) -> Result<(), StoreError> {
        // ttl is a reserved word in DynamoDB expressions
        self.client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(key_item(&record.channel, LIVENESS_SORT_KEY)))
            .update_expression("SET #ttl = :now")
            .expression_attribute_names("#ttl", ATTR_TTL)
            .expression_attribute_values(":now", AttributeValue::N(record.ttl.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        Ok(())
    }

    async fn get_liveness(&self, channel: &Channel) -> Result<Option<LivenessRecord>, StoreError> {
        let liveness_key = channel.liveness_key();
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(key_item(&liveness_key, LIVENESS_SORT_KEY)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::request(DisplayErrorContext(e)))?;

        let item = match resp.item {
            Some(v) => v,
            None => return Ok(None),
        };

        let key = [liveness_key.as_str(), "/", LIVENESS_SORT_KEY].concat();
        Ok(Some(LivenessRecord {
            ttl: number_attr(&item, &key, ATTR_TTL)?,
            channel: liveness_key,
        }))
    }
}

/// Partition + sort key of an item.
fn key_item(channel: &str, invoke_id: &str) -> Item {
    HashMap::from([
        (ATTR_CHANNEL.to_owned(), AttributeValue::S(channel.to_owned())),
        (ATTR_INVOKE_ID.to_owned(), AttributeValue::S(invoke_id.to_owned())),
    ])
}

fn to_item(record: &InvocationRecord) -> Item {
    let mut item = key_item(&record.channel, &record.invoke_id);
    item.insert(
        ATTR_BODY.to_owned(),
        AttributeValue::S(compress_if_large(record.payload.clone())),
    );
    item.insert(
        ATTR_STATUS.to_owned(),
        AttributeValue::S(record.status.as_str().to_owned()),
    );
    item.insert(ATTR_TTL.to_owned(), AttributeValue::N(record.ttl.to_string()));
    if let Some(result) = &record.result {
        item.insert(ATTR_RESULT.to_owned(), AttributeValue::S(compress_if_large(result.clone())));
    }
    item
}

/// Decodes the items of a query page. Items that cannot be decoded are logged and reported by key
/// without stopping the rest. Items without a readable key cannot be acted on and are only logged.
fn collect_items(items: Vec<Item>, result: &mut QueryResult) {
    for item in items {
        let key = item_key(&item);
        match from_item(item) {
            Ok(v) => result.records.push(v),
            Err(e) => {
                warn!("Skipping undecodable item: {e}");
                if let Ok(key) = key {
                    let reason = match e {
                        StoreError::MalformedItem { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    result.malformed.push(MalformedRecord { key, reason });
                }
            }
        }
    }
}

/// Reads the partition and sort key of an item.
fn item_key(item: &Item) -> Result<RecordKey, StoreError> {
    let channel = item.get(ATTR_CHANNEL).and_then(|v| v.as_s().ok());
    let invoke_id = item.get(ATTR_INVOKE_ID).and_then(|v| v.as_s().ok());

    match (channel, invoke_id) {
        (Some(channel), Some(invoke_id)) => Ok(RecordKey {
            channel: channel.clone(),
            invoke_id: invoke_id.clone(),
        }),
        (channel, invoke_id) => Err(StoreError::malformed(
            [
                channel.map_or("?", String::as_str),
                "/",
                invoke_id.map_or("?", String::as_str),
            ]
            .concat(),
            "missing key attributes",
        )),
    }
}

fn from_item(item: Item) -> Result<InvocationRecord, StoreError> {
    let RecordKey { channel, invoke_id } = item_key(&item)?;
    let key = [channel.as_str(), "/", invoke_id.as_str()].concat();

    let status = string_attr(&item, &key, ATTR_STATUS)?
        .parse::<InvokeStatus>()
        .map_err(|e| StoreError::malformed(&key, e))?;

    let payload =
        decompress_if_marked(string_attr(&item, &key, ATTR_BODY)?).map_err(|e| StoreError::malformed(&key, e))?;

    let result = match item.get(ATTR_RESULT) {
        Some(AttributeValue::S(v)) => Some(decompress_if_marked(v.clone()).map_err(|e| StoreError::malformed(&key, e))?),
        Some(_) => return Err(StoreError::malformed(&key, "result is not a string")),
        None => None,
    };

    Ok(InvocationRecord {
        ttl: number_attr(&item, &key, ATTR_TTL)?,
        channel,
        invoke_id,
        payload,
        status,
        result,
    })
}

/// Reads a string attribute. `key` identifies the item in errors.
fn string_attr(item: &Item, key: &str, name: &str) -> Result<String, StoreError> {
    match item.get(name) {
        Some(AttributeValue::S(v)) => Ok(v.clone()),
        Some(_) => Err(StoreError::malformed(key, format!("{name}: expected a string attribute"))),
        None => Err(StoreError::malformed(key, format!("{name}: missing attribute"))),
    }
}

/// Reads a number attribute. Older records stored `ttl` as a string, so both are accepted.
fn number_attr(item: &Item, key: &str, name: &str) -> Result<i64, StoreError> {
    let raw = match item.get(name) {
        Some(AttributeValue::N(v)) | Some(AttributeValue::S(v)) => v,
        Some(_) => return Err(StoreError::malformed(key, format!("{name}: expected a number attribute"))),
        None => return Err(StoreError::malformed(key, format!("{name}: missing attribute"))),
    };

    raw.parse::<i64>()
        .map_err(|e| StoreError::malformed(key, format!("{name}: {raw} is not an integer: {e}")))
}
