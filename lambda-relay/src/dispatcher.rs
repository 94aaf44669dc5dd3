//! The local side of the relay: a long-running loop on the developer's machine.
use crate::clock::Clock;
use crate::config::{DispatcherConfig, DEFAULT_FRESHNESS_WINDOW, DEFAULT_RECORD_TTL};
use crate::handlers::HandlerResolver;
use crate::invocations::{HandlerOutcome, InvocationLog};
use crate::liveness::LivenessMonitor;
use crate::records::{error_payload, InvocationRecord, InvokeStatus};
use crate::store::SharedStore;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single tick of the dispatcher loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Drains pending invocations of the channel, runs them against local handlers and writes back the results.
/// Only one dispatcher per channel is supported.
pub struct Dispatcher {
    config: DispatcherConfig,
    invocations: InvocationLog,
    liveness: LivenessMonitor,
    resolver: Arc<dyn HandlerResolver>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: SharedStore,
        resolver: Arc<dyn HandlerResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let channel = config.relay.channel.clone();
        Self {
            // the TTL only applies to failed records replacing undecodable rows
            invocations: InvocationLog::new(store.clone(), clock.clone(), channel.clone(), DEFAULT_RECORD_TTL),
            liveness: LivenessMonitor::new(store, clock, channel, DEFAULT_FRESHNESS_WINDOW),
            resolver,
            config,
        }
    }

    /// Deletes all records of the channel, e.g. invocations left over from a previous session.
    /// Returns the number of deleted records.
    pub async fn clean(&self) -> usize {
        info!("Erasing queued invocations of {}", self.config.relay.channel);
        self.invocations.purge().await
    }

    /// Runs ticks until `shutdown` fires. Cleans up the channel first if configured to.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.config.clean_on_start {
            self.clean().await;
        }

        info!("Ready and listening for new events on {}", self.config.relay.channel);

        while !shutdown.is_cancelled() {
            let report = self.tick().await;
            if report.claimed > 0 {
                info!(
                    "Processed {} invocations: {} completed, {} failed",
                    report.claimed, report.completed, report.failed
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.tick_interval) => {}
            }
        }

        info!("Dispatcher stopped");
    }

    /// One pass: claim pending invocations, run them all concurrently, write the results
    /// and refresh the heartbeat. Returns after every claimed invocation has a result.
    pub async fn tick(&self) -> TickReport {
        let claimed = self.invocations.claim_pending().await;

        let mut report = TickReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        if !claimed.is_empty() {
            debug!("Claimed {} invocations", claimed.len());

            let outcomes = join_all(claimed.iter().map(|record| self.process(record))).await;

            for status in outcomes.into_iter().flatten() {
                match status {
                    InvokeStatus::Completed => report.completed += 1,
                    InvokeStatus::Failed => report.failed += 1,
                    _ => {}
                }
            }
        }

        self.liveness.refresh().await;

        report
    }

    /// Runs one claimed invocation and writes its terminal status.
    /// Returns the written status or None if the result could not be written.
    async fn process(&self, record: &InvocationRecord) -> Option<InvokeStatus> {
        let key = record.key();

        let request = match record.request() {
            Ok(v) => v,
            Err(e) => {
                error!("Invalid payload in {key}: {e}");
                let outcome = HandlerOutcome::Failed(error_payload(&format!("Invalid invocation payload: {e}")));
                return self.invocations.finish(record, outcome).await.map(|r| r.status);
            }
        };

        let handler = match self.resolver.resolve(&request.target_function) {
            Ok(v) => v,
            Err(e) => {
                warn!("{e}");
                return self
                    .invocations
                    .finish(record, HandlerOutcome::Failed(error_payload(&e.to_string())))
                    .await
                    .map(|r| r.status);
            }
        };

        info!("Triggering {} for {key}", request.target_function);
        let expects_response = request.expects_response();

        // a separate task keeps a panicking handler from taking down the loop
        let event = request.event;
        let outcome = match tokio::spawn(async move { handler.call(event).await }).await {
            Ok(Ok(response)) => match serde_json::to_string(&response) {
                Ok(v) => HandlerOutcome::Completed(v),
                Err(e) => HandlerOutcome::Failed(error_payload(&format!("Failed to serialize the response: {e}"))),
            },
            Ok(Err(e)) => {
                error!("{} failed: {e}", request.target_function);
                HandlerOutcome::Failed(error_payload(&e.to_string()))
            }
            Err(e) => {
                error!("{} panicked: {e}", request.target_function);
                HandlerOutcome::Failed(error_payload("handler panicked"))
            }
        };

        let done = self.invocations.finish(record, outcome).await?;
        info!("{} finished {key} as {}", request.target_function, done.status);

        if self.config.discard_unobserved && done.status == InvokeStatus::Completed && !expects_response {
            debug!("Not an API request, discarding {key}");
            self.invocations.discard(&done.invoke_id).await;
        }

        Some(done.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Channel, RelayConfig};
    use crate::handlers::{handler_fn, HandlerRegistry};
    use crate::records::{InvocationRequest, RecordKey};
    use crate::store::memory::MemoryStore;
    use crate::store::TransportStore;
    use crate::Error;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn channel() -> Channel {
        Channel::new("svc1").unwrap()
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .with(
                "F",
                handler_fn(|event: Value| async move {
                    let a = event["a"].as_i64().unwrap_or_default();
                    let b = event["b"].as_i64().unwrap_or_default();
                    Ok::<_, Error>(json!({ "sum": a + b }))
                }),
            )
            .with(
                "boom",
                handler_fn(|_event: Value| async move { Err::<Value, Error>(Error::from("boom")) }),
            )
            .with(
                "panics",
                handler_fn(|_event: Value| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<_, Error>(Value::Null)
                }),
            )
    }

    fn dispatcher(store: Arc<MemoryStore>, config: impl FnOnce(&mut DispatcherConfig)) -> Dispatcher {
        let mut dispatcher_config = DispatcherConfig::new(RelayConfig::new("relay-table", channel()).unwrap());
        config(&mut dispatcher_config);
        Dispatcher::new(
            dispatcher_config,
            store,
            Arc::new(registry()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    fn log(store: Arc<MemoryStore>) -> InvocationLog {
        InvocationLog::new(
            store,
            Arc::new(ManualClock::new(1_700_000_000_000)),
            channel(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn tick_runs_every_pending_invocation() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        let ok = log.enqueue(&InvocationRequest::new("F", json!({"a": 1, "b": 2}))).await.unwrap();
        let failing = log.enqueue(&InvocationRequest::new("boom", json!({}))).await.unwrap();

        let report = dispatcher(store.clone(), |c| c.discard_unobserved = false).tick().await;
        assert_eq!(
            report,
            TickReport {
                claimed: 2,
                completed: 1,
                failed: 1
            }
        );

        let ok = store.get(&RecordKey::new(&channel(), ok)).await.unwrap().unwrap();
        assert_eq!(ok.status, InvokeStatus::Completed);
        assert_eq!(ok.result_value(), json!({"sum": 3}));

        let failing = store.get(&RecordKey::new(&channel(), failing)).await.unwrap().unwrap();
        assert_eq!(failing.status, InvokeStatus::Failed);
        assert_eq!(failing.result_value(), json!({"error": "boom"}));
    }

    #[tokio::test]
    async fn unknown_functions_and_panics_are_failures() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        let unknown = log.enqueue(&InvocationRequest::new("nope", json!({}))).await.unwrap();
        let panics = log.enqueue(&InvocationRequest::new("panics", json!({}))).await.unwrap();
        let ok = log.enqueue(&InvocationRequest::new("F", json!({"a": 2, "b": 2}))).await.unwrap();

        let report = dispatcher(store.clone(), |c| c.discard_unobserved = false).tick().await;
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 2);

        let unknown = store.get(&RecordKey::new(&channel(), unknown)).await.unwrap().unwrap();
        assert_eq!(unknown.result_value(), json!({"error": "No local handler for function nope"}));

        let panics = store.get(&RecordKey::new(&channel(), panics)).await.unwrap().unwrap();
        assert_eq!(panics.result_value(), json!({"error": "handler panicked"}));

        let ok = store.get(&RecordKey::new(&channel(), ok)).await.unwrap().unwrap();
        assert_eq!(ok.result_value(), json!({"sum": 4}));
    }

    #[tokio::test]
    async fn invalid_payload_is_a_failure() {
        let store = Arc::new(MemoryStore::new());
        let record = InvocationRecord {
            channel: "svc1".to_owned(),
            invoke_id: "1".to_owned(),
            payload: "not json".to_owned(),
            status: InvokeStatus::Pending,
            result: None,
            ttl: 0,
        };
        store.put(&record).await.unwrap();

        let report = dispatcher(store.clone(), |_| {}).tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(
            store.get(&record.key()).await.unwrap().unwrap().status,
            InvokeStatus::Failed
        );
    }

    #[tokio::test]
    async fn tick_refreshes_the_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        assert!(store.get_liveness(&channel()).await.unwrap().is_none());

        let report = dispatcher(store.clone(), |_| {}).tick().await;
        assert_eq!(report, TickReport::default());

        let heartbeat = store.get_liveness(&channel()).await.unwrap().unwrap();
        assert_eq!(heartbeat.ttl, 1_700_000_000);
    }

    #[tokio::test]
    async fn completed_async_events_are_discarded() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        log.enqueue(&InvocationRequest::new("F", json!({"a": 1, "b": 1}))).await.unwrap();
        let api = log
            .enqueue(&InvocationRequest::new(
                "F",
                json!({"path": "/sum", "httpMethod": "GET", "a": 1, "b": 1}),
            ))
            .await
            .unwrap();

        dispatcher(store.clone(), |_| {}).tick().await;

        let left = store.records(&channel());
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].invoke_id, api);
    }

    #[tokio::test]
    async fn async_events_are_kept_when_asked_to() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        let id = log
            .enqueue(&InvocationRequest::new("F", json!({"Records": [{"eventSource": "aws:sqs"}]})))
            .await
            .unwrap();

        dispatcher(store.clone(), |c| c.discard_unobserved = false).tick().await;

        let kept = store.get(&RecordKey::new(&channel(), id)).await.unwrap().unwrap();
        assert_eq!(kept.status, InvokeStatus::Completed);
    }

    #[tokio::test]
    async fn clean_deletes_everything_once() {
        let store = Arc::new(MemoryStore::with_page_size(2));
        let log = log(store.clone());
        for i in 0..5 {
            log.enqueue(&InvocationRequest::new("F", json!({"a": i}))).await.unwrap();
        }
        let dispatcher = dispatcher(store.clone(), |_| {});

        assert_eq!(dispatcher.clean().await, 5);
        assert_eq!(dispatcher.clean().await, 0);
        assert!(store.records(&channel()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        log.enqueue(&InvocationRequest::new("stale", json!({}))).await.unwrap();

        let dispatcher = Arc::new(dispatcher(store.clone(), |c| c.clean_on_start = true));
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown.cancel();
        running.await.unwrap();

        // the stale invocation was cleaned before the first tick, not executed
        assert!(store.records(&channel()).is_empty());
        assert!(store.get_liveness(&channel()).await.unwrap().is_some());
    }
}
