//! The remote side of the relay. Runs inside every invocation of the remote function.
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::invocations::{InvocationLog, ResultPoll};
use crate::liveness::LivenessMonitor;
use crate::records::{InvocationRequest, InvokeStatus};
use crate::store::SharedStore;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the gateway arrived at the response it returns to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// No dispatcher was listening, the original handler ran in-process
    Fallback,
    /// The local handler returned a response
    Completed,
    /// The local handler failed, the payload is `{"error": "..."}`
    Failed,
    /// The dispatcher ran the event and discarded the record because the caller does not read responses
    Discarded,
    /// The invocation record could not be written
    NotEnqueued,
    /// The wait was cancelled before a result arrived, e.g. the function is about to time out
    Abandoned,
}

/// What the gateway hands back to the caller of the remote function.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub outcome: RelayOutcome,
    /// The response to return to the caller. Null if there is nothing to return.
    pub payload: Value,
}

impl GatewayResponse {
    fn empty(outcome: RelayOutcome) -> Self {
        Self {
            outcome,
            payload: Value::Null,
        }
    }
}

/// Decides between the original handler and the local dispatcher, relays the event and waits for the result.
pub struct Gateway {
    config: GatewayConfig,
    invocations: InvocationLog,
    liveness: LivenessMonitor,
}

impl Gateway {
    pub fn new(config: GatewayConfig, store: SharedStore, clock: Arc<dyn Clock>) -> Self {
        let channel = config.relay.channel.clone();
        Self {
            invocations: InvocationLog::new(store.clone(), clock.clone(), channel.clone(), config.record_ttl),
            liveness: LivenessMonitor::new(store, clock, channel, config.freshness_window),
            config,
        }
    }

    /// Handles one invocation of the remote function.
    ///
    /// If no dispatcher is listening, `original` is called with the event and its result is returned as-is,
    /// including errors, as if the relay did not exist.
    /// Otherwise the event is relayed and the call waits for the local result until it arrives
    /// or `cancel` fires. Relay problems never turn into errors for the caller.
    pub async fn handle<F, Fut, E>(&self, event: Value, original: F, cancel: &CancellationToken) -> Result<GatewayResponse, E>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if !self.liveness.is_alive().await {
            debug!("No local dispatcher on {}, running the original handler", self.config.relay.channel);
            let payload = original(event).await?;
            return Ok(GatewayResponse {
                outcome: RelayOutcome::Fallback,
                payload,
            });
        }

        let request = InvocationRequest::new(self.config.function_name.clone(), event);

        let invoke_id = match self.invocations.enqueue(&request).await {
            Some(v) => v,
            None => {
                warn!("Failed to relay the invocation of {}", self.config.function_name);
                return Ok(GatewayResponse::empty(RelayOutcome::NotEnqueued));
            }
        };

        info!("Relayed {} as {invoke_id}, waiting for the response", self.config.function_name);

        Ok(self.await_result(&invoke_id, cancel).await)
    }

    /// Polls for the terminal record of the invocation, deletes it and returns its result.
    /// There is no timeout other than `cancel`.
    pub async fn await_result(&self, invoke_id: &str, cancel: &CancellationToken) -> GatewayResponse {
        loop {
            match self.invocations.poll_result(invoke_id).await {
                ResultPoll::Ready(record) => {
                    self.invocations.discard(invoke_id).await;

                    let outcome = match record.status {
                        InvokeStatus::Failed => RelayOutcome::Failed,
                        _ => RelayOutcome::Completed,
                    };
                    info!("{invoke_id} {}", record.status);

                    return GatewayResponse {
                        outcome,
                        payload: record.result_value(),
                    };
                }
                ResultPoll::Gone => {
                    info!("{invoke_id} was discarded by the dispatcher");
                    return GatewayResponse::empty(RelayOutcome::Discarded);
                }
                ResultPoll::Waiting => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Stopped waiting for {invoke_id}");
                    return GatewayResponse::empty(RelayOutcome::Abandoned);
                }
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }
}
