//! Runs a Lambda function behind the relay gateway.
//!
//! Replace `lambda_runtime::run(service_fn(handler))` with `proxy_lambda::run(handler)` in `main`.
//! While a local dispatcher is listening on the channel, the invocations are executed on the developer's machine.
//! Otherwise `handler` runs as usual.
//!
//! Required env vars: LAMBDA_RELAY_TABLE, LAMBDA_RELAY_CHANNEL. The function needs read/write access to the table.
use aws_sdk_dynamodb::Client as DynamoClient;
use lambda_relay::{Clock, DynamoStore, Gateway, GatewayConfig, SystemClock};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long before the Lambda deadline the gateway stops waiting for the local response
/// so that the function can still return.
pub const DEADLINE_MARGIN: Duration = Duration::from_millis(500);

/// Starts the Lambda runtime loop with `handler` as the original handler of the function.
/// Fails at startup if the relay is not configured.
pub async fn run<F, Fut>(handler: F) -> Result<(), Error>
where
    F: Fn(LambdaEvent<Value>) -> Fut,
    Fut: Future<Output = Result<Value, Error>>,
{
    print_env_vars();

    let config = GatewayConfig::from_env()?;
    let client = DynamoClient::new(&aws_config::load_from_env().await);
    let store = DynamoStore::new(client, config.relay.table_name.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = Gateway::new(config, Arc::new(store), clock.clone());

    // the runtime polls one invocation at a time, so the handler can borrow the shared state
    let gateway = &gateway;
    let handler = &handler;
    let clock = &clock;

    if let Err(e) = lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        relay_invocation(gateway, handler, clock.now_millis(), event).await
    }))
    .await
    {
        debug!("Runtime error: {:?}", e);
        return Err(e);
    }

    Ok(())
}

/// Handles a single invocation through the gateway.
async fn relay_invocation<F, Fut>(
    gateway: &Gateway,
    handler: &F,
    now_millis: i64,
    event: LambdaEvent<Value>,
) -> Result<Value, Error>
where
    F: Fn(LambdaEvent<Value>) -> Fut,
    Fut: Future<Output = Result<Value, Error>>,
{
    let (payload, ctx) = event.into_parts();
    debug!("Request ID: {}, deadline: {}", ctx.request_id, ctx.deadline);

    let cancel = CancellationToken::new();
    let wait = time_until_deadline(ctx.deadline, now_millis, DEADLINE_MARGIN);
    let timer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            sleep(wait).await;
            cancel.cancel();
        }
    });

    let response = gateway
        .handle(payload, |payload| handler(LambdaEvent::new(payload, ctx)), &cancel)
        .await;

    timer.abort();

    let response = response?;
    info!("Outcome: {:?}", response.outcome);

    Ok(response.payload)
}

/// Time left until `margin` before the deadline. Zero if that point has passed already.
fn time_until_deadline(deadline_millis: u64, now_millis: i64, margin: Duration) -> Duration {
    let stop_at = deadline_millis as i64 - margin.as_millis() as i64;
    Duration::from_millis((stop_at - now_millis).max(0) as u64)
}

/// Logs the env vars the relay depends on in the form of `export KEY=VALUE key2=value2`
fn print_env_vars() {
    let mut env_vars = Vec::<String>::with_capacity(10);
    env_vars.push(" export".to_string()); // the space at the front is needed to keep EXPORT as the first item of the array
    for (key, value) in std::env::vars() {
        if key.starts_with("LAMBDA_RELAY_") || key == "AWS_LAMBDA_FUNCTION_NAME" || key == "AWS_REGION" {
            env_vars.push(format!("{}={}", key, value));
        }
    }

    env_vars.sort();

    info!("{}", env_vars.join(" "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda_relay::{Channel, LivenessRecord, ManualClock, MemoryStore, RelayConfig, TransportStore};
    use lambda_runtime::Context;
    use serde_json::json;

    #[test]
    fn stops_waiting_before_the_deadline() {
        let margin = Duration::from_millis(500);
        assert_eq!(time_until_deadline(10_000, 4_000, margin), Duration::from_millis(5_500));
        assert_eq!(time_until_deadline(10_000, 9_700, margin), Duration::ZERO);
        assert_eq!(time_until_deadline(10_000, 20_000, margin), Duration::ZERO);
    }

    async fn echo(event: LambdaEvent<Value>) -> Result<Value, Error> {
        Ok(json!({"echo": event.payload, "request_id": event.context.request_id}))
    }

    #[tokio::test]
    async fn runs_the_original_handler_without_a_dispatcher() {
        let relay = RelayConfig::new("relay-table", Channel::new("svc1").unwrap()).unwrap();
        let gateway = Gateway::new(
            GatewayConfig::new(relay, "F"),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );

        let mut ctx = Context::default();
        ctx.request_id = "req-1".to_owned();
        ctx.deadline = 1_700_000_030_000;

        let response = relay_invocation(
            &gateway,
            &echo,
            1_700_000_000_000,
            LambdaEvent::new(json!({"a": 1}), ctx),
        )
        .await
        .unwrap();

        assert_eq!(response, json!({"echo": {"a": 1}, "request_id": "req-1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_null_when_the_deadline_is_near() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let channel = Channel::new("svc1").unwrap();
        store
            .put_liveness(&LivenessRecord {
                channel: channel.liveness_key(),
                ttl: clock.now_secs(),
            })
            .await
            .unwrap();

        let relay = RelayConfig::new("relay-table", channel.clone()).unwrap();
        let gateway = Gateway::new(GatewayConfig::new(relay, "F"), store.clone(), clock);

        let mut ctx = Context::default();
        ctx.deadline = 1_700_000_003_000;

        let response = relay_invocation(&gateway, &echo, 1_700_000_000_000, LambdaEvent::new(json!({}), ctx))
            .await
            .unwrap();

        assert_eq!(response, Value::Null);
        // nobody picked up the invocation, the record is left for the TTL
        assert_eq!(store.records(&channel).len(), 1);
    }
}
