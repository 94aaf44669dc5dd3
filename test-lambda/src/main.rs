use lambda_runtime::{Error, LambdaEvent};
use serde_json::Value;
use test_lambda::{execute, Request};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    lambda_relay::init_tracing(false);

    proxy_lambda::run(my_handler).await
}

/// The original handler. Runs in Lambda when no local dispatcher is listening.
async fn my_handler(event: LambdaEvent<Value>) -> Result<Value, Error> {
    info!("Handler invoked: {}", event.context.request_id);

    let request: Request = serde_json::from_value(event.payload)?;
    let response = execute(request).await?;

    Ok(serde_json::to_value(response)?)
}
