//! Serves relayed invocations of `test-lambda` on the local machine.
//!
//! ```text
//! local-lambda --table lambda-relay-records --channel my-stack-dev --clean
//! ```
//!
//! Deploy `test-lambda` with the same table and channel, then invoke it in AWS.
//! The invocations run here while this process is up and in Lambda otherwise.
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_types::region::Region;
use clap::Parser;
use lambda_relay::config::{CHANNEL_ENV_VAR, FUNCTION_ENV_VAR, TABLE_ENV_VAR};
use lambda_relay::{
    typed_fn, Channel, Dispatcher, DispatcherConfig, DynamoStore, Error, HandlerRegistry, RelayConfig, SystemClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "local-lambda", about = "Runs relayed Lambda invocations locally", version)]
struct Args {
    /// DynamoDB table shared with the deployed function.
    #[arg(long, env = TABLE_ENV_VAR)]
    table: String,

    /// Channel the deployed function relays to, e.g. my-stack-dev.
    #[arg(long, env = CHANNEL_ENV_VAR)]
    channel: String,

    /// Function name the deployed function relays as.
    #[arg(long, env = FUNCTION_ENV_VAR, default_value = "test-lambda")]
    function: String,

    /// AWS region of the table. Taken from the AWS config if not set.
    #[arg(long)]
    region: Option<String>,

    /// Delete all invocations left in the channel before listening.
    #[arg(long)]
    clean: bool,

    /// Keep completed invocations that nobody waits for, e.g. SQS or S3 events.
    /// They are deleted as soon as they complete otherwise.
    #[arg(long)]
    keep_unobserved: bool,

    /// Milliseconds between checks for new invocations.
    #[arg(long, default_value = "1000")]
    tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    lambda_relay::init_tracing(true);

    let args = Args::parse();

    let relay = RelayConfig::new(args.table, Channel::new(args.channel)?)?;
    let mut config = DispatcherConfig::new(relay);
    config.tick_interval = Duration::from_millis(args.tick_ms.max(1));
    config.clean_on_start = args.clean;
    config.discard_unobserved = !args.keep_unobserved;

    let aws_config = match args.region {
        Some(region) => aws_config::from_env().region(Region::new(region)).load().await,
        None => aws_config::load_from_env().await,
    };
    let store = DynamoStore::new(DynamoClient::new(&aws_config), config.relay.table_name.clone());

    let handlers = HandlerRegistry::new().with(args.function, typed_fn(test_lambda::execute));
    info!("Local handlers: {}", handlers.names().join(", "));

    let dispatcher = Dispatcher::new(config, Arc::new(store), Arc::new(handlers), Arc::new(SystemClock));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {e}");
                return;
            }
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    dispatcher.run(shutdown).await;

    Ok(())
}
