//! Relays invocations of a deployed Lambda function to a handler running on the developer's machine.
//!
//! Both sides talk through a single DynamoDB table used as a message channel:
//! - the [gateway::Gateway] runs inside the remote function, checks if a local dispatcher is listening
//!   and either falls back to the original handler or enqueues the event and waits for the result
//! - the [dispatcher::Dispatcher] runs locally, drains pending records, executes local handlers,
//!   writes the results back and keeps a heartbeat record fresh so the gateway knows it is alive
use std::env::var;
use std::str::FromStr;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod invocations;
pub mod liveness;
pub mod records;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Channel, DispatcherConfig, GatewayConfig, RelayConfig};
pub use dispatcher::{Dispatcher, TickReport};
pub use error::{ConfigError, HandlerNotFound, StoreError};
pub use gateway::{Gateway, GatewayResponse, RelayOutcome};
pub use handlers::{handler_fn, typed_fn, HandlerRegistry, HandlerResolver, LocalHandler};
pub use records::{InvocationRecord, InvocationRequest, InvokeStatus, LivenessRecord, RecordKey};
pub use store::{dynamo::DynamoStore, memory::MemoryStore, SharedStore, TransportStore};

/// The same shape as `lambda_runtime::Error` so handlers can be shared between the remote function
/// and the local dispatcher without conversions.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Initializes tracing for use in `main` of either side of the relay.
/// * ansi: set to false inside Lambda because CloudWatch does not render the color codes
///
/// The default level is taken from LAMBDA_RELAY_TRACING_LEVEL env var (INFO if not set)
/// and can be overridden per target with RUST_LOG.
pub fn init_tracing(ansi: bool) {
    let tracing_level = match var("LAMBDA_RELAY_TRACING_LEVEL") {
        Err(_) => tracing::Level::INFO,
        Ok(v) => tracing::Level::from_str(&v).unwrap_or_else(|_| {
            eprintln!("Invalid LAMBDA_RELAY_TRACING_LEVEL: {v}. Use trace, debug, info, warn or error");
            tracing::Level::INFO
        }),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(Directive::from(tracing::level_filters::LevelFilter::from_level(
            tracing_level,
        )))
        .from_env_lossy();

    if ansi {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(true)
            .with_target(false)
            .compact()
            .init();
    } else {
        // CloudWatch adds its own timestamps
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .without_time()
            .compact()
            .init();
    }
}
