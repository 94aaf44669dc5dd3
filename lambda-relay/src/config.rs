use crate::error::ConfigError;
use std::env::var;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Name of the DynamoDB table shared by the gateway and the dispatcher.
pub const TABLE_ENV_VAR: &str = "LAMBDA_RELAY_TABLE";
/// Channel (deployment) the records are partitioned by.
pub const CHANNEL_ENV_VAR: &str = "LAMBDA_RELAY_CHANNEL";
/// Logical name of the function the gateway runs in. Defaults to AWS_LAMBDA_FUNCTION_NAME.
pub const FUNCTION_ENV_VAR: &str = "LAMBDA_RELAY_FUNCTION";
/// Set by the Lambda runtime.
const AWS_FUNCTION_NAME_ENV_VAR: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// How often the gateway checks for a result.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How often the dispatcher looks for pending invocations and refreshes its heartbeat.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);
/// The oldest heartbeat that still counts as a listening dispatcher, i.e. 5 missed ticks.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(5);
/// How long an abandoned invocation record lives before DynamoDB TTL removes it.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(3600);

/// Identifies one logical deployment. All relay records of the deployment are partitioned by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Partition key of the heartbeat record, e.g. `my-stack_TTL`.
    pub fn liveness_key(&self) -> String {
        [&self.0, "_TTL"].concat()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the relay records live. Shared by both sides.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// E.g. lambda-relay-records
    pub table_name: String,
    /// E.g. my-service-dev
    pub channel: Channel,
}

impl RelayConfig {
    pub fn new(table_name: impl Into<String>, channel: Channel) -> Result<Self, ConfigError> {
        let table_name = table_name.into();
        if table_name.trim().is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        Ok(Self { table_name, channel })
    }

    /// Reads the table and channel names from LAMBDA_RELAY_TABLE and LAMBDA_RELAY_CHANNEL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let table_name = var(TABLE_ENV_VAR).map_err(|_| ConfigError::MissingEnvVar(TABLE_ENV_VAR))?;
        let channel = var(CHANNEL_ENV_VAR).map_err(|_| ConfigError::MissingEnvVar(CHANNEL_ENV_VAR))?;
        Self::new(table_name, Channel::new(channel)?)
    }
}

/// Settings of the gateway running inside the remote function.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub relay: RelayConfig,
    /// The name local handlers are registered under, e.g. my-lambda
    pub function_name: String,
    pub poll_interval: Duration,
    pub freshness_window: Duration,
    pub record_ttl: Duration,
}

impl GatewayConfig {
    /// Creates a config with default timings.
    pub fn new(relay: RelayConfig, function_name: impl Into<String>) -> Self {
        Self {
            relay,
            function_name: function_name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            record_ttl: DEFAULT_RECORD_TTL,
        }
    }

    /// Creates a new config from the environment variables set on the function by the infra binder.
    /// Uses default timings. Fails if the table or the channel are not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let relay = RelayConfig::from_env()?;

        // the explicit name has priority over the one set by the Lambda runtime
        let function_name = match var(FUNCTION_ENV_VAR) {
            Ok(v) => v,
            Err(_) => var(AWS_FUNCTION_NAME_ENV_VAR).map_err(|_| ConfigError::MissingEnvVar(FUNCTION_ENV_VAR))?,
        };
        debug!("Relay function name: {function_name}");

        info!(
            "Relay table: {}, channel: {}, function: {}",
            relay.table_name, relay.channel, function_name
        );

        Ok(Self::new(relay, function_name))
    }
}

/// Settings of the local dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub relay: RelayConfig,
    pub tick_interval: Duration,
    /// Delete all records of the channel once before the first tick
    pub clean_on_start: bool,
    /// Delete completed records straight away if the event does not expect a response,
    /// e.g. SQS or S3 triggers. On by default.
    pub discard_unobserved: bool,
}

impl DispatcherConfig {
    pub fn new(relay: RelayConfig) -> Self {
        Self {
            relay,
            tick_interval: DEFAULT_TICK_INTERVAL,
            clean_on_start: false,
            discard_unobserved: true,
        }
    }
}
