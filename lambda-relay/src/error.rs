//! Error types shared by both sides of the relay.
use thiserror::Error;

/// A failure talking to the table that carries the relay records.
/// The relay loops log these and retry on the next tick rather than giving up.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request to the store failed, e.g. network, throttling or permissions
    #[error("Store request failed: {0}")]
    Request(String),

    /// An item came back without the attributes a relay record must have
    #[error("Malformed item {key}: {reason}")]
    MalformedItem { key: String, reason: String },

    /// A request could not be built from the record, e.g. a missing key attribute
    #[error("Invalid store request: {0}")]
    InvalidRequest(String),

    /// Batch items the store did not process even after retries
    #[error("{0} batch items were not processed")]
    Unprocessed(usize),

    /// The in-memory store was switched offline to simulate an outage
    #[error("Store is unavailable")]
    Unavailable,
}

impl StoreError {
    pub(crate) fn request(e: impl std::fmt::Display) -> Self {
        Self::Request(e.to_string())
    }

    pub(crate) fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedItem {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Invalid or missing settings. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing {0} env var")]
    MissingEnvVar(&'static str),

    #[error("Channel name cannot be empty")]
    EmptyChannel,

    #[error("Table name cannot be empty")]
    EmptyTable,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// The local handler resolver has nothing registered under the requested function name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("No local handler for function {0}")]
pub struct HandlerNotFound(pub String);
