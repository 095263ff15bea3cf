use std::time::Duration;

use thiserror::Error;

/// Caller-attributable publish failures.
///
/// Durability problems are not reported here: they only show up as
/// `PublishReceipt::persisted == false` and in the logs.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event kind must not be empty")]
    EmptyKind,

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("subscription kind must not be empty")]
    EmptyKind,

    #[error("broker is shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("log backend unavailable: {0}")]
    Unavailable(String),
}

/// A failure raised by a subscriber's handler.
///
/// Never returned to a publisher; built at the broker boundary so the failure
/// is logged with the identity of everything involved.
#[derive(Debug, Error)]
#[error("handler {owner} (subscription {subscription}) failed on {kind} from {source_agent}: {message}")]
pub struct HandlerError {
    pub subscription: u64,
    pub owner: String,
    pub kind: String,
    pub source_agent: String,
    pub message: String,
}

/// A log record that could not be decoded; the reader skips it.
#[derive(Debug, Error)]
#[error("corrupt record in {segment} at line {line}: {reason}")]
pub struct LogCorruption {
    pub segment: String,
    pub line: usize,
    pub reason: String,
}

/// Errors raised while assembling a bus from configuration.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
