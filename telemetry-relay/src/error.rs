use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors raised while relaying a single record.
/// They are collected per batch and never stop the remaining records from being relayed.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record is missing required metadata key {0}")]
    MissingMetadata(&'static str),
    #[error("record metadata key {key} has invalid value {value:?}: {reason}")]
    InvalidMetadata {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to serialize notification: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("notification could not be delivered: {0}")]
    Sink(#[from] SinkError),
}

/// Errors returned by a `NotificationSink` when delivering a notification.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("request to push service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("push service rejected notification with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to sign push service access token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("invalid push service url: {0}")]
    Url(#[from] url::ParseError),
}

/// The outcome of a batch in which at least one record failed.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Exactly one record failed, its error is surfaced as is.
    #[error(transparent)]
    Record(RecordError),
    /// More than one record failed.
    #[error("{} records failed to relay", .0.len())]
    Aggregate(Vec<RecordError>),
}

impl BatchError {
    /// Combine the errors collected over a batch, returning `None` when there are none.
    pub fn from_errors(mut errors: Vec<RecordError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop().map(BatchError::Record),
            _ => Some(BatchError::Aggregate(errors)),
        }
    }

    pub fn errors(&self) -> &[RecordError] {
        match self {
            BatchError::Record(error) => std::slice::from_ref(error),
            BatchError::Aggregate(errors) => errors,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("{0} must be set when using the {1} sink")]
    MissingSetting(&'static str, &'static str),
    #[error("unknown sink {0}, must be one of: signalr, log")]
    UnknownSink(String),
    #[error("SIGNALR_TOKEN_TTL_SECS must be a positive number of seconds in range, got {0}")]
    InvalidTokenTtl(u64),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}
