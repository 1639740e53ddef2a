use std::time::Duration;

use thiserror::Error;

// ------------------------------------------------------------
// Error taxonomy
// ------------------------------------------------------------
//
// Each layer of the pipeline owns one error type:
//
// - ConfigError:        registry / configuration problems, returned
//                       synchronously to the caller
// - FetchError:         adapter failures, converted into
//                       CollectionError events by the scheduler
// - NormalizationError: one malformed entity inside a payload
// - StorageError /
//   PredictionError:    collaborator failures inside the router
//
// A rate-limit denial is NOT an error. The scheduler just skips the tick.
//

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source not found: {0}")]
    NotFound(String),

    #[error("invalid source '{id}': {reason}")]
    InvalidSource { id: String, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("no adapter registered for mechanism '{0}'")]
    UnsupportedMechanism(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("entity is not a JSON object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload has no '{0}' list")]
    MissingList(&'static str),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error("prediction request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("prediction service returned status {0}")]
    Status(u16),

    #[error("prediction service error: {0}")]
    Service(String),
}
