//! Error types for the aggregation engine

use thiserror::Error;

/// Errors surfaced by the profiler library.
///
/// Session-control outcomes such as "too many profiles" or "no such
/// session" are not errors; they are reported through return values.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("events processor is not running")]
    ProcessorStopped,

    #[error("no tokio runtime available to run the events processor")]
    NoRuntime,

    #[error("events processor task failed: {0}")]
    ProcessorFailed(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
