use std::time;

use ingest_common::event::ParseError;
use ingest_common::queue::QueueError;
use ingest_common::sink::WriteError;
use thiserror::Error;

use crate::config::ConfigValidationError;

/// Enumeration of errors that prevent a single message from being processed.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] ParseError),
    #[error("failed to persist login event: {0}")]
    PersistError(#[from] WriteError),
    #[error("queue request failed: {0}")]
    QueueError(#[from] QueueError),
    #[error("{operation} timed out after {timeout:?}")]
    TimeoutError {
        operation: &'static str,
        timeout: time::Duration,
    },
}

/// What the worker does with a message it could not process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Leave the message in the queue, it will be delivered again.
    RetryLater,
    /// The message will never succeed: divert it for inspection.
    DeadLetter,
}

impl ProcessingError {
    pub fn resolution(&self) -> Resolution {
        match self {
            ProcessingError::MalformedMessage(_) => Resolution::DeadLetter,
            ProcessingError::PersistError(error) if !error.is_retryable() => {
                Resolution::DeadLetter
            }
            ProcessingError::PersistError(_)
            | ProcessingError::QueueError(_)
            | ProcessingError::TimeoutError { .. } => Resolution::RetryLater,
        }
    }
}

/// Enumeration of errors that stop the worker. These can only happen at startup.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
    #[error("failed to connect to the database: {0}")]
    DatabaseError(#[from] WriteError),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
