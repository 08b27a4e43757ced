//! Error taxonomy shared by every runtime component.

use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised by queues, the event store and job controllers.
///
/// Variants are grouped by how a caller is expected to react:
/// configuration errors are fatal, contention errors mean "skip and retry later",
/// liveness errors are returned to the consumer and `Remote` means the operation
/// could not be attempted at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Event already locked: {reference}")]
    LockHeld { reference: String },

    #[error("Unknown consumer '{consumer}' on queue '{queue}'")]
    UnknownConsumer { queue: String, consumer: String },

    #[error("Queue '{queue}' finished")]
    QueueFinished { queue: String },

    #[error("Queue '{queue}' is empty")]
    QueueEmpty { queue: String },

    #[error("Job execution failed: {0}")]
    JobExecution(String),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RuntimeError {
    /// Whether the error came from the transport rather than the remote object.
    pub fn is_remote(&self) -> bool {
        matches!(self, RuntimeError::Remote(_))
    }

    /// Whether the error is an expected, non-fatal contention signal.
    pub fn is_contention(&self) -> bool {
        matches!(self, RuntimeError::LockHeld { .. })
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

/// Error returned by a job body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for JobError {
    fn from(err: RuntimeError) -> Self {
        JobError::new(err.to_string())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError::new(message)
    }
}
