use crate::task::{TaskId, TaskStatus};
use std::path::PathBuf;

/// Errors raised by the queue store and its validation layer.
///
/// An unknown task id is not an error: lookups return `None` and deletes
/// return `false`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A queue file failed to parse. Recovered from backup or degraded to an
    /// empty document by the store; never returned from a read.
    #[error("queue document {} is corrupted: {reason}", path.display())]
    QueueCorrupted { path: PathBuf, reason: String },

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("invalid status '{0}' (expected pending, in_progress, review or done)")]
    InvalidStatus(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("task {id} is '{status}', expected '{expected}'")]
    InvalidTransition {
        id: TaskId,
        status: TaskStatus,
        expected: TaskStatus,
    },

    /// The temp file could not be renamed over its target.
    #[error("failed to replace {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the caller sent bad input (as opposed to a storage fault).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidArtifact(_)
                | QueueError::InvalidStatus(_)
                | QueueError::InvalidField { .. }
                | QueueError::InvalidTransition { .. }
        )
    }
}
