use nightshift_core::TaskId;
use nightshift_jobs::JobError;
use thiserror::Error;

use crate::types::TaskStatus;

/// Failure reported by a provider while processing a task.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    #[error("Processing failed: {0}")]
    Failed(String),

    /// The provider stopped because the progress callback said so.
    #[error("Processing cancelled")]
    Cancelled,

    /// The provider returned output that does not match its output shape.
    #[error("Invalid provider output: {0}")]
    InvalidOutput(String),

    /// The run ended without a result: the provider panicked, or the worker
    /// driving it went away and its job was picked up again.
    #[error("Processing interrupted: {0}")]
    Interrupted(String),

    /// The provider is only reachable through an external worker.
    #[error("Provider cannot run in-process")]
    NotSynchronous,
}

/// Errors that can occur within task dispatch and storage.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Enqueuing the deferred job failed.
    #[error("Job list error: {0}")]
    JobList(#[from] JobError),

    /// No provider is registered for the task type. Permanent; never retried.
    #[error("No provider registered for task type {task_type}")]
    ProviderNotFound { task_type: String },

    /// A precondition of the call does not hold, e.g. asking for inline
    /// execution from a provider that only runs out of process.
    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Invalid task input: {0}")]
    InvalidInput(String),

    /// The provider failed; the task was marked FAILED (or CANCELLED).
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("Task not found: {id}")]
    TaskNotFound { id: TaskId },

    /// The task is not in a state that allows the requested transition.
    #[error("Task {id} is {status}; cannot {action}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Task id is immutable: already {current}, refused {attempted}")]
    IllegalIdentityChange { current: TaskId, attempted: TaskId },

    #[error("Stored task {id} is corrupt: {reason}")]
    CorruptRow { id: i64, reason: String },

    #[error("Task store lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, TaskError>;
