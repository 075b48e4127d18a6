use nightshift_core::JobId;
use thiserror::Error;

/// Errors that can occur within the job list and scheduler.
#[derive(Debug, Error)]
pub enum JobError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A job argument could not be encoded or a stored one decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a policy or sensitivity value this build does not know.
    #[error("Corrupt job row {id}: {reason}")]
    CorruptRow { id: i64, reason: String },

    /// The job was never inserted into a job list, so it has no id yet.
    #[error("Job of class {class} has no id; add it to the job list first")]
    Unsaved { class: String },

    /// An id was already assigned and something tried to replace it.
    #[error("Job id is immutable: already {current}, refused {attempted}")]
    IllegalIdentityChange { current: JobId, attempted: JobId },

    /// A mutex guarding a connection was poisoned by a panicking holder.
    #[error("Job list lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, JobError>;
