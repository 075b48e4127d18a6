use nightshift_core::JobId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JobError, Result};

/// Whether a job must still run when the scheduler is restricted to urgent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSensitivity {
    TimeInsensitive,
    TimeSensitive,
}

impl TimeSensitivity {
    pub fn as_flag(self) -> i64 {
        match self {
            TimeSensitivity::TimeInsensitive => 0,
            TimeSensitivity::TimeSensitive => 1,
        }
    }

    pub fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            TimeSensitivity::TimeInsensitive
        } else {
            TimeSensitivity::TimeSensitive
        }
    }
}

/// How a job behaves across scheduling ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPolicy {
    /// Eligible on every tick, never removes itself.
    Regular,
    /// Eligible once, removed after its run completes.
    Queued,
    /// Eligible once `interval_secs` have passed since the last run.
    Timed { interval_secs: u64 },
}

/// A background job as held by the job list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: Option<JobId>,
    /// Registry key of the handler that runs this job.
    pub class: String,
    /// Opaque payload handed to the handler.
    pub argument: Value,
    pub policy: JobPolicy,
    pub time_sensitivity: TimeSensitivity,
    /// Unix seconds of the last execution start, 0 if never run.
    pub last_run: i64,
    /// Duration of the most recent run in milliseconds, if any.
    pub execution_duration_ms: Option<i64>,
    /// Unix seconds when the current reservation was taken, 0 when free.
    pub reserved_at: i64,
}

impl Job {
    pub fn new(
        class: impl Into<String>,
        argument: Value,
        policy: JobPolicy,
        time_sensitivity: TimeSensitivity,
    ) -> Self {
        Self {
            id: None,
            class: class.into(),
            argument,
            policy,
            time_sensitivity,
            last_run: 0,
            execution_duration_ms: None,
            reserved_at: 0,
        }
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    /// The id, or `Unsaved` for a job that never went through the job list.
    pub fn require_id(&self) -> Result<JobId> {
        self.id.ok_or_else(|| JobError::Unsaved {
            class: self.class.clone(),
        })
    }

    /// Set the id once. Re-assigning the same value is a no-op; any other
    /// value is refused.
    pub fn assign_id(&mut self, id: JobId) -> Result<()> {
        match self.id {
            None => {
                self.id = Some(id);
                Ok(())
            }
            Some(current) if current == id => Ok(()),
            Some(current) => Err(JobError::IllegalIdentityChange {
                current,
                attempted: id,
            }),
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at != 0
    }
}

/// Raw stored record of a job, as returned by `JobList::get_details_by_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub id: JobId,
    pub class: String,
    /// Canonical JSON text of the argument.
    pub argument: String,
    pub argument_hash: String,
    pub policy: String,
    pub interval_secs: i64,
    pub time_sensitive: bool,
    pub last_run: i64,
    pub reserved_at: i64,
    pub execution_duration_ms: Option<i64>,
}
