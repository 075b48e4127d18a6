use nightshift_core::{TaskId, TasksConfig};
use nightshift_jobs::{BackgroundJob, Job, JobContext, JobPolicy, TimeSensitivity};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::dispatcher::TaskDispatcher;
use crate::error::{ProcessingError, TaskError};
use crate::store::TaskStore;

pub const TASK_PROCESSING_CLASS: &str = "nightshift_tasks::TaskProcessingJob";
pub const CLEANUP_OLD_TASKS_CLASS: &str = "nightshift_tasks::CleanupOldTasksJob";

/// Job argument referencing a deferred task.
pub fn task_argument(id: TaskId) -> Value {
    json!({ "task_id": id.get() })
}

/// The queued job that runs task `id` in the background.
pub fn task_job(id: TaskId) -> Job {
    Job::new(
        TASK_PROCESSING_CLASS,
        task_argument(id),
        JobPolicy::Queued,
        TimeSensitivity::TimeSensitive,
    )
}

/// Runs one deferred task per job.
pub struct TaskProcessingJob {
    dispatcher: TaskDispatcher,
}

impl TaskProcessingJob {
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl BackgroundJob for TaskProcessingJob {
    fn class(&self) -> &str {
        TASK_PROCESSING_CLASS
    }

    fn policy(&self) -> JobPolicy {
        JobPolicy::Queued
    }

    fn run(&self, argument: &Value, _ctx: &JobContext<'_>) -> anyhow::Result<()> {
        let id = argument
            .get("task_id")
            .and_then(Value::as_i64)
            .map(TaskId)
            .ok_or_else(|| anyhow::anyhow!("task job argument without task_id: {argument}"))?;

        match self.dispatcher.run_scheduled_task(id) {
            Ok(()) => Ok(()),
            // The task went away or was cancelled; nothing left to do.
            Err(TaskError::TaskNotFound { .. })
            | Err(TaskError::Processing(ProcessingError::Cancelled)) => {
                debug!(task_id = %id, "deferred task gone or cancelled");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Deletes finished tasks that have not been touched for a while.
pub struct CleanupOldTasksJob {
    store: TaskStore,
    max_age_secs: i64,
    interval_secs: u64,
}

impl CleanupOldTasksJob {
    pub fn new(store: TaskStore, config: &TasksConfig) -> Self {
        Self {
            store,
            max_age_secs: config.cleanup_max_age().as_secs().min(i64::MAX as u64) as i64,
            interval_secs: config.cleanup_interval_secs,
        }
    }
}

impl BackgroundJob for CleanupOldTasksJob {
    fn class(&self) -> &str {
        CLEANUP_OLD_TASKS_CLASS
    }

    fn policy(&self) -> JobPolicy {
        JobPolicy::Timed {
            interval_secs: self.interval_secs,
        }
    }

    fn time_sensitivity(&self) -> TimeSensitivity {
        TimeSensitivity::TimeInsensitive
    }

    fn run(&self, _argument: &Value, ctx: &JobContext<'_>) -> anyhow::Result<()> {
        let cutoff = ctx.started_at.saturating_sub(self.max_age_secs);
        let deleted = self.store.delete_finished_before(cutoff)?;
        info!(deleted, cutoff, "old tasks cleaned up");
        Ok(())
    }
}
