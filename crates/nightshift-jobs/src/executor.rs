use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::error::Result;
use crate::list::JobList;
use crate::policy::Disposition;
use crate::registry::{JobContext, JobRegistry};
use crate::types::Job;

/// How a single reserved job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler returned `Ok`.
    Succeeded,
    /// The handler returned an error. The run still counts as completed.
    Failed,
    /// The handler panicked; the reservation was released and the policy
    /// was not applied, so the job stays in the list.
    Aborted,
    /// No handler is registered for the class; the job was dropped.
    Removed,
}

/// Run a job previously reserved by [`JobList::get_next`].
///
/// Stamps `last_run`, runs the handler, records the execution time and then
/// applies the policy: queued jobs are removed, others are released back to
/// pending. Errors returned here come from the job list itself, never from
/// the handler.
pub fn execute_job(job_list: &JobList, registry: &JobRegistry, job: &Job) -> Result<JobOutcome> {
    let id = job.require_id()?;

    let Some(handler) = registry.get(&job.class) else {
        warn!(job_id = %id, class = %job.class, "no handler registered for job class; removing job");
        job_list.remove_by_id(id)?;
        return Ok(JobOutcome::Removed);
    };

    let started_at = job_list.set_last_run(job)?;
    let ctx = JobContext {
        job_id: id,
        job_list,
        started_at,
    };

    info!(job_id = %id, class = %job.class, "running job");
    let timer = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler.run(&job.argument, &ctx)));
    let elapsed = timer.elapsed();
    job_list.set_execution_time(job, elapsed)?;

    let outcome = match result {
        Ok(Ok(())) => {
            info!(job_id = %id, class = %job.class, duration_ms = elapsed.as_millis() as u64, "job finished");
            JobOutcome::Succeeded
        }
        Ok(Err(e)) => {
            warn!(job_id = %id, class = %job.class, error = %e, "job failed");
            JobOutcome::Failed
        }
        Err(payload) => {
            error!(
                job_id = %id,
                class = %job.class,
                panic = panic_message(payload.as_ref()),
                "job panicked; releasing reservation"
            );
            job_list.unlock_job(job)?;
            return Ok(JobOutcome::Aborted);
        }
    };

    match job.policy.after_run() {
        Disposition::Remove => {
            job_list.remove_by_id(id)?;
        }
        Disposition::Keep => {
            job_list.unlock_job(job)?;
        }
    }
    Ok(outcome)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
