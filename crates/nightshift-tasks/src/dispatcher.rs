use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use nightshift_core::{TaskId, TasksConfig, UserId};
use nightshift_jobs::JobList;
use tracing::{debug, error, info, instrument, warn};

use crate::background::{task_argument, task_job, TASK_PROCESSING_CLASS};
use crate::error::{ProcessingError, Result, TaskError};
use crate::events::{TaskEvent, TaskEventBus};
use crate::provider::TaskProvider;
use crate::registry::{ProviderRegistry, TaskTypeInfo};
use crate::shape::{retain_declared, validate};
use crate::store::TaskStore;
use crate::types::{Task, TaskIo, TaskStatus};

/// Entry point for submitting tasks.
///
/// A task either runs inline, when its provider is synchronous and expected
/// to finish within the caller's budget, or is stored as SCHEDULED and
/// handed to the job list as a queued job.
#[derive(Clone)]
pub struct TaskDispatcher {
    store: TaskStore,
    providers: Arc<ProviderRegistry>,
    job_list: JobList,
    events: Arc<TaskEventBus>,
    sync_budget: Duration,
}

impl TaskDispatcher {
    pub fn new(
        store: TaskStore,
        providers: Arc<ProviderRegistry>,
        job_list: JobList,
        events: Arc<TaskEventBus>,
        config: &TasksConfig,
    ) -> Self {
        Self {
            store,
            providers,
            job_list,
            events,
            sync_budget: config.sync_budget(),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<TaskEventBus> {
        &self.events
    }

    pub fn provider_registry(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn has_providers(&self) -> bool {
        self.providers.has_providers()
    }

    pub fn providers(&self) -> Vec<Arc<dyn TaskProvider>> {
        self.providers.providers()
    }

    pub fn available_task_types(&self) -> BTreeMap<String, TaskTypeInfo> {
        self.providers.available_task_types()
    }

    /// Run `task` now if it fits the configured budget, otherwise defer it.
    /// Returns whether it ran inline.
    pub fn run_or_schedule_task(&self, task: &mut Task) -> Result<bool> {
        self.run_or_schedule_task_within(task, self.sync_budget)
    }

    /// As [`run_or_schedule_task`](Self::run_or_schedule_task) with an
    /// explicit remaining budget.
    #[instrument(skip(self, task), fields(task_type = %task.task_type_id))]
    pub fn run_or_schedule_task_within(&self, task: &mut Task, budget: Duration) -> Result<bool> {
        let provider = self.require_provider(&task.task_type_id)?;
        prepare_input(provider.as_ref(), task)?;

        let capabilities = provider.capabilities();
        if capabilities.fits(budget) {
            debug!(
                provider = %provider.id(),
                expected_ms = capabilities.expected_runtime.map(|d| d.as_millis() as u64),
                budget_ms = budget.as_millis() as u64,
                "task fits budget; running inline"
            );
            self.execute_inline(provider.as_ref(), task, false)?;
            return Ok(true);
        }

        self.enqueue(task)?;
        Ok(false)
    }

    /// Run `task` in-process regardless of its expected runtime.
    #[instrument(skip(self, task), fields(task_type = %task.task_type_id))]
    pub fn run_task(&self, task: &mut Task) -> Result<TaskIo> {
        let provider = self.providers.get(&task.task_type_id).ok_or_else(|| {
            TaskError::PreconditionNotMet(format!(
                "no provider registered for task type {}",
                task.task_type_id
            ))
        })?;
        if !provider.capabilities().synchronous {
            return Err(TaskError::PreconditionNotMet(format!(
                "provider {} cannot run tasks in-process",
                provider.id()
            )));
        }
        prepare_input(provider.as_ref(), task)?;
        self.execute_inline(provider.as_ref(), task, false)
    }

    /// Store `task` as SCHEDULED and enqueue the job that will run it.
    #[instrument(skip(self, task), fields(task_type = %task.task_type_id))]
    pub fn schedule_task(&self, task: &mut Task) -> Result<TaskId> {
        let provider = self.require_provider(&task.task_type_id)?;
        prepare_input(provider.as_ref(), task)?;
        self.enqueue(task)
    }

    /// Background half of a deferred task. Called by the task processing job.
    ///
    /// A finished task is skipped. Tasks of external providers are left for
    /// [`next_scheduled_task`](Self::next_scheduled_task). A task found
    /// RUNNING was abandoned by an earlier delivery of this job (its worker
    /// died and the reservation went stale), so it is failed and published.
    pub fn run_scheduled_task(&self, id: TaskId) -> Result<()> {
        let mut task = self.get_task(id)?;
        if !matches!(task.status, TaskStatus::Scheduled | TaskStatus::Running) {
            debug!(task_id = %id, status = %task.status, "task already finished; skipping");
            return Ok(());
        }

        let Some(provider) = self.providers.get(&task.task_type_id) else {
            let err = TaskError::ProviderNotFound {
                task_type: task.task_type_id.clone(),
            };
            warn!(task_id = %id, error = %err, "deferred task has no provider");
            let message = err.to_string();
            self.store.finish(id, Err(message.as_str()))?;
            self.reload(&mut task)?;
            self.events.emit(&TaskEvent::Failed {
                task,
                error: message,
            });
            return Err(err);
        };

        if !provider.capabilities().synchronous {
            debug!(task_id = %id, provider = %provider.id(), "task left for external worker");
            return Ok(());
        }

        if task.status == TaskStatus::Running {
            return self.fail_abandoned(id, task);
        }

        self.execute_inline(provider.as_ref(), &mut task, true)
            .map(|_| ())
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        self.store.get(id)?.ok_or(TaskError::TaskNotFound { id })
    }

    /// The task, only if it belongs to `user_id`. A task of someone else is
    /// reported as not found.
    pub fn get_user_task(&self, id: TaskId, user_id: Option<&UserId>) -> Result<Task> {
        let task = self.get_task(id)?;
        if task.user_id.as_ref() != user_id {
            return Err(TaskError::TaskNotFound { id });
        }
        Ok(task)
    }

    pub fn get_user_tasks_by_app(
        &self,
        user_id: &UserId,
        app_id: &str,
        custom_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        self.store.list_for_user_app(user_id, app_id, custom_id)
    }

    /// Delete the task and any job still waiting to run it.
    pub fn delete_task(&self, id: TaskId) -> Result<bool> {
        self.job_list
            .remove(TASK_PROCESSING_CLASS, Some(&task_argument(id)))?;
        let deleted = self.store.delete(id)?;
        if deleted {
            info!(task_id = %id, "task deleted");
        }
        Ok(deleted)
    }

    /// Cancel a task that has not finished. A running inline provider sees
    /// the cancellation through its progress callback.
    pub fn cancel_task(&self, id: TaskId) -> Result<()> {
        if !self.store.cancel(id)? {
            let task = self.get_task(id)?;
            return Err(TaskError::InvalidState {
                id,
                status: task.status,
                action: "cancel",
            });
        }
        self.job_list
            .remove(TASK_PROCESSING_CLASS, Some(&task_argument(id)))?;
        Ok(())
    }

    /// For external workers: take the oldest SCHEDULED task of one of
    /// `task_type_ids` and mark it RUNNING.
    /// The claimed task's queued job is dropped; the external worker owns it
    /// from here on.
    pub fn next_scheduled_task(&self, task_type_ids: &[String]) -> Result<Option<Task>> {
        let claimed = self.store.claim_next_scheduled(task_type_ids)?;
        if let Some(id) = claimed.as_ref().and_then(Task::id) {
            self.job_list
                .remove(TASK_PROCESSING_CLASS, Some(&task_argument(id)))?;
        }
        Ok(claimed)
    }

    /// For external workers. `false` means the task is no longer running and
    /// the worker should stop.
    pub fn set_task_progress(&self, id: TaskId, progress: f64) -> Result<bool> {
        self.store.set_progress(id, progress)
    }

    /// For external workers: finish a task with its output or an error
    /// message. Output that does not match the provider's output shape fails
    /// the task.
    #[instrument(skip(self, result))]
    pub fn set_task_result(
        &self,
        id: TaskId,
        result: std::result::Result<TaskIo, String>,
    ) -> Result<Task> {
        let mut task = self.get_task(id)?;
        let result = match (result, self.providers.get(&task.task_type_id)) {
            (Ok(output), Some(provider)) => check_output(provider.as_ref(), output)
                .map_err(|e| e.to_string()),
            (other, _) => other,
        };

        let finished = match &result {
            Ok(output) => self.store.finish(id, Ok(output))?,
            Err(message) => self.store.finish(id, Err(message.as_str()))?,
        };
        self.reload(&mut task)?;
        if !finished {
            return Err(TaskError::InvalidState {
                id,
                status: task.status,
                action: "set result",
            });
        }

        let event = match result {
            Ok(_) => TaskEvent::Successful { task: task.clone() },
            Err(error) => TaskEvent::Failed {
                task: task.clone(),
                error,
            },
        };
        self.events.emit(&event);
        Ok(task)
    }

    fn require_provider(&self, task_type_id: &str) -> Result<Arc<dyn TaskProvider>> {
        self.providers
            .get(task_type_id)
            .ok_or_else(|| TaskError::ProviderNotFound {
                task_type: task_type_id.to_string(),
            })
    }

    fn enqueue(&self, task: &mut Task) -> Result<TaskId> {
        match task.id() {
            Some(id) if task.status != TaskStatus::Scheduled => {
                return Err(TaskError::InvalidState {
                    id,
                    status: task.status,
                    action: "schedule",
                })
            }
            Some(_) => {}
            None => task.status = TaskStatus::Scheduled,
        }
        let id = self.store.insert(task)?;
        let job_id = self.job_list.add_job(&mut task_job(id))?;
        info!(task_id = %id, job_id = %job_id, "task scheduled");
        Ok(id)
    }

    fn fail_abandoned(&self, id: TaskId, mut task: Task) -> Result<()> {
        let err = ProcessingError::Interrupted("worker stopped before the task finished".into());
        let message = err.to_string();
        if !self.store.finish(id, Err(message.as_str()))? {
            debug!(task_id = %id, "abandoned task finished concurrently");
            return Ok(());
        }
        warn!(task_id = %id, started_at = ?task.started_at, "abandoned running task failed");
        self.reload(&mut task)?;
        self.events.emit(&TaskEvent::Failed {
            task,
            error: message,
        });
        Err(err.into())
    }

    /// Run `task` through `provider` on the calling thread, persisting each
    /// transition. With `notify`, the outcome is also published on the bus.
    fn execute_inline(
        &self,
        provider: &dyn TaskProvider,
        task: &mut Task,
        notify: bool,
    ) -> Result<TaskIo> {
        let id = self.store.insert(task)?;
        if !self.store.mark_running(id)? {
            let current = self.get_task(id)?;
            return Err(TaskError::InvalidState {
                id,
                status: current.status,
                action: "run",
            });
        }
        info!(task_id = %id, provider = %provider.id(), "running task");

        let store = self.store.clone();
        let mut report = |progress: f64| match store.set_progress(id, progress) {
            Ok(running) => running,
            Err(e) => {
                warn!(task_id = %id, error = %e, "could not record task progress");
                true
            }
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            provider.process(task.user_id.as_ref(), &task.input, &mut report)
        }))
        .unwrap_or_else(|payload| {
            error!(task_id = %id, provider = %provider.id(), "provider panicked");
            Err(ProcessingError::Interrupted(format!(
                "provider panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
        .and_then(|output| check_output(provider, output));

        let finished = match &result {
            Ok(output) => self.store.finish(id, Ok(output))?,
            Err(ProcessingError::Cancelled) => self.store.cancel(id)?,
            Err(e) => self.store.finish(id, Err(e.to_string().as_str()))?,
        };
        self.reload(task)?;

        if task.status == TaskStatus::Cancelled {
            info!(task_id = %id, "task cancelled while running");
            return Err(ProcessingError::Cancelled.into());
        }
        if !finished {
            return Err(TaskError::InvalidState {
                id,
                status: task.status,
                action: "finish",
            });
        }

        match result {
            Ok(output) => {
                info!(task_id = %id, "task successful");
                if notify {
                    self.events.emit(&TaskEvent::Successful { task: task.clone() });
                }
                Ok(output)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "task failed");
                if notify {
                    self.events.emit(&TaskEvent::Failed {
                        task: task.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e.into())
            }
        }
    }

    fn reload(&self, task: &mut Task) -> Result<()> {
        let id = match task.id() {
            Some(id) => id,
            None => return Ok(()),
        };
        *task = self.get_task(id)?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Validate the input against the provider's shapes and drop undeclared keys.
fn prepare_input(provider: &dyn TaskProvider, task: &mut Task) -> Result<()> {
    let required = provider.input_shape();
    let optional = provider.optional_input_shape();
    validate(&task.input, &required, &optional).map_err(TaskError::InvalidInput)?;
    retain_declared(&mut task.input, &required, &optional);
    Ok(())
}

fn check_output(
    provider: &dyn TaskProvider,
    mut output: TaskIo,
) -> std::result::Result<TaskIo, ProcessingError> {
    let required = provider.output_shape();
    let optional = provider.optional_output_shape();
    validate(&output, &required, &optional).map_err(ProcessingError::InvalidOutput)?;
    retain_declared(&mut output, &required, &optional);
    Ok(output)
}
