use std::sync::{Arc, Mutex, MutexGuard};

use nightshift_core::{SharedClock, TaskId, UserId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::{Result, TaskError};
use crate::types::{Task, TaskIo, TaskStatus};

const TASK_COLUMNS: &str = "id, task_type, app_id, custom_id, user_id, status, input, output,
                            progress, error_message, scheduled_at, started_at, ended_at,
                            last_updated";

/// Statuses a task can still leave.
const OPEN: &str = "('scheduled', 'running')";

/// Give up claiming after this many lost races in one call.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Persistent task records.
///
/// Every status change is a conditional update on the current status, so
/// terminal states can never be overwritten, whichever process tries.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
}

impl TaskStore {
    pub fn new(conn: Connection, clock: SharedClock) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Persist a new task and assign its id. A task that already has an id
    /// is left as is.
    #[instrument(skip(self, task), fields(task_type = %task.task_type_id))]
    pub fn insert(&self, task: &mut Task) -> Result<TaskId> {
        if let Some(id) = task.id() {
            return Ok(id);
        }
        let now = self.clock.now();
        let input = serde_json::to_string(&task.input)?;
        let output = task.output.as_ref().map(serde_json::to_string).transpose()?;

        let db = self.db()?;
        db.execute(
            "INSERT INTO tasks
             (task_type, app_id, custom_id, user_id, status, input, output, progress,
              error_message, scheduled_at, started_at, ended_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, ?10)",
            params![
                task.task_type_id,
                task.app_id,
                task.custom_id,
                task.user_id.as_ref().map(UserId::as_str),
                task.status.to_string(),
                input,
                output,
                task.progress,
                task.error_message,
                now,
            ],
        )?;
        let id = TaskId(db.last_insert_rowid());
        task.assign_id(id)?;
        task.scheduled_at = now;
        task.last_updated = now;
        info!(task_id = %id, "task stored");
        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row = self
            .db()?
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.get()],
                TaskRow::from_row,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    /// SCHEDULED → RUNNING. `false` if the task was not scheduled.
    pub fn mark_running(&self, id: TaskId) -> Result<bool> {
        let now = self.clock.now();
        let n = self.db()?.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1, last_updated = ?1
             WHERE id = ?2 AND status = 'scheduled'",
            params![now, id.get()],
        )?;
        Ok(n > 0)
    }

    /// Record progress of a running task, clamped to `0..=1` (NaN counts as
    /// 0). `false` means the task is no longer running (typically cancelled)
    /// and the provider should stop.
    pub fn set_progress(&self, id: TaskId, progress: f64) -> Result<bool> {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        let now = self.clock.now();
        let n = self.db()?.execute(
            "UPDATE tasks SET progress = ?1, last_updated = ?2
             WHERE id = ?3 AND status = 'running'",
            params![progress, now, id.get()],
        )?;
        Ok(n > 0)
    }

    /// Move an open task to SUCCESSFUL (with output) or FAILED (with message).
    /// `false` if the task was already terminal.
    pub fn finish(&self, id: TaskId, result: std::result::Result<&TaskIo, &str>) -> Result<bool> {
        let now = self.clock.now();
        let db = self.db()?;
        let n = match result {
            Ok(output) => db.execute(
                &format!(
                    "UPDATE tasks SET status = 'successful', output = ?1, progress = 1,
                            error_message = NULL, ended_at = ?2, last_updated = ?2
                     WHERE id = ?3 AND status IN {OPEN}"
                ),
                params![serde_json::to_string(output)?, now, id.get()],
            )?,
            Err(message) => db.execute(
                &format!(
                    "UPDATE tasks SET status = 'failed', error_message = ?1,
                            ended_at = ?2, last_updated = ?2
                     WHERE id = ?3 AND status IN {OPEN}"
                ),
                params![message, now, id.get()],
            )?,
        };
        debug!(task_id = %id, finished = n > 0, "task finish recorded");
        Ok(n > 0)
    }

    /// Cancel an open task. `false` if it was already terminal.
    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        let now = self.clock.now();
        let n = self.db()?.execute(
            &format!(
                "UPDATE tasks SET status = 'cancelled', ended_at = ?1, last_updated = ?1
                 WHERE id = ?2 AND status IN {OPEN}"
            ),
            params![now, id.get()],
        )?;
        if n > 0 {
            info!(task_id = %id, "task cancelled");
        }
        Ok(n > 0)
    }

    /// Atomically take the oldest scheduled task of one of `task_types` and
    /// mark it running.
    pub fn claim_next_scheduled(&self, task_types: &[String]) -> Result<Option<Task>> {
        if task_types.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; task_types.len()].join(", ");
        let select = format!(
            "SELECT id FROM tasks
             WHERE status = 'scheduled' AND task_type IN ({placeholders})
             ORDER BY id
             LIMIT 1"
        );

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let candidate: Option<i64> = self
                .db()?
                .query_row(&select, params_from_iter(task_types.iter()), |row| row.get(0))
                .optional()?;
            let Some(id) = candidate else {
                return Ok(None);
            };
            let id = TaskId(id);
            if self.mark_running(id)? {
                debug!(task_id = %id, "scheduled task claimed");
                return self.get(id);
            }
        }
        Ok(None)
    }

    /// Tasks of `user_id` submitted by `app_id`, optionally narrowed to one
    /// custom id, oldest first.
    pub fn list_for_user_app(
        &self,
        user_id: &UserId,
        app_id: &str,
        custom_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        let db = self.db()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE user_id = ?1 AND app_id = ?2 AND (?3 IS NULL OR custom_id = ?3)
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![user_id.as_str(), app_id, custom_id], TaskRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub fn delete(&self, id: TaskId) -> Result<bool> {
        let n = self
            .db()?
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.get()])?;
        Ok(n > 0)
    }

    /// Delete terminal tasks last touched before `cutoff` (unix seconds).
    pub fn delete_finished_before(&self, cutoff: i64) -> Result<usize> {
        let n = self.db()?.execute(
            "DELETE FROM tasks
             WHERE status IN ('successful', 'failed', 'cancelled') AND last_updated < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TaskError::LockPoisoned)
    }
}

struct TaskRow {
    id: i64,
    task_type: String,
    app_id: String,
    custom_id: Option<String>,
    user_id: Option<String>,
    status: String,
    input: String,
    output: Option<String>,
    progress: f64,
    error_message: Option<String>,
    scheduled_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    last_updated: i64,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            app_id: row.get(2)?,
            custom_id: row.get(3)?,
            user_id: row.get(4)?,
            status: row.get(5)?,
            input: row.get(6)?,
            output: row.get(7)?,
            progress: row.get(8)?,
            error_message: row.get(9)?,
            scheduled_at: row.get(10)?,
            started_at: row.get(11)?,
            ended_at: row.get(12)?,
            last_updated: row.get(13)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|reason| TaskError::CorruptRow {
                id: self.id,
                reason,
            })?;
        let input: TaskIo = serde_json::from_str(&self.input)?;
        let output: Option<TaskIo> = self.output.as_deref().map(serde_json::from_str).transpose()?;

        let mut task = Task::new(self.task_type, input, self.app_id, self.user_id.map(UserId));
        task.assign_id(TaskId(self.id))?;
        task.status = status;
        task.output = output;
        task.custom_id = self.custom_id;
        task.progress = self.progress;
        task.error_message = self.error_message;
        task.scheduled_at = self.scheduled_at;
        task.started_at = self.started_at;
        task.ended_at = self.ended_at;
        task.last_updated = self.last_updated;
        Ok(task)
    }
}
