use rusqlite::Connection;

use crate::error::Result;

/// Initialise the task schema in `conn`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            task_type     TEXT    NOT NULL,
            app_id        TEXT    NOT NULL,
            custom_id     TEXT,
            user_id       TEXT,               -- NULL for system tasks
            status        TEXT    NOT NULL DEFAULT 'scheduled',
            input         TEXT    NOT NULL,   -- JSON object
            output        TEXT,               -- JSON object or NULL
            progress      REAL    NOT NULL DEFAULT 0,
            error_message TEXT,
            scheduled_at  INTEGER NOT NULL,
            started_at    INTEGER,
            ended_at      INTEGER,
            last_updated  INTEGER NOT NULL
        ) STRICT;

        -- External workers poll: WHERE status = 'scheduled' AND task_type IN (...)
        CREATE INDEX IF NOT EXISTS idx_tasks_status_type
            ON tasks (status, task_type, id);

        CREATE INDEX IF NOT EXISTS idx_tasks_user_app
            ON tasks (user_id, app_id, custom_id);

        CREATE INDEX IF NOT EXISTS idx_tasks_last_updated
            ON tasks (last_updated);
        ",
    )?;
    Ok(())
}
