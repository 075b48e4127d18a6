use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection suitable for sharing a database file between several
/// stores and worker processes: WAL journal and a busy timeout.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Initialise the job list schema in `conn`.
///
/// Creates the `jobs` table (idempotent), the uniqueness index that makes
/// `add` idempotent across processes, and an index covering the `get_next`
/// selection order.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            class                 TEXT    NOT NULL,
            argument              TEXT    NOT NULL,   -- canonical JSON
            argument_hash         TEXT    NOT NULL,   -- sha256 hex of argument
            policy                TEXT    NOT NULL,   -- regular | queued | timed
            interval_secs         INTEGER NOT NULL DEFAULT 0,
            time_sensitive        INTEGER NOT NULL DEFAULT 1,
            last_run              INTEGER NOT NULL DEFAULT 0,
            reserved_at           INTEGER NOT NULL DEFAULT 0,
            execution_duration_ms INTEGER             -- NULL until first run
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_identity
            ON jobs (class, argument_hash);

        CREATE INDEX IF NOT EXISTS idx_jobs_selection
            ON jobs (time_sensitive, last_run, reserved_at);

        CREATE TABLE IF NOT EXISTS scheduler_state (
            key   TEXT NOT NULL PRIMARY KEY,
            value TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
