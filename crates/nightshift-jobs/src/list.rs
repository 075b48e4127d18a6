use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nightshift_core::{JobId, SchedulerConfig, SharedClock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::db::init_db;
use crate::error::{JobError, Result};
use crate::registry::BackgroundJob;
use crate::types::{Job, JobDetails, JobPolicy, TimeSensitivity};

const JOB_COLUMNS: &str = "id, class, argument, policy, interval_secs, time_sensitive,
                           last_run, reserved_at, execution_duration_ms";

/// Give up on a `get_next` call after this many lost reservation races.
const MAX_CLAIM_ATTEMPTS: usize = 16;

/// Result of the compare-and-set that turns a candidate into a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// The job was free and is now ours.
    Fresh,
    /// The job carried an abandoned reservation, which we took over.
    Reclaimed { reserved_at: i64 },
    /// Someone else changed the row between our read and our write.
    Conflict,
}

/// Durable list of background jobs with exclusive reservations.
///
/// Backed by a SQLite `jobs` table. Every reservation change is a conditional
/// `UPDATE ... WHERE reserved_at = <observed>`, so several `JobList`s (in this
/// process or others) may share one database file without ever handing the
/// same job to two ticks.
#[derive(Clone)]
pub struct JobList {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
    stale_reservation_secs: i64,
    prefer_time_sensitive: bool,
}

impl JobList {
    pub fn new(conn: Connection, clock: SharedClock, config: &SchedulerConfig) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            stale_reservation_secs: config.stale_reservation_secs.min(i64::MAX as u64) as i64,
            prefer_time_sensitive: config.prefer_time_sensitive,
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Add `handler`'s job for `argument`. Adding an equal class + argument
    /// pair again returns the existing id and refreshes its policy and time
    /// sensitivity from `handler`.
    pub fn add(&self, handler: &dyn BackgroundJob, argument: Value) -> Result<JobId> {
        let mut job = handler.to_job(argument);
        self.add_job(&mut job)
    }

    /// Insert `job` (or update its twin) and assign the resulting id to it.
    ///
    /// An existing row keeps its `last_run` and reservation; only the policy
    /// columns follow the new definition.
    #[instrument(skip(self, job), fields(class = %job.class))]
    pub fn add_job(&self, job: &mut Job) -> Result<JobId> {
        let (argument, hash) = encode_argument(&job.argument)?;
        let interval_secs = i64::try_from(job.policy.interval_secs()).unwrap_or(i64::MAX);
        let db = self.db()?;
        let existing: Option<i64> = db
            .query_row(
                "SELECT id FROM jobs WHERE class = ?1 AND argument_hash = ?2",
                params![job.class, hash],
                |row| row.get(0),
            )
            .optional()?;
        db.execute(
            "INSERT INTO jobs
             (class, argument, argument_hash, policy, interval_secs, time_sensitive,
              last_run, reserved_at, execution_duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL)
             ON CONFLICT (class, argument_hash) DO UPDATE SET
                policy = excluded.policy,
                interval_secs = excluded.interval_secs,
                time_sensitive = excluded.time_sensitive",
            params![
                job.class,
                argument,
                hash,
                job.policy.kind(),
                interval_secs,
                job.time_sensitivity.as_flag(),
            ],
        )?;
        let id = match existing {
            Some(id) => {
                debug!(job_id = id, "job already present; policy refreshed");
                JobId(id)
            }
            None => {
                let id = JobId(db.last_insert_rowid());
                info!(job_id = %id, "job added");
                id
            }
        };
        job.assign_id(id)?;
        Ok(id)
    }

    /// Remove the `class` job for `argument`, or every `class` job when
    /// `argument` is `None`. Returns the number of rows deleted.
    pub fn remove(&self, class: &str, argument: Option<&Value>) -> Result<usize> {
        let db = self.db()?;
        let n = match argument {
            Some(argument) => {
                let (_, hash) = encode_argument(argument)?;
                db.execute(
                    "DELETE FROM jobs WHERE class = ?1 AND argument_hash = ?2",
                    params![class, hash],
                )?
            }
            None => db.execute("DELETE FROM jobs WHERE class = ?1", params![class])?,
        };
        if n > 0 {
            info!(%class, count = n, "jobs removed");
        }
        Ok(n)
    }

    pub fn remove_by_id(&self, id: JobId) -> Result<bool> {
        let n = self
            .db()?
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.get()])?;
        if n > 0 {
            info!(job_id = %id, "job removed");
        }
        Ok(n > 0)
    }

    pub fn has(&self, class: &str, argument: &Value) -> Result<bool> {
        let (_, hash) = encode_argument(argument)?;
        let exists: bool = self.db()?.query_row(
            "SELECT EXISTS (SELECT 1 FROM jobs WHERE class = ?1 AND argument_hash = ?2)",
            params![class, hash],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Reserve and return the next due job, or `None` when nothing is due.
    ///
    /// Candidates are unreserved (or stale-reserved) jobs whose policy makes
    /// them due now, restricted to time-sensitive ones when asked. The oldest
    /// `last_run` goes first; time-sensitive jobs are served ahead of the rest
    /// unless the list was configured otherwise.
    pub fn get_next(&self, only_time_sensitive: bool) -> Result<Option<Job>> {
        let order = if self.prefer_time_sensitive {
            "time_sensitive DESC, last_run ASC, id ASC"
        } else {
            "last_run ASC, time_sensitive DESC, id ASC"
        };
        let sensitivity = if only_time_sensitive {
            " AND time_sensitive = 1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (reserved_at = 0 OR reserved_at <= ?1)
               AND (policy <> 'timed' OR ?2 - last_run >= interval_secs)
               {sensitivity}
             ORDER BY {order}
             LIMIT 1"
        );

        let db = self.db()?;
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let now = self.clock.now();
            let stale_cutoff = now.saturating_sub(self.stale_reservation_secs);

            let candidate = db
                .prepare_cached(&sql)?
                .query_row(params![stale_cutoff, now], JobRow::from_row)
                .optional()?;
            let Some(row) = candidate else {
                return Ok(None);
            };
            let mut job = row.into_job()?;
            let id = job.require_id()?;

            match claim(&db, id, job.reserved_at, now)? {
                Claim::Fresh => {
                    debug!(job_id = %id, class = %job.class, "job reserved");
                }
                Claim::Reclaimed { reserved_at } => {
                    warn!(
                        job_id = %id,
                        class = %job.class,
                        reserved_at,
                        age_secs = now - reserved_at,
                        "reclaimed stale reservation; the job may run twice"
                    );
                }
                Claim::Conflict => {
                    debug!(job_id = %id, "lost reservation race, trying next candidate");
                    continue;
                }
            }
            job.reserved_at = now;
            return Ok(Some(job));
        }

        warn!(
            attempts = MAX_CLAIM_ATTEMPTS,
            "giving up on get_next after repeated reservation conflicts"
        );
        Ok(None)
    }

    pub fn get_by_id(&self, id: JobId) -> Result<Option<Job>> {
        let row = self
            .db()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.get()],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn get_details_by_id(&self, id: JobId) -> Result<Option<JobDetails>> {
        let details = self
            .db()?
            .query_row(
                "SELECT id, class, argument, argument_hash, policy, interval_secs,
                        time_sensitive, last_run, reserved_at, execution_duration_ms
                 FROM jobs WHERE id = ?1",
                params![id.get()],
                |row| {
                    Ok(JobDetails {
                        id: JobId(row.get(0)?),
                        class: row.get(1)?,
                        argument: row.get(2)?,
                        argument_hash: row.get(3)?,
                        policy: row.get(4)?,
                        interval_secs: row.get(5)?,
                        time_sensitive: row.get::<_, i64>(6)? != 0,
                        last_run: row.get(7)?,
                        reserved_at: row.get(8)?,
                        execution_duration_ms: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(details)
    }

    /// Page through stored jobs in id order, optionally for one class only.
    pub fn list(&self, class: Option<&str>, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let db = self.db()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR class = ?1)
             ORDER BY id
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![class, limit as i64, offset as i64],
                JobRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Whether any job (of `class`, if given) holds a live reservation.
    pub fn has_reserved_jobs(&self, class: Option<&str>) -> Result<bool> {
        let stale_cutoff = self.clock.now().saturating_sub(self.stale_reservation_secs);
        let exists: bool = self.db()?.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE reserved_at <> 0 AND reserved_at > ?1
                  AND (?2 IS NULL OR class = ?2))",
            params![stale_cutoff, class],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Remember `job` as the most recently selected one.
    pub fn set_last_job(&self, job: &Job) -> Result<()> {
        let id = job.require_id()?;
        self.db()?.execute(
            "INSERT INTO scheduler_state (key, value) VALUES ('last_job', ?1)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![id.get().to_string()],
        )?;
        Ok(())
    }

    pub fn last_job(&self) -> Result<Option<JobId>> {
        let value: Option<String> = self
            .db()?
            .query_row(
                "SELECT value FROM scheduler_state WHERE key = 'last_job'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).map(JobId))
    }

    /// Stamp `last_run = now` for `job`. Returns the stamped time.
    pub fn set_last_run(&self, job: &Job) -> Result<i64> {
        let id = job.require_id()?;
        let now = self.clock.now();
        self.db()?.execute(
            "UPDATE jobs SET last_run = ?1 WHERE id = ?2",
            params![now, id.get()],
        )?;
        Ok(now)
    }

    pub fn set_execution_time(&self, job: &Job, taken: Duration) -> Result<()> {
        let id = job.require_id()?;
        let ms = taken.as_millis().min(i64::MAX as u128) as i64;
        self.db()?.execute(
            "UPDATE jobs SET execution_duration_ms = ?1 WHERE id = ?2",
            params![ms, id.get()],
        )?;
        Ok(())
    }

    /// Release the reservation on `job` without touching `last_run`.
    ///
    /// When `job` carries the reservation time it was handed out with, the
    /// release only succeeds if that reservation is still the current one; a
    /// reservation that went stale and was reclaimed elsewhere is left alone
    /// and `false` is returned.
    pub fn unlock_job(&self, job: &Job) -> Result<bool> {
        let id = job.require_id()?;
        let db = self.db()?;
        let n = if job.reserved_at == 0 {
            db.execute(
                "UPDATE jobs SET reserved_at = 0 WHERE id = ?1",
                params![id.get()],
            )?
        } else {
            db.execute(
                "UPDATE jobs SET reserved_at = 0 WHERE id = ?1 AND reserved_at = ?2",
                params![id.get(), job.reserved_at],
            )?
        };
        if n == 0 && job.reserved_at != 0 {
            warn!(job_id = %id, "reservation no longer held at unlock; left untouched");
            return Ok(false);
        }
        debug!(job_id = %id, "job unlocked");
        Ok(true)
    }

    /// Make `job` due on the next tick regardless of its interval.
    pub fn reset_background_job(&self, job: &Job) -> Result<()> {
        let id = job.require_id()?;
        self.db()?.execute(
            "UPDATE jobs SET last_run = 0 WHERE id = ?1",
            params![id.get()],
        )?;
        info!(job_id = %id, "job reset to run on next tick");
        Ok(())
    }

    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| JobError::LockPoisoned)
    }
}

/// Conditional update: take the reservation only if it still reads `observed`.
fn claim(conn: &Connection, id: JobId, observed: i64, now: i64) -> Result<Claim> {
    let n = conn.execute(
        "UPDATE jobs SET reserved_at = ?1 WHERE id = ?2 AND reserved_at = ?3",
        params![now, id.get(), observed],
    )?;
    Ok(match (n, observed) {
        (0, _) => Claim::Conflict,
        (_, 0) => Claim::Fresh,
        (_, reserved_at) => Claim::Reclaimed { reserved_at },
    })
}

/// Canonical JSON text and its sha256 hex digest.
///
/// `serde_json` keeps object keys sorted, so equal values always encode to
/// the same text.
fn encode_argument(argument: &Value) -> Result<(String, String)> {
    let text = serde_json::to_string(argument)?;
    let hash = hex::encode(Sha256::digest(text.as_bytes()));
    Ok((text, hash))
}

struct JobRow {
    id: i64,
    class: String,
    argument: String,
    policy: String,
    interval_secs: i64,
    time_sensitive: i64,
    last_run: i64,
    reserved_at: i64,
    execution_duration_ms: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            class: row.get(1)?,
            argument: row.get(2)?,
            policy: row.get(3)?,
            interval_secs: row.get(4)?,
            time_sensitive: row.get(5)?,
            last_run: row.get(6)?,
            reserved_at: row.get(7)?,
            execution_duration_ms: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let policy = JobPolicy::from_parts(&self.policy, self.interval_secs).ok_or_else(|| {
            JobError::CorruptRow {
                id: self.id,
                reason: format!("unknown policy {:?}", self.policy),
            }
        })?;
        let argument: Value = serde_json::from_str(&self.argument)?;
        let mut job = Job::new(
            self.class,
            argument,
            policy,
            TimeSensitivity::from_flag(self.time_sensitive),
        );
        job.assign_id(JobId(self.id))?;
        job.last_run = self.last_run;
        job.reserved_at = self.reserved_at;
        job.execution_duration_ms = self.execution_duration_ms;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobContext;
    use nightshift_core::ManualClock;
    use serde_json::json;

    const T0: i64 = 1_700_000_000;

    struct Fixture {
        class: &'static str,
        policy: JobPolicy,
        sensitivity: TimeSensitivity,
    }

    impl BackgroundJob for Fixture {
        fn class(&self) -> &str {
            self.class
        }
        fn policy(&self) -> JobPolicy {
            self.policy
        }
        fn time_sensitivity(&self) -> TimeSensitivity {
            self.sensitivity
        }
        fn run(&self, _argument: &Value, _ctx: &JobContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn regular(class: &'static str) -> Fixture {
        Fixture {
            class,
            policy: JobPolicy::Regular,
            sensitivity: TimeSensitivity::TimeSensitive,
        }
    }

    fn list_with(config: SchedulerConfig) -> (JobList, ManualClock) {
        let clock = ManualClock::new(T0);
        let conn = Connection::open_in_memory().unwrap();
        let list = JobList::new(conn, Arc::new(clock.clone()), &config).unwrap();
        (list, clock)
    }

    fn list() -> (JobList, ManualClock) {
        list_with(SchedulerConfig {
            stale_reservation_secs: 300,
            ..SchedulerConfig::default()
        })
    }

    fn set_last_run_to(list: &JobList, id: JobId, last_run: i64) {
        list.db()
            .unwrap()
            .execute(
                "UPDATE jobs SET last_run = ?1 WHERE id = ?2",
                params![last_run, id.get()],
            )
            .unwrap();
    }

    #[test]
    fn add_is_idempotent() {
        let (list, _) = list();
        let job = regular("sync");
        let first = list.add(&job, json!({"user": "alice"})).unwrap();
        let second = list.add(&job, json!({"user": "alice"})).unwrap();
        assert_eq!(first, second);
        assert!(list.has("sync", &json!({"user": "alice"})).unwrap());
        assert_eq!(list.list(Some("sync"), 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn re_adding_refreshes_policy_but_keeps_run_state() {
        let (list, clock) = list();
        let daily = Fixture {
            class: "cleanup",
            policy: JobPolicy::Timed { interval_secs: 86_400 },
            sensitivity: TimeSensitivity::TimeInsensitive,
        };
        let id = list.add(&daily, json!(null)).unwrap();
        set_last_run_to(&list, id, T0);
        assert!(list.get_next(false).unwrap().is_none());

        let minutely = Fixture {
            policy: JobPolicy::Timed { interval_secs: 60 },
            sensitivity: TimeSensitivity::TimeSensitive,
            ..daily
        };
        assert_eq!(list.add(&minutely, json!(null)).unwrap(), id);

        let stored = list.get_by_id(id).unwrap().unwrap();
        assert_eq!(stored.policy, JobPolicy::Timed { interval_secs: 60 });
        assert_eq!(stored.time_sensitivity, TimeSensitivity::TimeSensitive);
        assert_eq!(stored.last_run, T0);
        assert_eq!(list.list(Some("cleanup"), 10, 0).unwrap().len(), 1);

        clock.advance(61);
        assert_eq!(list.get_next(false).unwrap().unwrap().id(), Some(id));
    }

    #[test]
    fn huge_interval_is_never_due() {
        let (list, _) = list();
        let never = Fixture {
            class: "never",
            policy: JobPolicy::Timed { interval_secs: u64::MAX },
            sensitivity: TimeSensitivity::TimeSensitive,
        };
        let id = list.add(&never, json!(null)).unwrap();
        assert!(list.get_next(false).unwrap().is_none());
        let stored = list.get_by_id(id).unwrap().unwrap();
        assert_eq!(
            stored.policy,
            JobPolicy::Timed { interval_secs: i64::MAX as u64 }
        );
    }

    #[test]
    fn argument_equality_ignores_key_order() {
        let (list, _) = list();
        let job = regular("sync");
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        list.add(&job, a).unwrap();
        assert!(list.has("sync", &b).unwrap());
    }

    #[test]
    fn different_arguments_are_different_jobs() {
        let (list, _) = list();
        let job = regular("sync");
        list.add(&job, json!(1)).unwrap();
        list.add(&job, json!(2)).unwrap();
        assert_eq!(list.list(None, 10, 0).unwrap().len(), 2);
        assert!(!list.has("sync", &json!(3)).unwrap());
        assert!(!list.has("other", &json!(1)).unwrap());
    }

    #[test]
    fn remove_matching_pair_and_whole_class() {
        let (list, _) = list();
        let job = regular("sync");
        list.add(&job, json!(1)).unwrap();
        list.add(&job, json!(2)).unwrap();
        list.add(&regular("other"), json!(1)).unwrap();

        assert_eq!(list.remove("sync", Some(&json!(1))).unwrap(), 1);
        assert_eq!(list.remove("sync", Some(&json!(1))).unwrap(), 0);
        assert!(list.has("sync", &json!(2)).unwrap());

        assert_eq!(list.remove("sync", None).unwrap(), 1);
        assert!(list.has("other", &json!(1)).unwrap());
    }

    #[test]
    fn add_job_assigns_id_to_record() {
        let (list, _) = list();
        let mut job = regular("sync").to_job(json!(null));
        let id = list.add_job(&mut job).unwrap();
        assert_eq!(job.id(), Some(id));
        let stored = list.get_by_id(id).unwrap().unwrap();
        assert_eq!(stored.class, "sync");
        assert_eq!(stored.policy, JobPolicy::Regular);
    }

    #[test]
    fn get_next_reserves_exclusively() {
        let (list, _) = list();
        let id = list.add(&regular("sync"), json!(null)).unwrap();

        let job = list.get_next(false).unwrap().unwrap();
        assert_eq!(job.id(), Some(id));
        assert_eq!(job.reserved_at, T0);
        assert!(list.get_next(false).unwrap().is_none());
        assert!(list.has_reserved_jobs(Some("sync")).unwrap());
        assert!(!list.has_reserved_jobs(Some("other")).unwrap());
    }

    #[test]
    fn oldest_last_run_served_first() {
        let (list, _) = list();
        let j1 = list.add(&regular("a"), json!(null)).unwrap();
        let j2 = list.add(&regular("b"), json!(null)).unwrap();
        // j2 was inserted later but ran longer ago, so it goes first.
        set_last_run_to(&list, j1, T0 - 10);
        set_last_run_to(&list, j2, T0 - 50);

        let first = list.get_next(false).unwrap().unwrap();
        let second = list.get_next(false).unwrap().unwrap();
        assert_eq!(first.id(), Some(j2));
        assert_eq!(second.id(), Some(j1));
    }

    #[test]
    fn time_sensitive_jobs_preferred_by_default() {
        let (list, _) = list();
        let lazy = Fixture {
            class: "lazy",
            policy: JobPolicy::Regular,
            sensitivity: TimeSensitivity::TimeInsensitive,
        };
        let lazy_id = list.add(&lazy, json!(null)).unwrap();
        let urgent_id = list.add(&regular("urgent"), json!(null)).unwrap();
        set_last_run_to(&list, lazy_id, T0 - 1000);
        set_last_run_to(&list, urgent_id, T0 - 10);

        assert_eq!(list.get_next(false).unwrap().unwrap().id(), Some(urgent_id));
        assert_eq!(list.get_next(false).unwrap().unwrap().id(), Some(lazy_id));
    }

    #[test]
    fn oldest_wins_when_not_preferring_sensitivity() {
        let (list, _) = list_with(SchedulerConfig {
            prefer_time_sensitive: false,
            ..SchedulerConfig::default()
        });
        let lazy = Fixture {
            class: "lazy",
            policy: JobPolicy::Regular,
            sensitivity: TimeSensitivity::TimeInsensitive,
        };
        let lazy_id = list.add(&lazy, json!(null)).unwrap();
        let urgent_id = list.add(&regular("urgent"), json!(null)).unwrap();
        set_last_run_to(&list, lazy_id, T0 - 1000);
        set_last_run_to(&list, urgent_id, T0 - 10);

        assert_eq!(list.get_next(false).unwrap().unwrap().id(), Some(lazy_id));
    }

    #[test]
    fn only_time_sensitive_skips_insensitive_jobs() {
        let (list, _) = list();
        let lazy = Fixture {
            class: "lazy",
            policy: JobPolicy::Regular,
            sensitivity: TimeSensitivity::TimeInsensitive,
        };
        list.add(&lazy, json!(null)).unwrap();
        assert!(list.get_next(true).unwrap().is_none());
        assert!(list.get_next(false).unwrap().is_some());
    }

    #[test]
    fn timed_job_waits_for_interval() {
        let (list, _) = list();
        let hourly = Fixture {
            class: "hourly",
            policy: JobPolicy::Timed { interval_secs: 3600 },
            sensitivity: TimeSensitivity::TimeSensitive,
        };
        let id = list.add(&hourly, json!(null)).unwrap();

        set_last_run_to(&list, id, T0 - 1800);
        assert!(list.get_next(false).unwrap().is_none());

        set_last_run_to(&list, id, T0 - 3601);
        assert_eq!(list.get_next(false).unwrap().unwrap().id(), Some(id));
    }

    #[test]
    fn timed_job_with_future_last_run_is_not_due() {
        let (list, clock) = list();
        let hourly = Fixture {
            class: "hourly",
            policy: JobPolicy::Timed { interval_secs: 60 },
            sensitivity: TimeSensitivity::TimeSensitive,
        };
        let id = list.add(&hourly, json!(null)).unwrap();
        set_last_run_to(&list, id, T0);
        // Clock stepped backwards by an hour.
        clock.advance(-3600);
        assert!(list.get_next(false).unwrap().is_none());
    }

    #[test]
    fn stale_reservation_is_reclaimable_after_threshold() {
        let (list, clock) = list();
        let id = list.add(&regular("sync"), json!(null)).unwrap();
        let held = list.get_next(false).unwrap().unwrap();
        assert_eq!(held.reserved_at, T0);

        clock.set(T0 + 100);
        assert!(list.get_next(false).unwrap().is_none());

        clock.set(T0 + 301);
        let reclaimed = list.get_next(false).unwrap().unwrap();
        assert_eq!(reclaimed.id(), Some(id));
        assert_eq!(reclaimed.reserved_at, T0 + 301);

        // The original holder no longer owns the reservation.
        assert!(!list.unlock_job(&held).unwrap());
        assert!(list.has_reserved_jobs(None).unwrap());
        assert!(list.unlock_job(&reclaimed).unwrap());
        assert!(!list.has_reserved_jobs(None).unwrap());
    }

    #[test]
    fn unlock_makes_job_eligible_without_touching_last_run() {
        let (list, _) = list();
        let id = list.add(&regular("sync"), json!(null)).unwrap();
        set_last_run_to(&list, id, T0 - 42);

        let job = list.get_next(false).unwrap().unwrap();
        assert!(list.unlock_job(&job).unwrap());

        let again = list.get_next(false).unwrap().unwrap();
        assert_eq!(again.id(), Some(id));
        assert_eq!(again.last_run, T0 - 42);
    }

    #[test]
    fn reset_overrides_interval() {
        let (list, _) = list();
        let daily = Fixture {
            class: "daily",
            policy: JobPolicy::Timed { interval_secs: 86_400 },
            sensitivity: TimeSensitivity::TimeInsensitive,
        };
        let id = list.add(&daily, json!(null)).unwrap();
        set_last_run_to(&list, id, T0 - 10);
        assert!(list.get_next(false).unwrap().is_none());

        let job = list.get_by_id(id).unwrap().unwrap();
        list.reset_background_job(&job).unwrap();
        assert_eq!(list.get_next(false).unwrap().unwrap().id(), Some(id));
    }

    #[test]
    fn bookkeeping_is_persisted() {
        let (list, clock) = list();
        let id = list.add(&regular("sync"), json!({"k": "v"})).unwrap();
        let job = list.get_next(false).unwrap().unwrap();

        clock.advance(5);
        assert_eq!(list.set_last_run(&job).unwrap(), T0 + 5);
        list.set_execution_time(&job, Duration::from_millis(1500)).unwrap();
        list.set_last_job(&job).unwrap();

        let details = list.get_details_by_id(id).unwrap().unwrap();
        assert_eq!(details.last_run, T0 + 5);
        assert_eq!(details.execution_duration_ms, Some(1500));
        assert_eq!(details.reserved_at, T0);
        assert_eq!(details.argument, r#"{"k":"v"}"#);
        assert_eq!(details.policy, "regular");
        assert!(details.time_sensitive);
        assert_eq!(list.last_job().unwrap(), Some(id));
    }

    #[test]
    fn lookups_of_missing_ids_are_none() {
        let (list, _) = list();
        assert!(list.get_by_id(JobId(99)).unwrap().is_none());
        assert!(list.get_details_by_id(JobId(99)).unwrap().is_none());
        assert!(list.last_job().unwrap().is_none());
        assert!(!list.remove_by_id(JobId(99)).unwrap());
    }

    #[test]
    fn unsaved_job_is_rejected_by_bookkeeping() {
        let (list, _) = list();
        let job = regular("sync").to_job(json!(null));
        assert!(matches!(
            list.set_last_run(&job).unwrap_err(),
            JobError::Unsaved { .. }
        ));
    }

    #[test]
    fn list_pages_in_id_order() {
        let (list, _) = list();
        let job = regular("sync");
        let ids: Vec<JobId> = (0..5).map(|i| list.add(&job, json!(i)).unwrap()).collect();
        let page: Vec<_> = list
            .list(None, 2, 2)
            .unwrap()
            .iter()
            .map(|j| j.id().unwrap())
            .collect();
        assert_eq!(page, ids[2..4].to_vec());
    }
}
