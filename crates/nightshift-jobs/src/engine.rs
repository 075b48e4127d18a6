use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use nightshift_core::SchedulerConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::{execute_job, JobOutcome};
use crate::list::JobList;
use crate::registry::JobRegistry;

/// Counters for one scheduling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub removed: usize,
    /// Jobs whose bookkeeping hit a storage error; the tick moved on.
    pub errored: usize,
}

impl TickReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.aborted + self.removed + self.errored
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Aborted => self.aborted += 1,
            JobOutcome::Removed => self.removed += 1,
        }
    }
}

/// Drives the job list: each tick keeps reserving and running due jobs until
/// none are left or the tick's time allowance is spent.
#[derive(Clone)]
pub struct Scheduler {
    job_list: JobList,
    registry: Arc<JobRegistry>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(job_list: JobList, registry: Arc<JobRegistry>, config: SchedulerConfig) -> Self {
        Self {
            job_list,
            registry,
            config,
        }
    }

    pub fn job_list(&self) -> &JobList {
        &self.job_list
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Run one scheduling tick.
    ///
    /// A job seen twice in the same tick ends it, so a regular job that is
    /// the only due one does not spin. Failures of single jobs are counted
    /// and never abort the tick; an error from `get_next` itself does.
    pub fn tick(&self, only_time_sensitive: bool) -> Result<TickReport> {
        let started = Instant::now();
        let max_tick = self.config.max_tick();
        let mut seen = HashSet::new();
        let mut report = TickReport::default();

        while started.elapsed() < max_tick {
            let Some(job) = self.job_list.get_next(only_time_sensitive)? else {
                break;
            };
            let id = job.require_id()?;

            if !seen.insert(id) {
                debug!(job_id = %id, "job came round again; ending tick");
                self.job_list.unlock_job(&job)?;
                break;
            }

            if let Err(e) = self.job_list.set_last_job(&job) {
                warn!(job_id = %id, "could not record last job: {e}");
            }

            match execute_job(&self.job_list, &self.registry, &job) {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(job_id = %id, class = %job.class, "job bookkeeping failed: {e}");
                    report.errored += 1;
                    if let Err(e) = self.job_list.unlock_job(&job) {
                        error!(job_id = %id, "unlock after failure also failed: {e}");
                    }
                }
            }
        }

        if report.total() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                aborted = report.aborted,
                removed = report.removed,
                errored = report.errored,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tick complete"
            );
        }
        Ok(report)
    }

    /// Main loop. Ticks every `tick_interval_secs` until `shutdown` broadcasts `true`.
    ///
    /// Each tick runs on the blocking pool and is awaited to completion, so
    /// shutdown takes effect between ticks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.tick_interval().as_secs(),
            only_time_sensitive = self.config.only_time_sensitive,
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Jobs do blocking SQLite and provider work; keep it off the runtime.
                    let scheduler = self.clone();
                    let only_time_sensitive = self.config.only_time_sensitive;
                    let tick = tokio::task::spawn_blocking(move || scheduler.tick(only_time_sensitive));
                    match tick.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("scheduler tick error: {e}"),
                        Err(e) => error!("scheduler tick task failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackgroundJob, JobContext};
    use crate::types::{JobPolicy, TimeSensitivity};
    use nightshift_core::ManualClock;
    use rusqlite::Connection;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    struct Counting {
        class: &'static str,
        policy: JobPolicy,
        sensitivity: TimeSensitivity,
        fail: bool,
        runs: AtomicUsize,
    }

    impl Counting {
        fn new(class: &'static str, policy: JobPolicy) -> Arc<Self> {
            Arc::new(Self {
                class,
                policy,
                sensitivity: TimeSensitivity::TimeSensitive,
                fail: false,
                runs: AtomicUsize::new(0),
            })
        }

        fn failing(class: &'static str) -> Arc<Self> {
            Arc::new(Self {
                class,
                policy: JobPolicy::Regular,
                sensitivity: TimeSensitivity::TimeSensitive,
                fail: true,
                runs: AtomicUsize::new(0),
            })
        }

        fn insensitive(class: &'static str) -> Arc<Self> {
            Arc::new(Self {
                class,
                policy: JobPolicy::Queued,
                sensitivity: TimeSensitivity::TimeInsensitive,
                fail: false,
                runs: AtomicUsize::new(0),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl BackgroundJob for Counting {
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
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("always fails");
            }
            Ok(())
        }
    }

    fn scheduler(config: SchedulerConfig) -> (Scheduler, ManualClock) {
        let clock = ManualClock::new(1_700_000_000);
        let list = JobList::new(
            Connection::open_in_memory().unwrap(),
            Arc::new(clock.clone()),
            &config,
        )
        .unwrap();
        (Scheduler::new(list, Arc::new(JobRegistry::new()), config), clock)
    }

    fn register(scheduler: &Scheduler, handler: &Arc<Counting>, argument: Value) {
        scheduler.registry().register(handler.clone());
        scheduler.job_list().add(handler.as_ref(), argument).unwrap();
    }

    #[test]
    fn tick_runs_every_due_job_once() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let regular = Counting::new("regular", JobPolicy::Regular);
        let queued = Counting::new("queued", JobPolicy::Queued);
        register(&scheduler, &regular, json!(null));
        register(&scheduler, &queued, json!(1));
        register(&scheduler, &queued, json!(2));

        let report = scheduler.tick(false).unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(regular.runs(), 1);
        assert_eq!(queued.runs(), 2);
        assert!(!scheduler.job_list().has("queued", &json!(1)).unwrap());
        assert!(scheduler.job_list().has("regular", &json!(null)).unwrap());
        assert!(!scheduler.job_list().has_reserved_jobs(None).unwrap());
    }

    #[test]
    fn failing_job_does_not_stop_the_tick() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let bad = Counting::failing("bad");
        let good = Counting::new("good", JobPolicy::Queued);
        register(&scheduler, &bad, json!(null));
        register(&scheduler, &good, json!(null));

        let report = scheduler.tick(false).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(good.runs(), 1);
    }

    #[test]
    fn last_job_tracks_selection() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let queued = Counting::new("queued", JobPolicy::Queued);
        register(&scheduler, &queued, json!(null));
        let id = scheduler
            .job_list()
            .list(None, 1, 0)
            .unwrap()
            .remove(0)
            .id()
            .unwrap();

        scheduler.tick(false).unwrap();
        assert_eq!(scheduler.job_list().last_job().unwrap(), Some(id));
    }

    #[test]
    fn only_time_sensitive_tick_leaves_insensitive_jobs() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let lazy = Counting::insensitive("lazy");
        register(&scheduler, &lazy, json!(null));

        assert_eq!(scheduler.tick(true).unwrap().total(), 0);
        assert_eq!(lazy.runs(), 0);
        assert_eq!(scheduler.tick(false).unwrap().succeeded, 1);
    }

    #[test]
    fn zero_allowance_tick_selects_nothing() {
        let (scheduler, _) = scheduler(SchedulerConfig {
            max_tick_secs: 0,
            ..SchedulerConfig::default()
        });
        let queued = Counting::new("queued", JobPolicy::Queued);
        register(&scheduler, &queued, json!(null));

        assert_eq!(scheduler.tick(false).unwrap().total(), 0);
        assert_eq!(queued.runs(), 0);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (scheduler, _) = scheduler(SchedulerConfig {
            tick_interval_secs: 1,
            ..SchedulerConfig::default()
        });
        let queued = Counting::new("queued", JobPolicy::Queued);
        register(&scheduler, &queued, json!(null));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        // The first interval tick fires immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert_eq!(queued.runs(), 1);
    }

    struct Gate {
        started: AtomicBool,
        released: AtomicBool,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl BackgroundJob for Gate {
        fn class(&self) -> &str {
            "gate"
        }
        fn policy(&self) -> JobPolicy {
            JobPolicy::Queued
        }
        fn run(&self, _argument: &Value, _ctx: &JobContext<'_>) -> anyhow::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            let released = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(2))
                .is_ok();
            self.released.store(released, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn blocking_job_leaves_runtime_responsive() {
        let (scheduler, _) = scheduler(SchedulerConfig {
            tick_interval_secs: 1,
            ..SchedulerConfig::default()
        });
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Gate {
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            release: Mutex::new(release_rx),
        });
        scheduler.registry().register(gate.clone());
        scheduler.job_list().add(gate.as_ref(), json!(null)).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        while !gate.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Only reachable while the job is still blocked if the tick left
        // this (single-threaded) runtime free.
        release_tx.send(()).unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert!(gate.released.load(Ordering::SeqCst));
    }
}
