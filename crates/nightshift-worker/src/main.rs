use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use nightshift_core::{system_clock, JobId, NightshiftConfig, TaskId};
use nightshift_jobs::{db, JobList, JobRegistry, Scheduler};
use nightshift_tasks::{
    CleanupOldTasksJob, ProviderRegistry, TaskDispatcher, TaskEvent, TaskEventBus,
    TaskProcessingJob, TaskStore,
};
use serde_json::Value;
use tracing::{info, warn};

mod cli;

use cli::{Cli, Command, JobsCommand, TasksCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "nightshift_worker=info,nightshift_jobs=info,nightshift_tasks=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > NIGHTSHIFT_CONFIG env > ~/.nightshift/nightshift.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("NIGHTSHIFT_CONFIG").ok());
    let mut config = NightshiftConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        NightshiftConfig::default()
    });

    match cli.command {
        Command::Run {
            once,
            only_time_sensitive,
        } => {
            config.scheduler.only_time_sensitive |= only_time_sensitive;
            let worker = Worker::open(&config)?;
            if !worker.dispatcher.has_providers() {
                warn!("no task providers linked in; deferred tasks picked up here will fail");
            }
            worker.install_builtin_jobs(&config)?;
            if once {
                let report = worker
                    .scheduler
                    .tick(config.scheduler.only_time_sensitive)?;
                println!("{}", serde_json::to_string_pretty(&tick_summary(&report))?);
            } else {
                run_until_ctrl_c(worker.scheduler).await?;
            }
        }
        Command::Jobs { command } => jobs_command(&Worker::open(&config)?, command)?,
        Command::Tasks { command } => tasks_command(&Worker::open(&config)?, command)?,
    }
    Ok(())
}

/// Everything a worker process needs, wired over one SQLite file.
struct Worker {
    scheduler: Scheduler,
    dispatcher: TaskDispatcher,
    store: TaskStore,
}

impl Worker {
    fn open(config: &NightshiftConfig) -> anyhow::Result<Self> {
        let db_path = &config.database.path;
        ensure_parent_dir(db_path);
        info!(path = %db_path, "opening SQLite database");

        // each component gets its own connection; WAL lets them share the file
        let clock = system_clock();
        let job_list = JobList::new(db::open(db_path)?, clock.clone(), &config.scheduler)?;
        let store = TaskStore::new(db::open(db_path)?, clock)?;

        // Providers are registered by embedding applications; a bare worker
        // only drives deferred tasks of providers linked into it.
        let providers = Arc::new(ProviderRegistry::new());

        let events = Arc::new(TaskEventBus::new());
        events.register(
            "log",
            Arc::new(|event: &TaskEvent| -> anyhow::Result<()> {
                let task = event.task();
                info!(
                    event = event.name(),
                    task_id = ?task.id(),
                    task_type = %task.task_type_id,
                    "task finished"
                );
                Ok(())
            }),
            i32::MAX,
        );

        let dispatcher = TaskDispatcher::new(
            store.clone(),
            providers,
            job_list.clone(),
            events,
            &config.tasks,
        );

        let registry = Arc::new(JobRegistry::new());
        registry.register(Arc::new(TaskProcessingJob::new(dispatcher.clone())));
        registry.register(Arc::new(CleanupOldTasksJob::new(store.clone(), &config.tasks)));

        Ok(Self {
            scheduler: Scheduler::new(job_list, registry, config.scheduler.clone()),
            dispatcher,
            store,
        })
    }

    /// Make sure the recurring built-in jobs are on the list. Adding is
    /// idempotent and refreshes the stored policy, so this runs on every
    /// start and picks up a changed cleanup interval.
    fn install_builtin_jobs(&self, config: &NightshiftConfig) -> anyhow::Result<()> {
        let cleanup = CleanupOldTasksJob::new(self.store.clone(), &config.tasks);
        let id = self.scheduler.job_list().add(&cleanup, Value::Null)?;
        info!(job_id = %id, "cleanup job installed");
        Ok(())
    }
}

async fn run_until_ctrl_c(scheduler: Scheduler) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl+C")?;
    info!("Ctrl+C received; stopping after the current tick");

    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}

fn jobs_command(worker: &Worker, command: JobsCommand) -> anyhow::Result<()> {
    let job_list = worker.scheduler.job_list();
    match command {
        JobsCommand::List { class, limit } => {
            let now = job_list.clock().now();
            for job in job_list.list(class.as_deref(), limit, 0)? {
                let id = job
                    .id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                let state = if job.is_reserved() {
                    "reserved"
                } else if job.policy.is_due(job.last_run, now) {
                    "due"
                } else {
                    "waiting"
                };
                println!(
                    "{id}\t{}\t{}\t{}\t{state}",
                    job.class,
                    job.policy.kind(),
                    job.last_run,
                );
            }
        }
        JobsCommand::Show { id } => {
            let Some(details) = job_list.get_details_by_id(JobId(id))? else {
                bail!("job {id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        JobsCommand::Reset { id } => {
            let job = find_job(job_list, id)?;
            job_list.reset_background_job(&job)?;
            println!("job {id} will run on the next tick");
        }
        JobsCommand::Remove { id } => {
            if !job_list.remove_by_id(JobId(id))? {
                bail!("job {id} not found");
            }
            println!("job {id} removed");
        }
        JobsCommand::Unlock { id } => {
            let job = find_job(job_list, id)?;
            if job.is_reserved() && job_list.unlock_job(&job)? {
                println!("job {id} unlocked");
            } else {
                println!("job {id} was not reserved");
            }
        }
    }
    Ok(())
}

fn tasks_command(worker: &Worker, command: TasksCommand) -> anyhow::Result<()> {
    match command {
        TasksCommand::Show { id } => {
            let task = worker.dispatcher.get_task(TaskId(id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TasksCommand::Cancel { id } => {
            worker.dispatcher.cancel_task(TaskId(id))?;
            println!("task {id} cancelled");
        }
    }
    Ok(())
}

fn find_job(job_list: &JobList, id: i64) -> anyhow::Result<nightshift_jobs::Job> {
    job_list
        .get_by_id(JobId(id))?
        .with_context(|| format!("job {id} not found"))
}

fn tick_summary(report: &nightshift_jobs::TickReport) -> Value {
    serde_json::json!({
        "succeeded": report.succeeded,
        "failed": report.failed,
        "aborted": report.aborted,
        "removed": report.removed,
        "errored": report.errored,
    })
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
