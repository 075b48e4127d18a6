use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nightshift-worker")]
#[command(about = "Runs nightshift background jobs and deferred tasks, and inspects their state.")]
pub(crate) struct Cli {
    /// Config file (default: $NIGHTSHIFT_CONFIG, then ~/.nightshift/nightshift.toml)
    #[arg(long, global = true)]
    pub(crate) config: Option<String>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Tick the scheduler every `scheduler.tick_interval_secs` until Ctrl+C.
    ///
    /// This binary links no task providers. Every deferred task it picks up
    /// is failed with "no provider registered", so do not point it at a
    /// database whose tasks are meant for an application's own worker.
    Run {
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,

        /// Only run time-sensitive jobs.
        #[arg(long)]
        only_time_sensitive: bool,
    },
    /// Inspect and manage the job list.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Inspect and manage tasks.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsCommand {
    /// List jobs in id order.
    List {
        #[arg(long)]
        class: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print the stored record of one job as JSON.
    Show { id: i64 },
    /// Make a job due on the next tick.
    Reset { id: i64 },
    Remove { id: i64 },
    /// Release a job's reservation.
    Unlock { id: i64 },
}

#[derive(Subcommand)]
pub(crate) enum TasksCommand {
    /// Print a task as JSON.
    Show { id: i64 },
    Cancel { id: i64 },
}
