use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
/// A reservation older than this is considered abandoned by a dead worker.
pub const DEFAULT_STALE_RESERVATION_SECS: u64 = 12 * 60 * 60;
/// Stop picking up new jobs once a tick has run this long (14 minutes).
pub const DEFAULT_MAX_TICK_SECS: u64 = 14 * 60;
pub const DEFAULT_SYNC_BUDGET_SECS: u64 = 5;
pub const DEFAULT_CLEANUP_MAX_AGE_DAYS: u64 = 180;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Top-level config (nightshift.toml + NIGHTSHIFT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NightshiftConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Job list and tick loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduling ticks of the worker loop.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Age after which another worker may reclaim a reservation.
    #[serde(default = "default_stale_reservation")]
    pub stale_reservation_secs: u64,
    /// Upper bound on how long one tick keeps selecting jobs.
    #[serde(default = "default_max_tick")]
    pub max_tick_secs: u64,
    /// Restrict every tick to time-sensitive jobs.
    #[serde(default)]
    pub only_time_sensitive: bool,
    /// When both pools have due jobs, serve time-sensitive ones first.
    /// With `false` the oldest `last_run` wins regardless of sensitivity and
    /// sensitivity only breaks ties.
    #[serde(default = "bool_true")]
    pub prefer_time_sensitive: bool,
}

impl SchedulerConfig {
    pub fn stale_reservation(&self) -> Duration {
        Duration::from_secs(self.stale_reservation_secs)
    }

    pub fn max_tick(&self) -> Duration {
        Duration::from_secs(self.max_tick_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            stale_reservation_secs: DEFAULT_STALE_RESERVATION_SECS,
            max_tick_secs: DEFAULT_MAX_TICK_SECS,
            only_time_sensitive: false,
            prefer_time_sensitive: true,
        }
    }
}

/// Task dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// How long a caller is willing to block on an inline task.
    #[serde(default = "default_sync_budget")]
    pub sync_budget_secs: u64,
    /// Finished tasks older than this are deleted by the cleanup job.
    #[serde(default = "default_cleanup_max_age")]
    pub cleanup_max_age_days: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl TasksConfig {
    pub fn sync_budget(&self) -> Duration {
        Duration::from_secs(self.sync_budget_secs)
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_age_days.saturating_mul(24 * 60 * 60))
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            sync_budget_secs: DEFAULT_SYNC_BUDGET_SECS,
            cleanup_max_age_days: DEFAULT_CLEANUP_MAX_AGE_DAYS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_stale_reservation() -> u64 {
    DEFAULT_STALE_RESERVATION_SECS
}
fn default_max_tick() -> u64 {
    DEFAULT_MAX_TICK_SECS
}
fn default_sync_budget() -> u64 {
    DEFAULT_SYNC_BUDGET_SECS
}
fn default_cleanup_max_age() -> u64 {
    DEFAULT_CLEANUP_MAX_AGE_DAYS
}
fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.nightshift/nightshift.db", home)
}

impl NightshiftConfig {
    /// Load config from a TOML file with NIGHTSHIFT_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `NIGHTSHIFT_SCHEDULER__STALE_RESERVATION_SECS=300`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("NIGHTSHIFT_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.nightshift/nightshift.toml", home)
}
