//! `nightshift-core`: ids, clock and configuration shared by every
//! nightshift crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{NightshiftConfig, SchedulerConfig, TasksConfig};
pub use error::{CoreError, Result};
pub use types::{JobId, TaskId, UserId};
