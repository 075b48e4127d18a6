//! `nightshift-jobs`: durable background job list with exclusive
//! reservations, backed by SQLite.
//!
//! # Overview
//!
//! Jobs are rows in a `jobs` table keyed by an autoincrement id. A scheduling
//! tick asks [`JobList::get_next`] for one due job, which is reserved with a
//! conditional update so concurrent ticks (threads or processes) never get the
//! same job. [`execute_job`] runs it through its registered
//! [`BackgroundJob`] handler and applies the job's policy. [`Scheduler`] loops
//! over both on a Tokio interval.
//!
//! # Policies
//!
//! | Policy   | Due when                          | After a completed run |
//! |----------|-----------------------------------|-----------------------|
//! | `Regular`| every tick                        | back to pending       |
//! | `Queued` | once                              | removed               |
//! | `Timed`  | `now - last_run >= interval_secs` | back to pending       |
//!
//! A reservation older than `stale_reservation_secs` is treated as abandoned
//! and can be taken over by another tick.

pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod list;
pub mod policy;
pub mod registry;
pub mod types;

pub use engine::{Scheduler, TickReport};
pub use error::{JobError, Result};
pub use executor::{execute_job, JobOutcome};
pub use list::JobList;
pub use policy::Disposition;
pub use registry::{BackgroundJob, JobContext, JobRegistry};
pub use types::{Job, JobDetails, JobPolicy, TimeSensitivity};
