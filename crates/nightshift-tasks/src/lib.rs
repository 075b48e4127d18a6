//! `nightshift-tasks`: task dispatch on top of the nightshift job list.
//!
//! A [`Task`] is handed to a [`TaskDispatcher`], which looks up the
//! [`TaskProvider`] for its task type in the lazy [`ProviderRegistry`]. If the
//! provider runs in-process and its expected runtime fits the caller's
//! budget, the task runs right away; otherwise it is stored as SCHEDULED and
//! a queued [`TaskProcessingJob`] picks it up on a later scheduler tick.
//! Providers served by an external worker pull their tasks with
//! [`TaskDispatcher::next_scheduled_task`].

pub mod background;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod provider;
pub mod registry;
pub mod shape;
pub mod store;
pub mod types;

pub use background::{
    task_argument, task_job, CleanupOldTasksJob, TaskProcessingJob, CLEANUP_OLD_TASKS_CLASS,
    TASK_PROCESSING_CLASS,
};
pub use dispatcher::TaskDispatcher;
pub use error::{ProcessingError, Result, TaskError};
pub use events::{TaskEvent, TaskEventBus, TaskListener};
pub use provider::{ProgressFn, ProviderCapabilities, TaskProvider};
pub use registry::{ProviderRegistry, TaskTypeInfo};
pub use shape::{Shape, ShapeDescriptor, ShapeKind};
pub use store::TaskStore;
pub use types::{FileRef, IoValue, Task, TaskIo, TaskStatus};
