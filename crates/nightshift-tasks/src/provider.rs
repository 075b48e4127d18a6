use std::time::Duration;

use nightshift_core::UserId;
use serde::Serialize;

use crate::error::ProcessingError;
use crate::shape::Shape;
use crate::types::TaskIo;

/// Progress reporter handed to a provider. Returns `false` once the task has
/// been cancelled; the provider should stop at its next opportunity.
pub type ProgressFn<'a> = dyn FnMut(f64) -> bool + 'a;

/// What a provider advertises about how it can be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProviderCapabilities {
    /// Can be invoked in-process through [`TaskProvider::process`].
    pub synchronous: bool,
    /// Typical wall-clock cost of one task, if the provider knows it.
    pub expected_runtime: Option<Duration>,
}

impl ProviderCapabilities {
    pub fn synchronous(expected_runtime: Duration) -> Self {
        Self {
            synchronous: true,
            expected_runtime: Some(expected_runtime),
        }
    }

    /// Served by an external worker that pulls tasks from the store.
    pub fn external() -> Self {
        Self::default()
    }

    /// Whether an inline run is expected to finish within `budget`.
    pub fn fits(&self, budget: Duration) -> bool {
        self.synchronous && self.expected_runtime.is_some_and(|r| r <= budget)
    }
}

/// Handler for one task type.
pub trait TaskProvider: Send + Sync {
    /// Stable identifier, for logs and listings.
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn task_type_id(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    fn input_shape(&self) -> Shape;

    fn optional_input_shape(&self) -> Shape {
        Shape::new()
    }

    fn output_shape(&self) -> Shape;

    fn optional_output_shape(&self) -> Shape {
        Shape::new()
    }

    /// Run one task in-process. Only called when
    /// `capabilities().synchronous` is set.
    fn process(
        &self,
        _user_id: Option<&UserId>,
        _input: &TaskIo,
        _report_progress: &mut ProgressFn<'_>,
    ) -> Result<TaskIo, ProcessingError> {
        Err(ProcessingError::NotSynchronous)
    }
}
