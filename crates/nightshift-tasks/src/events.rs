use std::sync::{Arc, RwLock};
use std::time::Instant;

use tracing::{debug, error};

use crate::types::Task;

/// Outcome notification for a task that finished on the deferred path.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Successful { task: Task },
    Failed { task: Task, error: String },
}

impl TaskEvent {
    pub fn task(&self) -> &Task {
        match self {
            TaskEvent::Successful { task } | TaskEvent::Failed { task, .. } => task,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Successful { .. } => "task_successful",
            TaskEvent::Failed { .. } => "task_failed",
        }
    }
}

/// Something that wants to hear about finished tasks.
pub trait TaskListener: Send + Sync {
    fn on_event(&self, event: &TaskEvent) -> anyhow::Result<()>;
}

impl<F> TaskListener for F
where
    F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &TaskEvent) -> anyhow::Result<()> {
        self(event)
    }
}

struct Registration {
    name: String,
    priority: i32,
    listener: Arc<dyn TaskListener>,
}

/// Fan-out of [`TaskEvent`]s to registered listeners.
///
/// Listeners run synchronously in ascending priority order. A failing
/// listener is logged and does not stop the others.
#[derive(Default)]
pub struct TaskEventBus {
    listeners: RwLock<Vec<Registration>>,
}

impl TaskEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Lower priority runs first; equal priorities keep
    /// registration order.
    pub fn register(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn TaskListener>,
        priority: i32,
    ) {
        let name = name.into();
        if let Ok(mut listeners) = self.listeners.write() {
            debug!(listener = %name, priority, "task listener registered");
            listeners.push(Registration {
                name,
                priority,
                listener,
            });
            listeners.sort_by_key(|r| r.priority);
        }
    }

    /// Remove a listener by name. No-op when absent.
    pub fn unregister(&self, name: &str) {
        if let Ok(mut listeners) = self.listeners.write() {
            let before = listeners.len();
            listeners.retain(|r| r.name != name);
            if listeners.len() < before {
                debug!(listener = name, "task listener unregistered");
            }
        }
    }

    /// Deliver `event` to every listener. Returns how many accepted it.
    pub fn emit(&self, event: &TaskEvent) -> usize {
        let Ok(listeners) = self.listeners.read() else {
            return 0;
        };
        let mut delivered = 0;
        for registration in listeners.iter() {
            let t = Instant::now();
            match registration.listener.on_event(event) {
                Ok(()) => {
                    delivered += 1;
                    debug!(
                        listener = %registration.name,
                        event = event.name(),
                        duration_ms = t.elapsed().as_millis() as u64,
                        "task listener completed"
                    );
                }
                Err(e) => error!(
                    listener = %registration.name,
                    event = event.name(),
                    error = %e,
                    "task listener failed"
                ),
            }
        }
        delivered
    }
}
