use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use nightshift_core::JobId;
use serde_json::Value;
use tracing::debug;

use crate::list::JobList;
use crate::types::{Job, JobPolicy, TimeSensitivity};

/// What a handler sees while it runs.
pub struct JobContext<'a> {
    pub job_id: JobId,
    /// The list that owns the job, for handlers that enqueue follow-up work.
    pub job_list: &'a JobList,
    /// Unix seconds at which the run started.
    pub started_at: i64,
}

/// A kind of background work, registered once per process under its class.
///
/// The class string is what gets persisted; the policy and sensitivity are
/// captured into the job row when the job is added.
pub trait BackgroundJob: Send + Sync {
    fn class(&self) -> &str;

    fn policy(&self) -> JobPolicy;

    fn time_sensitivity(&self) -> TimeSensitivity {
        TimeSensitivity::TimeSensitive
    }

    fn run(&self, argument: &Value, ctx: &JobContext<'_>) -> anyhow::Result<()>;

    /// Build the unsaved job record for `argument`.
    fn to_job(&self, argument: Value) -> Job {
        Job::new(
            self.class(),
            argument,
            self.policy(),
            self.time_sensitivity(),
        )
    }
}

/// Class name → handler lookup used by the executor.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn BackgroundJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration for the same class replaces
    /// the earlier one.
    pub fn register(&self, handler: Arc<dyn BackgroundJob>) {
        let class = handler.class().to_string();
        if let Ok(mut handlers) = self.handlers.write() {
            if handlers.insert(class.clone(), handler).is_some() {
                debug!(%class, "job handler replaced");
            } else {
                debug!(%class, "job handler registered");
            }
        }
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn BackgroundJob>> {
        self.handlers.read().ok()?.get(class).cloned()
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        classes.sort();
        classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl BackgroundJob for Noop {
        fn class(&self) -> &str {
            self.0
        }
        fn policy(&self) -> JobPolicy {
            JobPolicy::Queued
        }
        fn run(&self, _argument: &Value, _ctx: &JobContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_class() {
        let registry = JobRegistry::new();
        registry.register(Arc::new(Noop("b")));
        registry.register(Arc::new(Noop("a")));
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.classes(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn to_job_captures_policy_and_sensitivity() {
        let job = Noop("mail").to_job(serde_json::json!({"to": "x"}));
        assert_eq!(job.class, "mail");
        assert_eq!(job.policy, JobPolicy::Queued);
        assert_eq!(job.time_sensitivity, TimeSensitivity::TimeSensitive);
        assert!(job.id().is_none());
    }
}
