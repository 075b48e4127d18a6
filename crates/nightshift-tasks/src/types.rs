use std::collections::BTreeMap;

use nightshift_core::{TaskId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskError};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a provider.
    Scheduled,
    /// A provider is working on it.
    Running,
    Successful,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are final: nothing moves a task out of them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Successful | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Successful => "successful",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "running" => Ok(TaskStatus::Running),
            "successful" => Ok(TaskStatus::Successful),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Reference to a file held by the surrounding platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: i64,
}

/// One value in a task's input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IoValue {
    Number(f64),
    Text(String),
    File(FileRef),
    List(Vec<IoValue>),
}

impl From<&str> for IoValue {
    fn from(s: &str) -> Self {
        IoValue::Text(s.to_string())
    }
}

impl From<String> for IoValue {
    fn from(s: String) -> Self {
        IoValue::Text(s)
    }
}

impl From<f64> for IoValue {
    fn from(n: f64) -> Self {
        IoValue::Number(n)
    }
}

/// Named task parameters.
pub type TaskIo = BTreeMap<String, IoValue>;

/// A unit of work for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: Option<TaskId>,
    pub task_type_id: String,
    pub input: TaskIo,
    pub status: TaskStatus,
    pub output: Option<TaskIo>,
    /// Owner; `None` for system or anonymous tasks.
    pub user_id: Option<UserId>,
    /// Application that submitted the task.
    pub app_id: String,
    /// Caller-chosen identifier for finding the task again.
    pub custom_id: Option<String>,
    /// 0.0 to 1.0.
    pub progress: f64,
    pub error_message: Option<String>,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub last_updated: i64,
}

impl Task {
    pub fn new(
        task_type_id: impl Into<String>,
        input: TaskIo,
        app_id: impl Into<String>,
        user_id: Option<UserId>,
    ) -> Self {
        Self {
            id: None,
            task_type_id: task_type_id.into(),
            input,
            status: TaskStatus::Scheduled,
            output: None,
            user_id,
            app_id: app_id.into(),
            custom_id: None,
            progress: 0.0,
            error_message: None,
            scheduled_at: 0,
            started_at: None,
            ended_at: None,
            last_updated: 0,
        }
    }

    pub fn with_custom_id(mut self, custom_id: impl Into<String>) -> Self {
        self.custom_id = Some(custom_id.into());
        self
    }

    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// Set the id once. Re-assigning the same value is a no-op.
    pub fn assign_id(&mut self, id: TaskId) -> Result<()> {
        match self.id {
            None => {
                self.id = Some(id);
                Ok(())
            }
            Some(current) if current == id => Ok(()),
            Some(current) => Err(TaskError::IllegalIdentityChange {
                current,
                attempted: id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Scheduled,
            TaskStatus::Running,
            TaskStatus::Successful,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Scheduled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Successful.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn io_values_decode_untagged() {
        let io: TaskIo = serde_json::from_str(
            r#"{"n": 2, "t": "hi", "f": {"file_id": 9}, "l": ["a", "b"]}"#,
        )
        .unwrap();
        assert_eq!(io["n"], IoValue::Number(2.0));
        assert_eq!(io["t"], IoValue::from("hi"));
        assert_eq!(io["f"], IoValue::File(FileRef { file_id: 9 }));
        assert_eq!(io["l"], IoValue::List(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn task_id_is_immutable() {
        let mut task = Task::new("core:text2text", TaskIo::new(), "notes", None);
        task.assign_id(TaskId(1)).unwrap();
        assert!(matches!(
            task.assign_id(TaskId(2)),
            Err(TaskError::IllegalIdentityChange { .. })
        ));
    }
}
