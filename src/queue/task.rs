//! Task model and status lifecycle

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::utils::errors::RpaError;

/// What a task asks the worker to do
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Establish (or reuse) a portal session and stop there
    AuthenticateOnly,
    /// Establish a session, then run the extraction routine
    AuthenticateAndExtract,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AuthenticateOnly => "authenticate_only",
            TaskKind::AuthenticateAndExtract => "authenticate_and_extract",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = RpaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authenticate_only" => Ok(TaskKind::AuthenticateOnly),
            "authenticate_and_extract" => Ok(TaskKind::AuthenticateAndExtract),
            other => Err(RpaError::Serialization(format!("Unknown task kind: {}", other))),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for the worker
    Pending,
    /// Claimed by the worker
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Withdrawn before the worker claimed it
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Still outstanding from a scheduler's point of view
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// `Running -> Pending` only happens when auto-retry re-queues a failure.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RpaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(RpaError::Serialization(format!("Unknown task status: {}", other))),
        }
    }
}

/// One durable unit of scheduled work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Produced by the extraction step; opaque here
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Accumulated execution trace
    pub log: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub params: Map<String, Value>,
    /// Hidden from `list_pending` until this instant (auto-retry backoff)
    pub not_before: Option<DateTime<Utc>>,
}

impl Task {
    pub fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Lightweight listing row for observability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub has_error: bool,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind,
            status: task.status,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            retry_count: task.retry_count,
            has_error: task.error.is_some(),
        }
    }
}

/// Partial update of a task's mutable fields; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub log: Option<String>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the backoff marker
    pub not_before: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn not_before(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.log.is_none()
            && self.retry_count.is_none()
            && self.not_before.is_none()
    }
}

/// Append-only execution trace for one task run
///
/// Lines are mirrored to `tracing`. The buffer is shared so the worker still
/// owns the trace when a run is cut short by its deadline.
#[derive(Debug, Clone)]
pub struct TaskLog {
    task_id: String,
    lines: Arc<Mutex<Vec<String>>>,
}

impl TaskLog {
    /// Start a trace, carrying over any log from earlier attempts
    pub fn new(task_id: impl Into<String>, previous: &str) -> Self {
        let lines = previous
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            task_id: task_id.into(),
            lines: Arc::new(Mutex::new(lines)),
        }
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(task_id = %self.task_id, "{}", message);
        let stamp = chrono::Local::now().format("%H:%M:%S");
        self.lines.lock().push(format!("[{}] {}", stamp, message));
    }

    pub fn render(&self) -> String {
        self.lines.lock().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_allow_no_transition() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn running_cannot_be_cancelled() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn kind_and_status_round_trip_through_strings() {
        assert_eq!(
            "authenticate_and_extract".parse::<TaskKind>().unwrap(),
            TaskKind::AuthenticateAndExtract
        );
        assert_eq!("failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert!("exploded".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_log_keeps_previous_attempts() {
        let log = TaskLog::new("t-1", "[10:00:00] first attempt\n");
        log.push("second attempt");
        let rendered = log.render();
        assert!(rendered.starts_with("[10:00:00] first attempt\n["));
        assert!(rendered.ends_with("] second attempt"));
        assert_eq!(log.len(), 2);
    }
}
