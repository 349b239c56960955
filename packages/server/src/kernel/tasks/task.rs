//! Task model for pipeline stage execution.
//!
//! One row per (session, item, stage) unit of work. Tasks are one-shot:
//! retries reset the same row back to `pending` with a bumped attempt.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::common::{SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    /// Permanent failure (no retries were applicable).
    Failed,
    /// Retries exhausted.
    DeadLetter,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "task_error_kind", rename_all = "snake_case")]
pub enum TaskErrorKind {
    Transient,
    RateLimited,
    Permanent,
    Cancelled,
}

impl TaskErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, TaskErrorKind::Transient | TaskErrorKind::RateLimited)
    }
}

/// Failure reported by a stage executor to the worker runtime.
#[derive(Debug, Clone)]
pub enum TaskFailure {
    /// Transient or rate-limited; the runtime retries with backoff.
    Retryable {
        kind: TaskErrorKind,
        message: String,
    },
    /// Not worth retrying; the task fails now.
    Permanent { message: String },
    /// Session cancelled; the task short-circuits without error bookkeeping.
    Cancelled,
    /// Upstream output not ready yet. Rescheduled without consuming the
    /// attempt budget.
    Deferred {
        retry_after: std::time::Duration,
        message: String,
    },
}

impl TaskFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        TaskFailure::Retryable {
            kind: TaskErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        TaskFailure::Retryable {
            kind: TaskErrorKind::RateLimited,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TaskFailure::Permanent {
            message: message.into(),
        }
    }

    pub fn deferred(retry_after: std::time::Duration, message: impl Into<String>) -> Self {
        TaskFailure::Deferred {
            retry_after,
            message: message.into(),
        }
    }
}

#[derive(FromRow, Debug, Clone, TypedBuilder)]
pub struct Task {
    #[builder(default = TaskId::new())]
    pub id: TaskId,

    pub session_id: SessionId,

    /// None for session-scoped stages (extract, categorize).
    #[builder(default, setter(strip_option))]
    pub item_index: Option<i32>,

    #[builder(setter(into))]
    pub queue: String,

    #[builder(default)]
    pub status: TaskStatus,

    #[builder(default = 1)]
    pub attempt: i32,

    #[builder(default = 3)]
    pub max_attempts: i32,

    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub worker_id: Option<String>,

    #[builder(default)]
    pub error_message: Option<String>,

    #[builder(default)]
    pub error_kind: Option<TaskErrorKind>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create an immediate task for a session-scoped stage.
    pub fn for_session(session_id: SessionId, queue: &str) -> Self {
        Self::builder().session_id(session_id).queue(queue).build()
    }

    /// Create a task targeting one item.
    pub fn for_item(session_id: SessionId, item_index: i32, queue: &str) -> Self {
        Self::builder()
            .session_id(session_id)
            .item_index(item_index)
            .queue(queue)
            .build()
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_retry_policy() {
        assert!(TaskErrorKind::Transient.should_retry());
        assert!(TaskErrorKind::RateLimited.should_retry());
        assert!(!TaskErrorKind::Permanent.should_retry());
        assert!(!TaskErrorKind::Cancelled.should_retry());
    }

    #[test]
    fn builder_defaults() {
        let task = Task::for_item(SessionId::new(), 3, "translate");
        assert_eq!(task.queue, "translate");
        assert_eq!(task.attempt, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.item_index, Some(3));
        assert!(task.run_at.is_none());
    }
}
