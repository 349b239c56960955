//! PostgreSQL-backed task queue.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never hand
//! out the same task twice, and reclaims tasks whose lease expired
//! (visibility timeout after a worker crash).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::task::{Task, TaskErrorKind, TaskStatus};
use crate::common::{SessionId, TaskId};

/// Outcome of `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task went back to `pending` for another attempt.
    Retrying { attempt: i32 },
    /// No retries left (or the error was permanent); the stage must be
    /// marked failed by the queue's exhaustion hook.
    Exhausted,
}

/// Trait for task queue operations.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a batch of tasks. Callers chunk fan-out themselves; a batch
    /// is one scheduling unit.
    async fn enqueue(&self, tasks: Vec<Task>) -> Result<()>;

    /// Claim up to `limit` ready tasks from one queue.
    async fn claim(&self, queue: &str, worker_id: &str, limit: i64) -> Result<Vec<Task>>;

    async fn mark_succeeded(&self, id: TaskId) -> Result<()>;

    /// Record a failure. Retryable kinds with budget left go back to
    /// `pending` at `retry_at`; everything else is terminal.
    async fn mark_failed(
        &self,
        id: TaskId,
        error: &str,
        kind: TaskErrorKind,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<FailureOutcome>;

    /// Reschedule without consuming the attempt budget (dependency not
    /// ready, rate-limit grace).
    async fn defer(&self, id: TaskId, run_at: DateTime<Utc>) -> Result<()>;

    async fn mark_cancelled(&self, id: TaskId) -> Result<()>;

    /// Pull scheduled tasks forward to now (e.g. image tasks waiting on
    /// translate). Returns the number of promoted tasks.
    async fn promote(&self, session_id: SessionId, queue: &str) -> Result<u64>;

    /// Cancel every pending task of a session. Running tasks finish through
    /// cooperative cancellation.
    async fn cancel_pending(&self, session_id: SessionId) -> Result<u64>;
}

/// PostgreSQL-backed task queue implementation.
pub struct PgTaskQueue {
    pool: PgPool,
    lease_ms: i64,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool, lease_ms: i64) -> Self {
        Self { pool, lease_ms }
    }
}

const TASK_COLUMNS: &str = "id, session_id, item_index, queue, status, attempt, max_attempts, \
     run_at, lease_expires_at, worker_id, error_message, error_kind, created_at, updated_at";

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, tasks: Vec<Task>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (id, session_id, item_index, queue, status, attempt,
                                   max_attempts, run_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, NOW(), NOW())
                "#,
            )
            .bind(task.id)
            .bind(task.session_id)
            .bind(task.item_index)
            .bind(&task.queue)
            .bind(task.attempt)
            .bind(task.max_attempts)
            .bind(task.run_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim(&self, queue: &str, worker_id: &str, limit: i64) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            r#"
            WITH next_tasks AS (
                SELECT id
                FROM tasks
                WHERE queue = $1
                  AND (
                    (status = 'pending' AND (run_at IS NULL OR run_at <= NOW()))
                    OR (status = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY COALESCE(run_at, created_at), id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET status = 'running',
                worker_id = $3,
                lease_expires_at = NOW() + ($4 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_tasks)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(limit)
        .bind(worker_id)
        .bind(self.lease_ms.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn mark_succeeded(&self, id: TaskId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'succeeded', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        error: &str,
        kind: TaskErrorKind,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<FailureOutcome> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        if kind.should_retry() && task.attempt < task.max_attempts && retry_at.is_some() {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'pending',
                    attempt = attempt + 1,
                    run_at = $1,
                    lease_expires_at = NULL,
                    worker_id = NULL,
                    error_message = $2,
                    error_kind = $3,
                    updated_at = NOW()
                WHERE id = $4
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await?;

            return Ok(FailureOutcome::Retrying {
                attempt: task.attempt + 1,
            });
        }

        let terminal = if kind == TaskErrorKind::Permanent {
            TaskStatus::Failed
        } else {
            TaskStatus::DeadLetter
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1,
                error_message = $2,
                error_kind = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(terminal)
        .bind(error)
        .bind(kind)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(FailureOutcome::Exhausted)
    }

    async fn defer(&self, id: TaskId, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                run_at = $1,
                lease_expires_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(run_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_cancelled(&self, id: TaskId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', error_kind = 'cancelled', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promote(&self, session_id: SessionId, queue: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET run_at = NOW(), updated_at = NOW()
            WHERE session_id = $1
              AND queue = $2
              AND status = 'pending'
              AND run_at > NOW()
            "#,
        )
        .bind(session_id)
        .bind(queue)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cancel_pending(&self, session_id: SessionId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled', error_kind = 'cancelled', updated_at = NOW()
            WHERE session_id = $1 AND status = 'pending'
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
