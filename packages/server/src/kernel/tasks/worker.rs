//! Worker pools serving the named task queues.
//!
//! Each queue gets `concurrency` worker loops. A loop claims one task at a
//! time, runs its executor under the per-stage timeout, and translates the
//! outcome into queue bookkeeping: ack, retry with backoff, defer, or
//! dead-letter (which fires the queue's exhaustion hook).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::FailureOutcome;
use super::registry::SharedTaskRegistry;
use super::retry_backoff;
use super::task::{Task, TaskErrorKind, TaskFailure};
use crate::config::StageSettings;
use crate::kernel::deps::ServerDeps;

pub struct WorkerPool {
    registry: SharedTaskRegistry,
    deps: Arc<ServerDeps>,
}

impl WorkerPool {
    pub fn new(registry: SharedTaskRegistry, deps: Arc<ServerDeps>) -> Self {
        Self { registry, deps }
    }

    /// Spawn every queue's worker loops. Loops exit when `shutdown` fires.
    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for queue in self.registry.queues() {
            let settings = self.deps.config.pipeline.stage(queue).clone();
            info!(
                queue = queue,
                concurrency = settings.concurrency,
                "starting queue workers"
            );

            for slot in 0..settings.concurrency {
                let worker_id = format!("{}-{}-{}", queue, slot, Uuid::new_v4());
                let registry = self.registry.clone();
                let deps = self.deps.clone();
                let settings = settings.clone();
                let shutdown = shutdown.clone();

                handles.push(tokio::spawn(async move {
                    worker_loop(queue, worker_id, registry, deps, settings, shutdown).await;
                }));
            }
        }

        handles
    }
}

async fn worker_loop(
    queue: &'static str,
    worker_id: String,
    registry: SharedTaskRegistry,
    deps: Arc<ServerDeps>,
    settings: StageSettings,
    shutdown: CancellationToken,
) {
    let poll_interval = Duration::from_millis(deps.config.pipeline.worker.poll_interval_ms);

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let tasks = match deps.queue.claim(queue, &worker_id, 1).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(queue = queue, error = %e, "failed to claim tasks");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(task) = tasks.into_iter().next() else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        process_task(task, &registry, &deps, &settings).await;
    }

    debug!(queue = queue, worker_id = %worker_id, "worker stopped");
}

async fn process_task(
    task: Task,
    registry: &SharedTaskRegistry,
    deps: &Arc<ServerDeps>,
    settings: &StageSettings,
) {
    let task_id = task.id;
    let timeout = Duration::from_millis(settings.timeout_ms);

    debug!(
        task_id = %task_id,
        queue = %task.queue,
        attempt = task.attempt,
        "executing task"
    );

    let result = match tokio::time::timeout(timeout, registry.execute(&task, deps.clone())).await {
        Ok(result) => result,
        Err(_) => Err(TaskFailure::transient(format!(
            "task timed out after {}ms",
            settings.timeout_ms
        ))),
    };

    match result {
        Ok(()) => {
            debug!(task_id = %task_id, queue = %task.queue, "task succeeded");
            if let Err(e) = deps.queue.mark_succeeded(task_id).await {
                error!(task_id = %task_id, error = %e, "failed to mark task as succeeded");
            }
        }
        Err(TaskFailure::Deferred {
            retry_after,
            message,
        }) => {
            debug!(task_id = %task_id, queue = %task.queue, reason = %message, "task deferred");
            let run_at = Utc::now() + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());
            if let Err(e) = deps.queue.defer(task_id, run_at).await {
                error!(task_id = %task_id, error = %e, "failed to defer task");
            }
        }
        Err(TaskFailure::Cancelled) => {
            debug!(task_id = %task_id, queue = %task.queue, "task cancelled");
            if let Err(e) = deps.queue.mark_cancelled(task_id).await {
                error!(task_id = %task_id, error = %e, "failed to mark task as cancelled");
            }
        }
        Err(TaskFailure::Retryable { kind, message }) => {
            handle_retryable(task, kind, message, registry, deps).await;
        }
        Err(TaskFailure::Permanent { message }) => {
            warn!(task_id = %task_id, queue = %task.queue, error = %message, "task failed permanently");
            match deps
                .queue
                .mark_failed(task_id, &message, TaskErrorKind::Permanent, None)
                .await
            {
                Ok(_) => registry.exhausted(&task, &message, deps.clone()).await,
                Err(e) => error!(task_id = %task_id, error = %e, "failed to mark task as failed"),
            }
        }
    }
}

async fn handle_retryable(
    task: Task,
    kind: TaskErrorKind,
    message: String,
    registry: &SharedTaskRegistry,
    deps: &Arc<ServerDeps>,
) {
    let retry = &deps.config.pipeline.retry;
    let task_id = task.id;

    warn!(
        task_id = %task_id,
        queue = %task.queue,
        attempt = task.attempt,
        error = %message,
        "task failed"
    );

    // Rate-limited failures may be configured to not consume the attempt
    // budget. They are deferred instead, bounded by total task age so a
    // provider that never recovers still fails the stage eventually.
    if kind == TaskErrorKind::RateLimited && !retry.rate_limit_counts_attempts {
        let age_budget = chrono::Duration::milliseconds(
            retry.cap_ms.saturating_mul(task.max_attempts.max(1) as u64) as i64,
        );
        if Utc::now() - task.created_at < age_budget {
            let delay = retry_backoff(1, retry.rate_limited_base_ms, retry.cap_ms);
            let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if let Err(e) = deps.queue.defer(task_id, run_at).await {
                error!(task_id = %task_id, error = %e, "failed to defer rate-limited task");
            }
            return;
        }

        // Out of grace time: fall through to terminal handling.
        match deps.queue.mark_failed(task_id, &message, kind, None).await {
            Ok(_) => registry.exhausted(&task, &message, deps.clone()).await,
            Err(e) => error!(task_id = %task_id, error = %e, "failed to mark task as failed"),
        }
        return;
    }

    let base = if kind == TaskErrorKind::RateLimited {
        retry.rate_limited_base_ms
    } else {
        retry.base_ms
    };
    let delay = retry_backoff(task.attempt, base, retry.cap_ms);
    let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

    match deps
        .queue
        .mark_failed(task_id, &message, kind, Some(retry_at))
        .await
    {
        Ok(FailureOutcome::Retrying { attempt }) => {
            debug!(task_id = %task_id, attempt = attempt, retry_at = %retry_at, "task scheduled for retry");
        }
        Ok(FailureOutcome::Exhausted) => {
            registry.exhausted(&task, &message, deps.clone()).await;
        }
        Err(e) => {
            error!(task_id = %task_id, error = %e, "failed to mark task as failed");
        }
    }
}
