//! Stage executors, one per queue.
//!
//! Every per-item executor runs through [`run_item_stage`]: duplicate
//! check, in-flight write, provider call, atomic completion write. The
//! skeleton re-checks the session at each checkpoint so cancellation is
//! observed at suspension points, and all writes go through the store's
//! guarded transitions so re-execution converges.

pub mod allergens;
pub mod categorize;
pub mod describe;
pub mod extract;
pub mod image;
pub mod ingredients;
pub mod translate;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::error::StageError;
use super::orchestrator::Orchestrator;
use crate::domains::sessions::events::{EventKind, StagePayload};
use crate::domains::sessions::models::{ItemStage, MenuItem, Session, StageStatus};
use crate::domains::sessions::store::{StageTransition, StageWrite};
use crate::kernel::tasks::{Task, TaskFailure};

/// Reschedule interval when an upstream dependency is not ready.
const DEPENDENCY_DEFER: Duration = Duration::from_secs(2);

/// Reschedule interval when the session's per-stage gate is full.
const GATE_DEFER: Duration = Duration::from_millis(500);

/// Shared skeleton for the five per-item stages.
pub(super) async fn run_item_stage<F, Fut>(
    task: Task,
    orch: Arc<Orchestrator>,
    stage: ItemStage,
    produce: F,
) -> Result<(), TaskFailure>
where
    F: FnOnce(Session, MenuItem) -> Fut,
    Fut: Future<Output = Result<StagePayload, StageError>>,
{
    let deps = orch.deps().clone();
    let session_id = task.session_id;
    let Some(item_index) = task.item_index else {
        return Err(TaskFailure::permanent("item task missing item_index"));
    };

    let session = match deps.store.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(TaskFailure::permanent("session not found")),
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    };

    // Cancellation checkpoint: resolve to skipped so invariants hold.
    if session.is_terminal() {
        orch.skip_item_stage(session_id, item_index, stage).await;
        return Err(TaskFailure::Cancelled);
    }

    let item = match deps.store.get_item(session_id, item_index).await {
        Ok(Some(item)) => item,
        Ok(None) => return Err(TaskFailure::permanent("item not found")),
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    };

    // Idempotency: a duplicate delivery of a finished stage is a no-op.
    if item.stage_status(stage) == StageStatus::Completed {
        emit_duplicate_skip(&orch, session_id, item_index, stage).await;
        return Ok(());
    }
    if item.stage_status(stage).is_terminal() {
        return Ok(());
    }

    let permits = deps
        .config
        .pipeline
        .stage(stage.queue())
        .session_concurrency;
    let Some(_permit) = orch.gates().try_acquire(session_id, stage, permits) else {
        return Err(TaskFailure::deferred(GATE_DEFER, "session gate full"));
    };

    match deps
        .store
        .update_item_stage(
            session_id,
            item_index,
            stage,
            StageTransition::InFlight {
                attempt: task.attempt,
            },
        )
        .await
    {
        Ok(StageWrite::Applied(Some(event))) => orch.publish(&event).await,
        Ok(StageWrite::Applied(None)) => {}
        Ok(StageWrite::Stale) => {
            emit_duplicate_skip(&orch, session_id, item_index, stage).await;
            return Ok(());
        }
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    }

    let payload = match produce(session, item).await {
        Ok(payload) => payload,
        Err(StageError::Cancelled) => {
            orch.skip_item_stage(session_id, item_index, stage).await;
            return Err(TaskFailure::Cancelled);
        }
        Err(e) => return Err(e.into_task_failure(DEPENDENCY_DEFER)),
    };

    // Cancellation checkpoint after the provider call: a cancelled
    // session discards the result.
    match deps.store.get_session(session_id).await {
        Ok(Some(session)) if session.is_terminal() => {
            orch.skip_item_stage(session_id, item_index, stage).await;
            return Err(TaskFailure::Cancelled);
        }
        Ok(_) => {}
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    }

    match deps
        .store
        .update_item_stage(
            session_id,
            item_index,
            stage,
            StageTransition::Completed { payload },
        )
        .await
    {
        Ok(StageWrite::Applied(Some(event))) => {
            orch.publish(&event).await;
            orch.after_item_stage_terminal(session_id, stage).await;
            Ok(())
        }
        Ok(StageWrite::Applied(None)) => Ok(()),
        Ok(StageWrite::Stale) => {
            emit_duplicate_skip(&orch, session_id, item_index, stage).await;
            Ok(())
        }
        Err(e) => Err(TaskFailure::transient(e.to_string())),
    }
}

async fn emit_duplicate_skip(
    orch: &Arc<Orchestrator>,
    session_id: crate::common::SessionId,
    item_index: i32,
    stage: ItemStage,
) {
    match orch
        .deps()
        .store
        .append_event(
            session_id,
            EventKind::StageSkippedDuplicate { item_index, stage },
        )
        .await
    {
        Ok(event) => orch.publish(&event).await,
        Err(e) => {
            error!(session_id = %session_id, item_index, stage = %stage, error = %e,
                "failed to record duplicate skip");
        }
    }
}

/// Exhaustion hook shared by the five per-item queues: mark the stage
/// failed with the final error and re-check completion. The session itself
/// keeps going — clients render partial results.
pub(super) async fn item_stage_exhausted(
    task: Task,
    error: String,
    orch: Arc<Orchestrator>,
    stage: ItemStage,
) {
    let Some(item_index) = task.item_index else {
        return;
    };

    match orch
        .deps()
        .store
        .update_item_stage(
            task.session_id,
            item_index,
            stage,
            StageTransition::Failed {
                error,
                attempt: task.attempt,
            },
        )
        .await
    {
        Ok(StageWrite::Applied(Some(event))) => {
            orch.publish(&event).await;
            orch.after_item_stage_terminal(task.session_id, stage).await;
        }
        Ok(_) => {}
        Err(e) => {
            error!(session_id = %task.session_id, item_index, stage = %stage, error = %e,
                "failed to mark stage as failed");
        }
    }
}

/// The display name used in prompts: English once translate landed, the
/// source text otherwise (these stages do not depend on translate).
pub(super) fn prompt_name(item: &MenuItem) -> &str {
    item.english_text.as_deref().unwrap_or(&item.source_text)
}
