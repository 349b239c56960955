//! Extract stage (ocr queue): uploaded photo → full text + positioned
//! tokens. Scaffold stage: exhausting its retries fails the session.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::super::error::StageError;
use super::super::orchestrator::Orchestrator;
use crate::domains::sessions::events::EventKind;
use crate::kernel::tasks::{Task, TaskFailure};

pub async fn run(task: Task, orch: Arc<Orchestrator>) -> Result<(), TaskFailure> {
    let deps = orch.deps().clone();
    let session_id = task.session_id;

    let session = match deps.store.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(TaskFailure::permanent("session not found")),
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    };

    if session.is_terminal() {
        return Err(TaskFailure::Cancelled);
    }

    // Duplicate delivery after a completed extract: re-fire the downstream
    // enqueue (categorize is idempotent) and ack.
    if session.full_text.is_some() {
        if let Err(e) = orch.after_extract_completed(session_id).await {
            return Err(TaskFailure::transient(e.to_string()));
        }
        return Ok(());
    }

    match deps.store.append_event(session_id, EventKind::ExtractInFlight).await {
        Ok(event) => orch.publish(&event).await,
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    }

    let image = match deps.image_store.get(&session.image_key).await {
        Ok(bytes) => bytes,
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    };

    let extracted = match deps.text_extractor.extract(&image).await {
        Ok(extracted) => extracted,
        Err(e) => return Err(StageError::Provider(e).into_task_failure(Duration::from_secs(2))),
    };

    let event = match deps.store.set_extract_result(session_id, &extracted).await {
        Ok(event) => event,
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    };
    orch.publish(&event).await;

    orch.after_extract_completed(session_id)
        .await
        .map_err(|e| TaskFailure::transient(e.to_string()))?;

    Ok(())
}

/// Extract exhausted its retries: fatal scaffold failure.
pub async fn exhausted(task: Task, error_message: String, orch: Arc<Orchestrator>) {
    match orch
        .deps()
        .store
        .append_event(
            task.session_id,
            EventKind::ExtractFailed {
                error: error_message,
            },
        )
        .await
    {
        Ok(event) => orch.publish(&event).await,
        Err(e) => error!(session_id = %task.session_id, error = %e, "failed to record extract failure"),
    }

    orch.fail_session(task.session_id, "extract_failed").await;
}
