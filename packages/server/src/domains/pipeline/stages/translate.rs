//! Translate stage: source name → English name.
//!
//! Fallback chain: primary translator → secondary translator → identity.
//! The identity fallback still completes the stage but flags the payload
//! with `fallback_used` so clients can render accordingly.

use std::sync::Arc;

use serde_json::Map;
use tracing::debug;

use super::super::error::StageError;
use super::super::orchestrator::Orchestrator;
use super::run_item_stage;
use crate::domains::sessions::events::StagePayload;
use crate::domains::sessions::models::ItemStage;
use crate::kernel::tasks::{Task, TaskFailure};
use crate::kernel::traits::Translation;

pub async fn run(task: Task, orch: Arc<Orchestrator>) -> Result<(), TaskFailure> {
    let deps = orch.deps().clone();
    let final_attempt = task.attempt >= task.max_attempts;

    run_item_stage(task, orch, ItemStage::Translate, |_, item| async move {
        let source = item.source_text.clone();

        match deps.translator.translate(&source, "en").await {
            Ok(translation) => Ok(payload(translation, false)),
            // Retryable failures go back to the runtime until the last
            // attempt, which degrades through the fallback chain instead.
            Err(e) if e.is_retryable() && !final_attempt => Err(StageError::Provider(e)),
            Err(primary_err) => {
                debug!(error = %primary_err, "primary translator failed, trying fallback");

                if let Some(fallback) = &deps.translator_fallback {
                    if let Ok(translation) = fallback.translate(&source, "en").await {
                        return Ok(payload(translation, false));
                    }
                }

                // Identity fallback: echo the source text.
                Ok(StagePayload::Translate {
                    english_text: source,
                    detected_lang: None,
                    fallback_used: true,
                    extra: Map::new(),
                })
            }
        }
    })
    .await
}

fn payload(translation: Translation, fallback_used: bool) -> StagePayload {
    StagePayload::Translate {
        english_text: translation.text,
        detected_lang: translation.detected_lang,
        fallback_used,
        extra: Map::new(),
    }
}
