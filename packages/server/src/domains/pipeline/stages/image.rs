//! Image stage: dish name (+ description when available) → representative
//! image reference.
//!
//! Waits for translate to finish or for the configured timeout measured
//! from item materialization, whichever comes first; past the timeout it
//! proceeds with the source text. Binary results are uploaded to the image
//! store and referenced by key.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Map;

use super::super::error::StageError;
use super::super::orchestrator::Orchestrator;
use super::run_item_stage;
use crate::domains::sessions::events::StagePayload;
use crate::domains::sessions::models::ItemStage;
use crate::kernel::tasks::{Task, TaskFailure};
use crate::kernel::traits::ImageContent;

pub async fn run(task: Task, orch: Arc<Orchestrator>) -> Result<(), TaskFailure> {
    let deps = orch.deps().clone();

    run_item_stage(task, orch, ItemStage::Image, |session, item| async move {
        let wait_budget =
            Duration::milliseconds(deps.config.pipeline.image_wait_for_translate_ms as i64);
        let waited_out = session
            .materialized_at
            .map(|at| Utc::now() - at >= wait_budget)
            .unwrap_or(true);

        if !item.stage_status(ItemStage::Translate).is_terminal() && !waited_out {
            return Err(StageError::DependencyMissing(
                "waiting for translate".to_string(),
            ));
        }

        let name = item
            .english_text
            .clone()
            .unwrap_or_else(|| item.source_text.clone());

        let found = deps
            .image_finder
            .find(&name, &item.category, item.description.as_deref())
            .await
            .map_err(StageError::Provider)?;

        let image_ref = match found.content {
            ImageContent::Url(url) => url,
            ImageContent::Bytes { data, content_type } => {
                let key = format!("images/{}/{}.png", session.id, item.item_index);
                deps.image_store
                    .put(&key, &data, &content_type)
                    .await
                    .map_err(StageError::Internal)?
            }
        };

        Ok(StagePayload::Image {
            image_ref,
            origin: found.origin,
            attribution: found.attribution,
            extra: Map::new(),
        })
    })
    .await
}
