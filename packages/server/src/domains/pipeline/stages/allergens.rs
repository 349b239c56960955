//! Allergen stage: dish name + category → likely allergens with severity
//! and likelihood. An empty list is a valid completed result.

use std::sync::Arc;

use serde_json::Map;

use super::super::error::StageError;
use super::super::orchestrator::Orchestrator;
use super::{prompt_name, run_item_stage};
use crate::domains::sessions::events::StagePayload;
use crate::domains::sessions::models::ItemStage;
use crate::kernel::tasks::{Task, TaskFailure};

pub async fn run(task: Task, orch: Arc<Orchestrator>) -> Result<(), TaskFailure> {
    let deps = orch.deps().clone();

    run_item_stage(task, orch, ItemStage::Allergens, |_, item| async move {
        let report = deps
            .allergen_detector
            .detect(prompt_name(&item), &item.category)
            .await
            .map_err(StageError::Provider)?;

        Ok(StagePayload::Allergens {
            entries: report.entries,
            confidence: report.confidence,
            extra: Map::new(),
        })
    })
    .await
}
