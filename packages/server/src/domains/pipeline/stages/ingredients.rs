//! Ingredient stage: dish name + category → typical ingredients.

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

    run_item_stage(task, orch, ItemStage::Ingredients, |_, item| async move {
        let report = deps
            .ingredient_detector
            .detect(prompt_name(&item), &item.category)
            .await
            .map_err(StageError::Provider)?;

        Ok(StagePayload::Ingredients {
            ingredients: report.ingredients,
            confidence: report.confidence,
            extra: Map::new(),
        })
    })
    .await
}
