//! Describe stage: dish name + category → one-sentence description.
//! Independent of translate; prompts with the source text until an English
//! name exists.

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

    run_item_stage(task, orch, ItemStage::Describe, |_, item| async move {
        let description = deps
            .describer
            .describe(prompt_name(&item), &item.category)
            .await
            .map_err(StageError::Provider)?;

        Ok(StagePayload::Describe {
            description: description.text,
            extra: Map::new(),
        })
    })
    .await
}
