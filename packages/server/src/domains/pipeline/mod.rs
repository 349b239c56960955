//! Pipeline domain: DAG orchestration and stage executors.

pub mod error;
pub mod gates;
pub mod orchestrator;
pub mod stages;

use std::sync::Arc;

use orchestrator::{Orchestrator, CATEGORIZE_QUEUE, OCR_QUEUE};
use stages::item_stage_exhausted;

use crate::domains::sessions::models::ItemStage;
use crate::kernel::tasks::TaskRegistry;

/// Wire every queue to its executor and exhaustion hook.
pub fn build_task_registry(orch: Arc<Orchestrator>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    {
        let orch = orch.clone();
        registry.register(OCR_QUEUE, move |task, _deps| {
            stages::extract::run(task, orch.clone())
        });
    }
    {
        let orch = orch.clone();
        registry.on_exhausted(OCR_QUEUE, move |task, error, _deps| {
            stages::extract::exhausted(task, error, orch.clone())
        });
    }

    {
        let orch = orch.clone();
        registry.register(CATEGORIZE_QUEUE, move |task, _deps| {
            stages::categorize::run(task, orch.clone())
        });
    }
    {
        let orch = orch.clone();
        registry.on_exhausted(CATEGORIZE_QUEUE, move |task, error, _deps| {
            stages::categorize::exhausted(task, error, orch.clone())
        });
    }

    {
        let orch = orch.clone();
        registry.register(ItemStage::Translate.queue(), move |task, _deps| {
            stages::translate::run(task, orch.clone())
        });
    }
    {
        let orch = orch.clone();
        registry.register(ItemStage::Describe.queue(), move |task, _deps| {
            stages::describe::run(task, orch.clone())
        });
    }
    {
        let orch = orch.clone();
        registry.register(ItemStage::Allergens.queue(), move |task, _deps| {
            stages::allergens::run(task, orch.clone())
        });
    }
    {
        let orch = orch.clone();
        registry.register(ItemStage::Ingredients.queue(), move |task, _deps| {
            stages::ingredients::run(task, orch.clone())
        });
    }
    {
        let orch = orch.clone();
        registry.register(ItemStage::Image.queue(), move |task, _deps| {
            stages::image::run(task, orch.clone())
        });
    }

    for stage in ItemStage::ALL {
        let orch = orch.clone();
        registry.on_exhausted(stage.queue(), move |task, error, _deps| {
            item_stage_exhausted(task, error, orch.clone(), stage)
        });
    }

    registry
}
