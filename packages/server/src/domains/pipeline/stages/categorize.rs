//! Categorize stage: extract output → categories → materialized items.
//! Scaffold stage: exhausting its retries fails the session. Also enforces
//! the per-session item cap.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use super::super::error::StageError;
use super::super::orchestrator::Orchestrator;
use crate::domains::sessions::events::EventKind;
use crate::domains::sessions::models::NewMenuItem;
use crate::kernel::tasks::{Task, TaskFailure};
use crate::kernel::traits::{BoundingBox, MenuCategory, OcrToken};

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

    // Duplicate delivery after materialization: re-fan-out (idempotent)
    // and ack.
    if session.total_items.is_some() {
        if let Err(e) = orch.fan_out(session_id).await {
            return Err(TaskFailure::transient(e.to_string()));
        }
        return Ok(());
    }

    let Some(full_text) = session.full_text.clone() else {
        return Err(TaskFailure::deferred(
            Duration::from_secs(2),
            "extract output not ready",
        ));
    };

    match deps
        .store
        .append_event(session_id, EventKind::CategorizeInFlight)
        .await
    {
        Ok(event) => orch.publish(&event).await,
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    }

    let categories = match deps.categorizer.categorize(&full_text).await {
        Ok(categories) => categories,
        Err(e) => return Err(StageError::Provider(e).into_task_failure(Duration::from_secs(2))),
    };

    let tokens = session
        .tokens
        .as_ref()
        .map(|json| json.0.as_slice())
        .unwrap_or(&[]);
    let items = flatten_items(&categories, tokens);

    if items.len() as i32 > deps.config.session.max_items {
        orch.fail_session(session_id, "too_many_items").await;
        return Ok(());
    }

    match deps
        .store
        .append_event(session_id, EventKind::CategorizeCompleted { categories })
        .await
    {
        Ok(event) => orch.publish(&event).await,
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    }

    match deps.store.materialize_items(session_id, &items).await {
        Ok(Some(event)) => orch.publish(&event).await,
        Ok(None) => {}
        Err(e) => return Err(TaskFailure::transient(e.to_string())),
    }

    orch.fan_out(session_id)
        .await
        .map_err(|e| TaskFailure::transient(e.to_string()))?;

    Ok(())
}

/// Flatten categories into indexed items, attaching the OCR region whose
/// text matches the item name when one exists.
fn flatten_items(categories: &[MenuCategory], tokens: &[OcrToken]) -> Vec<NewMenuItem> {
    let mut items = Vec::new();
    for category in categories {
        for entry in &category.items {
            items.push(NewMenuItem {
                item_index: items.len() as i32,
                source_text: entry.name.clone(),
                bounds: match_bounds(tokens, &entry.name),
                category: category.name.clone(),
                price: entry.price.clone(),
            });
        }
    }
    items
}

fn match_bounds(tokens: &[OcrToken], name: &str) -> Option<BoundingBox> {
    tokens
        .iter()
        .find(|token| {
            !token.text.trim().is_empty()
                && (name.contains(token.text.trim()) || token.text.contains(name))
        })
        .map(|token| token.bounds)
}

/// Categorize exhausted its retries: fatal scaffold failure.
pub async fn exhausted(task: Task, error_message: String, orch: Arc<Orchestrator>) {
    match orch
        .deps()
        .store
        .append_event(
            task.session_id,
            EventKind::CategorizeFailed {
                error: error_message,
            },
        )
        .await
    {
        Ok(event) => orch.publish(&event).await,
        Err(e) => {
            error!(session_id = %task.session_id, error = %e, "failed to record categorize failure")
        }
    }

    orch.fail_session(task.session_id, "categorize_failed").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::traits::{MenuEntry, Point};

    fn token(text: &str) -> OcrToken {
        OcrToken {
            text: text.to_string(),
            bounds: BoundingBox {
                corners: [
                    Point { x: 0.0, y: 0.0 },
                    Point { x: 1.0, y: 0.0 },
                    Point { x: 1.0, y: 1.0 },
                    Point { x: 0.0, y: 1.0 },
                ],
            },
        }
    }

    #[test]
    fn flatten_preserves_category_order_and_indexing() {
        let categories = vec![
            MenuCategory {
                name: "Drinks".to_string(),
                items: vec![
                    MenuEntry {
                        name: "ブレンド".to_string(),
                        price: Some("¥400".to_string()),
                    },
                    MenuEntry {
                        name: "カフェラテ".to_string(),
                        price: None,
                    },
                ],
            },
            MenuCategory {
                name: "Food".to_string(),
                items: vec![MenuEntry {
                    name: "トースト".to_string(),
                    price: Some("¥300".to_string()),
                }],
            },
        ];

        let items = flatten_items(&categories, &[]);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].item_index, 0);
        assert_eq!(items[0].source_text, "ブレンド");
        assert_eq!(items[0].category, "Drinks");
        assert_eq!(items[2].item_index, 2);
        assert_eq!(items[2].category, "Food");
    }

    #[test]
    fn bounds_match_by_containment() {
        let tokens = vec![token("ブレンド"), token("トースト")];
        let bounds = match_bounds(&tokens, "ブレンド");
        assert!(bounds.is_some());

        assert!(match_bounds(&tokens, "カレー").is_none());
    }
}
