//! Session event kinds and per-stage payloads.
//!
//! Events are internally tagged by `kind` so the serialized form matches the
//! wire shape: `{"kind": "stage_completed", "item_index": 0, ...}`. Stage
//! payloads preserve unknown provider fields in a flattened `extra` map, so
//! the event schema is not coupled to any single provider.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::models::menu_item::ItemStage;
use crate::kernel::traits::{AllergenEntry, ImageOrigin, IngredientEntry, MenuCategory, OcrToken};

/// Minimal item shape carried by `items_materialized`, enough for a client
/// to render placeholders before any per-item stage completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSkeleton {
    pub index: i32,
    pub source_text: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Result payload of one completed item stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    Translate {
        english_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detected_lang: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        fallback_used: bool,
        #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
        extra: Map<String, Value>,
    },
    Describe {
        description: String,
        #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
        extra: Map<String, Value>,
    },
    Allergens {
        entries: Vec<AllergenEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
        extra: Map<String, Value>,
    },
    Ingredients {
        ingredients: Vec<IngredientEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
        extra: Map<String, Value>,
    },
    Image {
        image_ref: String,
        origin: ImageOrigin,
        #[serde(skip_serializing_if = "Option::is_none")]
        attribution: Option<String>,
        #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
        extra: Map<String, Value>,
    },
}

impl StagePayload {
    pub fn stage(&self) -> ItemStage {
        match self {
            StagePayload::Translate { .. } => ItemStage::Translate,
            StagePayload::Describe { .. } => ItemStage::Describe,
            StagePayload::Allergens { .. } => ItemStage::Allergens,
            StagePayload::Ingredients { .. } => ItemStage::Ingredients,
            StagePayload::Image { .. } => ItemStage::Image,
        }
    }
}

/// Session lifecycle events.
///
/// These are facts, not commands: each one records a state transition that
/// has already been committed to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated,

    ExtractInFlight,
    ExtractCompleted {
        tokens: Vec<OcrToken>,
        full_text: String,
    },
    ExtractFailed {
        error: String,
    },

    CategorizeInFlight,
    CategorizeCompleted {
        categories: Vec<MenuCategory>,
    },
    CategorizeFailed {
        error: String,
    },

    ItemsMaterialized {
        total_items: i32,
        items: Vec<ItemSkeleton>,
    },

    StageInFlight {
        item_index: i32,
        stage: ItemStage,
    },
    StageCompleted {
        item_index: i32,
        #[serde(flatten)]
        payload: StagePayload,
    },
    StageFailed {
        item_index: i32,
        stage: ItemStage,
        error: String,
        attempt: i32,
    },
    StageSkippedDuplicate {
        item_index: i32,
        stage: ItemStage,
    },

    SessionCompleted,
    SessionCancelled {
        reason: String,
    },
    SessionFailed {
        reason: String,
    },
}

impl EventKind {
    /// The wire tag, also stored in the `kind` column for indexing.
    pub fn kind_str(&self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session_created",
            EventKind::ExtractInFlight => "extract_in_flight",
            EventKind::ExtractCompleted { .. } => "extract_completed",
            EventKind::ExtractFailed { .. } => "extract_failed",
            EventKind::CategorizeInFlight => "categorize_in_flight",
            EventKind::CategorizeCompleted { .. } => "categorize_completed",
            EventKind::CategorizeFailed { .. } => "categorize_failed",
            EventKind::ItemsMaterialized { .. } => "items_materialized",
            EventKind::StageInFlight { .. } => "stage_in_flight",
            EventKind::StageCompleted { .. } => "stage_completed",
            EventKind::StageFailed { .. } => "stage_failed",
            EventKind::StageSkippedDuplicate { .. } => "stage_skipped_duplicate",
            EventKind::SessionCompleted => "session_completed",
            EventKind::SessionCancelled { .. } => "session_cancelled",
            EventKind::SessionFailed { .. } => "session_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_with_snake_case_kind() {
        let event = EventKind::ItemsMaterialized {
            total_items: 2,
            items: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "items_materialized");
        assert_eq!(json["total_items"], 2);
    }

    #[test]
    fn stage_completed_flattens_payload() {
        let event = EventKind::StageCompleted {
            item_index: 0,
            payload: StagePayload::Translate {
                english_text: "Blend".to_string(),
                detected_lang: Some("ja".to_string()),
                fallback_used: true,
                extra: Map::new(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "stage_completed");
        assert_eq!(json["stage"], "translate");
        assert_eq!(json["english_text"], "Blend");
        assert_eq!(json["fallback_used"], true);
    }

    #[test]
    fn fallback_flag_is_omitted_when_false() {
        let event = EventKind::StageCompleted {
            item_index: 1,
            payload: StagePayload::Translate {
                english_text: "Blend".to_string(),
                detected_lang: None,
                fallback_used: false,
                extra: Map::new(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("fallback_used").is_none());
    }

    #[test]
    fn payload_extra_fields_roundtrip() {
        let raw = serde_json::json!({
            "kind": "stage_completed",
            "item_index": 0,
            "stage": "image",
            "image_ref": "images/abc.png",
            "origin": "generated",
            "provider_model": "v3"
        });
        let event: EventKind = serde_json::from_value(raw.clone()).unwrap();
        let EventKind::StageCompleted { payload, .. } = &event else {
            panic!("wrong kind");
        };
        let StagePayload::Image { extra, .. } = payload else {
            panic!("wrong stage");
        };
        assert_eq!(extra["provider_model"], "v3");
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);
    }

    #[test]
    fn kind_str_matches_serialized_tag() {
        let events = vec![
            EventKind::SessionCreated,
            EventKind::ExtractInFlight,
            EventKind::ExtractFailed {
                error: "e".to_string(),
            },
            EventKind::SessionCompleted,
            EventKind::SessionCancelled {
                reason: "client request".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["kind"], event.kind_str());
        }
    }
}
