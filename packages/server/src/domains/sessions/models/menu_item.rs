//! Menu item model and its per-stage status tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;

use crate::common::SessionId;
use crate::kernel::traits::{AllergenEntry, BoundingBox, IngredientEntry};

/// The five per-item pipeline stages, fanned out after categorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStage {
    Translate,
    Describe,
    Allergens,
    Ingredients,
    Image,
}

impl ItemStage {
    pub const ALL: [ItemStage; 5] = [
        ItemStage::Translate,
        ItemStage::Describe,
        ItemStage::Allergens,
        ItemStage::Ingredients,
        ItemStage::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStage::Translate => "translate",
            ItemStage::Describe => "describe",
            ItemStage::Allergens => "allergens",
            ItemStage::Ingredients => "ingredients",
            ItemStage::Image => "image",
        }
    }

    /// Queue names match stage names one-to-one.
    pub fn queue(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ItemStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "stage_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InFlight,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

/// Item skeleton produced by categorize, before any per-item stage runs.
#[derive(Debug, Clone)]
pub struct NewMenuItem {
    pub item_index: i32,
    pub source_text: String,
    pub bounds: Option<BoundingBox>,
    pub category: String,
    pub price: Option<String>,
}

#[derive(FromRow, Debug, Clone)]
pub struct MenuItem {
    pub session_id: SessionId,
    pub item_index: i32,

    pub source_text: String,
    pub bounds: Option<Json<BoundingBox>>,
    pub category: String,
    pub price: Option<String>,

    pub english_text: Option<String>,
    pub description: Option<String>,
    pub allergens: Option<Json<Vec<AllergenEntry>>>,
    pub ingredients: Option<Json<Vec<IngredientEntry>>>,
    pub image_ref: Option<String>,

    pub translate_status: StageStatus,
    pub translate_attempt: i32,
    pub translate_error: Option<String>,

    pub describe_status: StageStatus,
    pub describe_attempt: i32,
    pub describe_error: Option<String>,

    pub allergens_status: StageStatus,
    pub allergens_attempt: i32,
    pub allergens_error: Option<String>,

    pub ingredients_status: StageStatus,
    pub ingredients_attempt: i32,
    pub ingredients_error: Option<String>,

    pub image_status: StageStatus,
    pub image_attempt: i32,
    pub image_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MenuItem {
    pub fn new(session_id: SessionId, skeleton: &NewMenuItem) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            item_index: skeleton.item_index,
            source_text: skeleton.source_text.clone(),
            bounds: skeleton.bounds.map(Json),
            category: skeleton.category.clone(),
            price: skeleton.price.clone(),
            english_text: None,
            description: None,
            allergens: None,
            ingredients: None,
            image_ref: None,
            translate_status: StageStatus::Pending,
            translate_attempt: 0,
            translate_error: None,
            describe_status: StageStatus::Pending,
            describe_attempt: 0,
            describe_error: None,
            allergens_status: StageStatus::Pending,
            allergens_attempt: 0,
            allergens_error: None,
            ingredients_status: StageStatus::Pending,
            ingredients_attempt: 0,
            ingredients_error: None,
            image_status: StageStatus::Pending,
            image_attempt: 0,
            image_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: ItemStage) -> StageStatus {
        match stage {
            ItemStage::Translate => self.translate_status,
            ItemStage::Describe => self.describe_status,
            ItemStage::Allergens => self.allergens_status,
            ItemStage::Ingredients => self.ingredients_status,
            ItemStage::Image => self.image_status,
        }
    }

    pub fn stage_attempt(&self, stage: ItemStage) -> i32 {
        match stage {
            ItemStage::Translate => self.translate_attempt,
            ItemStage::Describe => self.describe_attempt,
            ItemStage::Allergens => self.allergens_attempt,
            ItemStage::Ingredients => self.ingredients_attempt,
            ItemStage::Image => self.image_attempt,
        }
    }

    pub fn set_stage(&mut self, stage: ItemStage, status: StageStatus) {
        match stage {
            ItemStage::Translate => self.translate_status = status,
            ItemStage::Describe => self.describe_status = status,
            ItemStage::Allergens => self.allergens_status = status,
            ItemStage::Ingredients => self.ingredients_status = status,
            ItemStage::Image => self.image_status = status,
        }
        self.updated_at = Utc::now();
    }

    pub fn set_stage_attempt(&mut self, stage: ItemStage, attempt: i32) {
        match stage {
            ItemStage::Translate => self.translate_attempt = attempt,
            ItemStage::Describe => self.describe_attempt = attempt,
            ItemStage::Allergens => self.allergens_attempt = attempt,
            ItemStage::Ingredients => self.ingredients_attempt = attempt,
            ItemStage::Image => self.image_attempt = attempt,
        }
    }

    pub fn set_stage_error(&mut self, stage: ItemStage, error: Option<String>) {
        match stage {
            ItemStage::Translate => self.translate_error = error,
            ItemStage::Describe => self.describe_error = error,
            ItemStage::Allergens => self.allergens_error = error,
            ItemStage::Ingredients => self.ingredients_error = error,
            ItemStage::Image => self.image_error = error,
        }
    }

    pub fn all_stages_terminal(&self) -> bool {
        ItemStage::ALL
            .iter()
            .all(|stage| self.stage_status(*stage).is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> MenuItem {
        MenuItem::new(
            SessionId::new(),
            &NewMenuItem {
                item_index: 0,
                source_text: "ブレンド".to_string(),
                bounds: None,
                category: "Drinks".to_string(),
                price: Some("¥400".to_string()),
            },
        )
    }

    #[test]
    fn new_item_starts_all_pending() {
        let item = item();
        for stage in ItemStage::ALL {
            assert_eq!(item.stage_status(stage), StageStatus::Pending);
        }
        assert!(!item.all_stages_terminal());
    }

    #[test]
    fn terminal_detection_needs_every_stage() {
        let mut item = item();
        for stage in ItemStage::ALL {
            item.set_stage(stage, StageStatus::Completed);
        }
        assert!(item.all_stages_terminal());

        item.set_stage(ItemStage::Image, StageStatus::InFlight);
        assert!(!item.all_stages_terminal());

        item.set_stage(ItemStage::Image, StageStatus::Failed);
        assert!(item.all_stages_terminal());
    }

    #[test]
    fn stage_names_match_queue_names() {
        assert_eq!(ItemStage::Translate.queue(), "translate");
        assert_eq!(ItemStage::Image.queue(), "image");
    }
}
