//! Session endpoints: upload, snapshot, cancel.
//!
//! After the 202 on upload, every failure is reported in-stream; HTTP
//! errors only exist at session creation and for unknown/expired ids.

use axum::extract::{Extension, Multipart, Path};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::common::SessionId;
use crate::domains::sessions::models::{MenuItem, Session, SessionStatus, StageStatus};
use crate::kernel::traits::{AllergenEntry, BoundingBox, IngredientEntry};
use crate::server::app::AppState;

type ApiError = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

/// Sniff the image type from magic bytes. Uploads that are not images are
/// rejected before a session exists.
fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some("image/png")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

/// POST /v1/sessions (multipart: `image`)
pub async fn create_session_handler(
    Extension(state): Extension<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let config = &state.deps.config;

    let active = state
        .deps
        .store
        .count_active_sessions()
        .await
        .map_err(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable"))?;
    if active >= config.session.max_active {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "at capacity, retry later",
        ));
    }

    let mut image: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "malformed multipart body"))?
    {
        if field.name() == Some("image") {
            let bytes = field.bytes().await.map_err(|_| {
                error_response(StatusCode::PAYLOAD_TOO_LARGE, "image exceeds size limit")
            })?;
            image = Some(bytes.to_vec());
        }
    }

    let Some(image) = image else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "missing `image` field",
        ));
    };
    if image.len() > config.upload.max_bytes {
        return Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "image exceeds size limit",
        ));
    }
    let Some(content_type) = sniff_image(&image) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "not a supported image format",
        ));
    };

    let session = state
        .orchestrator
        .start_session(&image, content_type)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to start session");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to start session")
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateSessionResponse {
            session_id: session.id,
        }),
    ))
}

#[derive(Serialize)]
pub struct StageStatuses {
    pub translate: StageStatus,
    pub describe: StageStatus,
    pub allergens: StageStatus,
    pub ingredients: StageStatus,
    pub image: StageStatus,
}

#[derive(Serialize)]
pub struct ItemSnapshot {
    pub index: i32,
    pub source_text: String,
    #[serde(rename = "box", skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundingBox>,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub english_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allergens: Option<Vec<AllergenEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingredients: Option<Vec<IngredientEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub stages: StageStatuses,
}

impl From<MenuItem> for ItemSnapshot {
    fn from(item: MenuItem) -> Self {
        Self {
            index: item.item_index,
            source_text: item.source_text,
            bounds: item.bounds.map(|b| b.0),
            category: item.category,
            price: item.price,
            english_text: item.english_text,
            description: item.description,
            allergens: item.allergens.map(|a| a.0),
            ingredients: item.ingredients.map(|i| i.0),
            image_ref: item.image_ref,
            stages: StageStatuses {
                translate: item.translate_status,
                describe: item.describe_status,
                allergens: item.allergens_status,
                ingredients: item.ingredients_status,
                image: item.image_status,
            },
        }
    }
}

#[derive(Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<i32>,
    pub items: Vec<ItemSnapshot>,
    pub last_seq: i64,
}

/// Shared lookup for snapshot and stream endpoints: 404 for unknown ids,
/// 410 past retention.
pub async fn load_live_session(state: &AppState, id: &str) -> Result<Session, ApiError> {
    let id =
        SessionId::parse(id).map_err(|_| error_response(StatusCode::NOT_FOUND, "no such session"))?;

    let session = state
        .deps
        .store
        .get_session(id)
        .await
        .map_err(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable"))?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "no such session"))?;

    if session.is_expired(state.deps.config.session.retention_seconds, Utc::now()) {
        return Err(error_response(StatusCode::GONE, "session expired"));
    }
    Ok(session)
}

/// GET /v1/sessions/:id
pub async fn session_snapshot_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session = load_live_session(&state, &id).await?;

    let items = state
        .deps
        .store
        .list_items(session.id)
        .await
        .map_err(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable"))?;

    Ok(Json(SessionSnapshot {
        session_id: session.id,
        status: session.status,
        total_items: session.total_items,
        items: items.into_iter().map(ItemSnapshot::from).collect(),
        last_seq: session.last_seq,
    }))
}

/// DELETE /v1/sessions/:id — cancel. Idempotent: cancelling a terminal
/// session is still a 202.
pub async fn cancel_session_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = load_live_session(&state, &id).await?;

    state
        .orchestrator
        .cancel_session(session.id, "client request")
        .await
        .map_err(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "cancellation failed"))?;

    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_image_formats() {
        assert_eq!(sniff_image(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(
            sniff_image(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A]),
            Some("image/png")
        );
        assert_eq!(sniff_image(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_image(b"<!DOCTYPE html>"), None);
        assert_eq!(sniff_image(&[]), None);
    }

    #[test]
    fn item_snapshot_carries_stage_statuses() {
        let item = MenuItem::new(
            SessionId::new(),
            &crate::domains::sessions::models::NewMenuItem {
                item_index: 0,
                source_text: "ブレンド".to_string(),
                bounds: None,
                category: "Drinks".to_string(),
                price: Some("¥400".to_string()),
            },
        );
        let snapshot = ItemSnapshot::from(item);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["stages"]["translate"], "pending");
        assert_eq!(json["price"], "¥400");
        assert!(json.get("english_text").is_none());
    }
}
