//! Session model: one pipeline run per uploaded menu photo.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::common::SessionId;
use crate::kernel::traits::OcrToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Processing)
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub failure_reason: Option<String>,
    /// Set once by categorize, immutable afterwards.
    pub total_items: Option<i32>,
    /// Highest allocated event sequence number.
    pub last_seq: i64,
    /// Storage key of the uploaded photo.
    pub image_key: String,
    pub full_text: Option<String>,
    pub tokens: Option<Json<Vec<OcrToken>>>,
    /// When categorize materialized the item set. The image stage's
    /// translate-wait timeout is measured from here.
    pub materialized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(image_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            status: SessionStatus::Processing,
            failure_reason: None,
            total_items: None,
            last_seq: 0,
            image_key: image_key.to_string(),
            full_text: None,
            tokens: None,
            materialized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal sessions past the retention window answer 410 and are
    /// eligible for deletion by the sweeper.
    pub fn is_expired(&self, retention_seconds: i64, now: DateTime<Utc>) -> bool {
        self.is_terminal() && self.updated_at + Duration::seconds(retention_seconds) < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_processing() {
        let session = Session::new("uploads/a.jpg");
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(!session.is_terminal());
        assert_eq!(session.last_seq, 0);
    }

    #[test]
    fn expiry_requires_terminal_status() {
        let mut session = Session::new("uploads/a.jpg");
        let later = session.updated_at + Duration::seconds(100);

        assert!(!session.is_expired(10, later));

        session.status = SessionStatus::Completed;
        assert!(session.is_expired(10, later));
        assert!(!session.is_expired(1_000, later));
    }
}
