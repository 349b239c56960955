//! Durable event-log row.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::common::SessionId;
use crate::domains::sessions::events::EventKind;

#[derive(FromRow, Debug, Clone)]
pub struct SessionEvent {
    pub session_id: SessionId,
    /// Strictly increasing, gap-free within the session.
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: Json<EventKind>,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, seq: i64, kind: EventKind) -> Self {
        Self {
            session_id,
            seq,
            ts: Utc::now(),
            kind: kind.kind_str().to_string(),
            payload: Json(kind),
        }
    }

    /// Wire form pushed to subscribers: the tagged payload with the
    /// envelope fields merged in.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.payload.0).unwrap_or_default();
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "session_id".to_string(),
                serde_json::Value::String(self.session_id.to_string()),
            );
            object.insert("seq".to_string(), serde_json::Value::from(self.seq));
            object.insert(
                "ts".to_string(),
                serde_json::Value::String(self.ts.to_rfc3339()),
            );
        }
        value
    }

    /// Digest of the payload, used to check persisted results against
    /// streamed events.
    pub fn payload_hash(&self) -> String {
        let serialized = serde_json::to_vec(&self.payload.0).unwrap_or_default();
        hex::encode(Sha256::digest(serialized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_carries_envelope_fields() {
        let session_id = SessionId::new();
        let event = SessionEvent::new(session_id, 7, EventKind::SessionCompleted);

        let wire = event.to_wire();
        assert_eq!(wire["kind"], "session_completed");
        assert_eq!(wire["seq"], 7);
        assert_eq!(wire["session_id"], session_id.to_string());
        assert!(wire["ts"].is_string());
    }

    #[test]
    fn payload_hash_is_stable() {
        let session_id = SessionId::new();
        let a = SessionEvent::new(session_id, 1, EventKind::SessionCompleted);
        let b = SessionEvent::new(session_id, 2, EventKind::SessionCompleted);
        assert_eq!(a.payload_hash(), b.payload_hash());
    }
}
