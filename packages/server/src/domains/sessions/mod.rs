//! Session domain: the durable session/item/event data model and its store.

pub mod events;
pub mod models;
pub mod store;

use crate::common::SessionId;

/// Fan-out topic for a session's live events.
pub fn session_topic(id: SessionId) -> String {
    format!("sessions.{id}.events")
}
