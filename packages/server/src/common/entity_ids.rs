//! Typed ID definitions for domain entities.

pub use super::id::{Id, V4, V7};

/// Marker type for pipeline sessions (one per uploaded menu photo).
pub struct Session;

/// Marker type for queued tasks.
pub struct Task;

/// Session ids are URL-safe opaque identifiers handed to clients.
pub type SessionId = Id<Session>;

/// Task ids are random; ordering comes from `run_at`, not the id.
pub type TaskId = Id<Task, V4>;
