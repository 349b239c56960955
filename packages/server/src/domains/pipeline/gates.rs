//! Per-session, per-stage concurrency gates.
//!
//! The queue worker pools cap global concurrency per stage; these gates cap
//! each session's share so one large menu cannot starve other sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::common::SessionId;
use crate::domains::sessions::models::ItemStage;

#[derive(Default)]
pub struct SessionGates {
    inner: Mutex<HashMap<(SessionId, ItemStage), Arc<Semaphore>>>,
}

impl SessionGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a permit. `None` means the session already has
    /// `permits` tasks of this stage in flight; the caller defers.
    pub fn try_acquire(
        &self,
        session: SessionId,
        stage: ItemStage,
        permits: usize,
    ) -> Option<OwnedSemaphorePermit> {
        let semaphore = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner
                .entry((session, stage))
                .or_insert_with(|| Arc::new(Semaphore::new(permits.max(1))))
                .clone()
        };
        semaphore.try_acquire_owned().ok()
    }

    /// Drop a terminal session's gates.
    pub fn release_session(&self, session: SessionId) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.retain(|(s, _), _| *s != session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded_per_session_and_stage() {
        let gates = SessionGates::new();
        let session = SessionId::new();

        let a = gates.try_acquire(session, ItemStage::Image, 2);
        let b = gates.try_acquire(session, ItemStage::Image, 2);
        let c = gates.try_acquire(session, ItemStage::Image, 2);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());

        // A different stage has its own gate.
        assert!(gates.try_acquire(session, ItemStage::Translate, 2).is_some());

        // A different session is unaffected.
        assert!(gates
            .try_acquire(SessionId::new(), ItemStage::Image, 2)
            .is_some());

        drop(a);
        assert!(gates.try_acquire(session, ItemStage::Image, 2).is_some());
    }

    #[test]
    fn release_session_clears_gates() {
        let gates = SessionGates::new();
        let session = SessionId::new();
        let _permit = gates.try_acquire(session, ItemStage::Image, 1);
        assert!(gates.try_acquire(session, ItemStage::Image, 1).is_none());

        gates.release_session(session);
        assert!(gates.try_acquire(session, ItemStage::Image, 1).is_some());
    }
}
