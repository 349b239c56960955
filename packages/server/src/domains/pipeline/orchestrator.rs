//! Pipeline orchestrator: the per-session state machine.
//!
//! The orchestrator is event-driven and holds no locks across provider
//! calls. Executors call back into it after each committed transition:
//! extract completion enqueues categorize, categorize fans out the per-item
//! stages, and every terminal item-stage write triggers an idempotent
//! completion check. All session state lives in the store, so any process
//! can pick up any callback.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::gates::SessionGates;
use crate::common::SessionId;
use crate::domains::sessions::events::EventKind;
use crate::domains::sessions::models::{ItemStage, Session, SessionEvent, SessionStatus};
use crate::domains::sessions::session_topic;
use crate::domains::sessions::store::{StageTransition, StageWrite};
use crate::kernel::deps::ServerDeps;
use crate::kernel::tasks::Task;

pub const OCR_QUEUE: &str = "ocr";
pub const CATEGORIZE_QUEUE: &str = "categorize";

pub struct Orchestrator {
    deps: Arc<ServerDeps>,
    gates: SessionGates,
}

impl Orchestrator {
    pub fn new(deps: Arc<ServerDeps>) -> Arc<Self> {
        Arc::new(Self {
            deps,
            gates: SessionGates::new(),
        })
    }

    pub fn deps(&self) -> &Arc<ServerDeps> {
        &self.deps
    }

    pub fn gates(&self) -> &SessionGates {
        &self.gates
    }

    /// Push a committed event to live subscribers. Best-effort: the durable
    /// log covers replay, so a fan-out failure is logged, not propagated.
    pub async fn publish(&self, event: &SessionEvent) {
        let topic = session_topic(event.session_id);
        if let Err(e) = self.deps.fanout.publish(&topic, event.to_wire()).await {
            warn!(session_id = %event.session_id, seq = event.seq, error = %e, "event fan-out failed");
        }
    }

    /// Store the uploaded photo, create the session, and enqueue extract.
    pub async fn start_session(&self, image: &[u8], content_type: &str) -> Result<Session> {
        let extension = match content_type {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        };
        let digest = hex::encode(Sha256::digest(image));
        let key = format!("uploads/{digest}.{extension}");

        self.deps
            .image_store
            .put(&key, image, content_type)
            .await
            .context("failed to store uploaded image")?;

        let (session, event) = self.deps.store.create_session(&key).await?;
        self.publish(&event).await;

        let settings = self.deps.config.pipeline.stage(OCR_QUEUE);
        self.deps
            .queue
            .enqueue(vec![
                Task::for_session(session.id, OCR_QUEUE).with_max_attempts(settings.max_attempts)
            ])
            .await?;

        info!(session_id = %session.id, "session started");
        Ok(session)
    }

    /// Extract persisted its output; schedule categorize.
    pub async fn after_extract_completed(&self, id: SessionId) -> Result<()> {
        let settings = self.deps.config.pipeline.stage(CATEGORIZE_QUEUE);
        self.deps
            .queue
            .enqueue(vec![
                Task::for_session(id, CATEGORIZE_QUEUE).with_max_attempts(settings.max_attempts)
            ])
            .await?;
        Ok(())
    }

    /// Fan out per-item stage tasks for every still-pending (item, stage)
    /// pair, in chunks of the stage's configured size. Safe to re-run:
    /// duplicate tasks converge through the store's conditional writes.
    pub async fn fan_out(&self, id: SessionId) -> Result<()> {
        let Some(session) = self.deps.store.get_session(id).await? else {
            return Ok(());
        };
        if session.is_terminal() {
            return Ok(());
        }

        let items = self.deps.store.list_items(id).await?;
        if items.is_empty() {
            // Zero-item menus complete immediately.
            return self.check_completion(id).await;
        }

        for stage in ItemStage::ALL {
            let settings = self.deps.config.pipeline.stage(stage.queue());
            let pending: Vec<i32> = items
                .iter()
                .filter(|item| !item.stage_status(stage).is_terminal())
                .map(|item| item.item_index)
                .collect();

            for chunk in pending.chunks(settings.chunk_size.max(1)) {
                let tasks = chunk
                    .iter()
                    .map(|index| {
                        Task::for_item(id, *index, stage.queue())
                            .with_max_attempts(settings.max_attempts)
                    })
                    .collect();
                self.deps.queue.enqueue(tasks).await?;
            }
        }

        debug!(session_id = %id, items = items.len(), "fanned out per-item stages");
        Ok(())
    }

    /// Called after every terminal item-stage write.
    pub async fn after_item_stage_terminal(&self, id: SessionId, stage: ItemStage) {
        if stage == ItemStage::Translate {
            // Image tasks waiting on translate can go now.
            if let Err(e) = self.deps.queue.promote(id, ItemStage::Image.queue()).await {
                warn!(session_id = %id, error = %e, "failed to promote image tasks");
            }
        }

        if let Err(e) = self.check_completion(id).await {
            error!(session_id = %id, error = %e, "completion check failed");
        }
    }

    /// Idempotent: re-reads item states and completes the session once
    /// every stage of every item is terminal. The store's terminal-status
    /// guard makes `session_completed` emit-once.
    pub async fn check_completion(&self, id: SessionId) -> Result<()> {
        let Some(session) = self.deps.store.get_session(id).await? else {
            return Ok(());
        };
        if session.is_terminal() || session.total_items.is_none() {
            return Ok(());
        }

        let items = self.deps.store.list_items(id).await?;
        if !items.iter().all(|item| item.all_stages_terminal()) {
            return Ok(());
        }

        if let Some(event) = self
            .deps
            .store
            .update_session_status(id, SessionStatus::Completed, None, EventKind::SessionCompleted)
            .await?
        {
            info!(session_id = %id, "session completed");
            self.publish(&event).await;
            self.gates.release_session(id);
        }
        Ok(())
    }

    /// Scaffold failure or watchdog timeout: the whole session fails.
    pub async fn fail_session(&self, id: SessionId, reason: &str) {
        let event = self
            .deps
            .store
            .update_session_status(
                id,
                SessionStatus::Failed,
                Some(reason),
                EventKind::SessionFailed {
                    reason: reason.to_string(),
                },
            )
            .await;

        match event {
            Ok(Some(event)) => {
                warn!(session_id = %id, reason = reason, "session failed");
                self.publish(&event).await;
                self.settle_after_terminal(id).await;
            }
            Ok(None) => {}
            Err(e) => error!(session_id = %id, error = %e, "failed to mark session as failed"),
        }
    }

    /// Client-requested cancellation. Returns false when the session was
    /// already terminal.
    pub async fn cancel_session(&self, id: SessionId, reason: &str) -> Result<bool> {
        let event = self
            .deps
            .store
            .update_session_status(
                id,
                SessionStatus::Failed,
                Some(reason),
                EventKind::SessionCancelled {
                    reason: reason.to_string(),
                },
            )
            .await?;

        match event {
            Some(event) => {
                info!(session_id = %id, "session cancelled");
                self.publish(&event).await;
                self.settle_after_terminal(id).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// After a terminal status write: drop queued work and resolve every
    /// still-open stage to `skipped` so item states are terminal too.
    async fn settle_after_terminal(&self, id: SessionId) {
        if let Err(e) = self.deps.queue.cancel_pending(id).await {
            warn!(session_id = %id, error = %e, "failed to cancel pending tasks");
        }

        match self.deps.store.list_items(id).await {
            Ok(items) => {
                for item in items {
                    for stage in ItemStage::ALL {
                        if item.stage_status(stage).is_terminal() {
                            continue;
                        }
                        if let Err(e) = self
                            .deps
                            .store
                            .update_item_stage(
                                id,
                                item.item_index,
                                stage,
                                StageTransition::Skipped,
                            )
                            .await
                        {
                            warn!(
                                session_id = %id,
                                item_index = item.item_index,
                                stage = %stage,
                                error = %e,
                                "failed to skip stage"
                            );
                        }
                    }
                }
            }
            Err(e) => warn!(session_id = %id, error = %e, "failed to list items for settling"),
        }

        self.gates.release_session(id);
    }

    /// Watchdog sweep: force-fail sessions that exceeded the session
    /// timeout.
    pub async fn fail_timed_out_sessions(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::seconds(self.deps.config.session.timeout_seconds);
        let ids = self.deps.store.find_timed_out_sessions(cutoff).await?;
        let count = ids.len() as u64;
        for id in ids {
            self.fail_session(id, "session_timeout").await;
        }
        Ok(count)
    }

    /// Mark an item stage skipped if the write still applies (used by
    /// executors observing a cancelled session mid-flight).
    pub async fn skip_item_stage(&self, id: SessionId, item_index: i32, stage: ItemStage) {
        match self
            .deps
            .store
            .update_item_stage(id, item_index, stage, StageTransition::Skipped)
            .await
        {
            Ok(StageWrite::Applied(_)) | Ok(StageWrite::Stale) => {}
            Err(e) => {
                warn!(session_id = %id, item_index, stage = %stage, error = %e, "failed to skip stage");
            }
        }
    }
}
