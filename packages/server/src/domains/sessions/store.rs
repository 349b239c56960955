//! Session store: the only shared mutable state in the system.
//!
//! Every state transition that has a client-visible event is one atomic
//! unit: the row mutation, the sequence allocation, and the event insert
//! commit together or not at all. Subscribers therefore never observe an
//! event whose state is not yet readable.
//!
//! Stage transitions carry guard clauses so concurrent retries converge:
//! a second `completed` write for the same (item, stage) is a detected
//! no-op (`StageWrite::Stale`), not a double write.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use super::events::{EventKind, ItemSkeleton, StagePayload};
use super::models::{
    ItemStage, MenuItem, NewMenuItem, Session, SessionEvent, SessionStatus, StageStatus,
};
use crate::common::SessionId;
use crate::kernel::traits::ExtractedText;

/// A requested item-stage transition.
#[derive(Debug, Clone)]
pub enum StageTransition {
    InFlight { attempt: i32 },
    Completed { payload: StagePayload },
    Failed { error: String, attempt: i32 },
    Skipped,
}

/// Result of an item-stage write.
#[derive(Debug)]
pub enum StageWrite {
    /// The transition was applied. `Skipped` transitions carry no event.
    Applied(Option<SessionEvent>),
    /// The stage was already terminal; nothing was written.
    Stale,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session and its `session_created` event (seq 1).
    async fn create_session(&self, image_key: &str) -> Result<(Session, SessionEvent)>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>>;

    async fn list_items(&self, id: SessionId) -> Result<Vec<MenuItem>>;

    async fn get_item(&self, id: SessionId, item_index: i32) -> Result<Option<MenuItem>>;

    async fn read_events(
        &self,
        id: SessionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<SessionEvent>>;

    /// Append a standalone event (in-flight markers, failures without a
    /// state write of their own).
    async fn append_event(&self, id: SessionId, kind: EventKind) -> Result<SessionEvent>;

    /// Persist extract output and its `extract_completed` event.
    async fn set_extract_result(
        &self,
        id: SessionId,
        extracted: &ExtractedText,
    ) -> Result<SessionEvent>;

    /// Insert the item set, set `total_items`, and append
    /// `items_materialized`. Returns `None` when items were already
    /// materialized (duplicate categorize execution).
    async fn materialize_items(
        &self,
        id: SessionId,
        items: &[NewMenuItem],
    ) -> Result<Option<SessionEvent>>;

    async fn update_item_stage(
        &self,
        id: SessionId,
        item_index: i32,
        stage: ItemStage,
        transition: StageTransition,
    ) -> Result<StageWrite>;

    /// Move the session to a (usually terminal) status and append the given
    /// event atomically. Returns `None` when the session was already
    /// terminal, making terminal transitions emit-once.
    async fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        reason: Option<&str>,
        event: EventKind,
    ) -> Result<Option<SessionEvent>>;

    async fn count_active_sessions(&self) -> Result<i64>;

    /// Sessions still processing that started before the cutoff.
    async fn find_timed_out_sessions(&self, started_before: DateTime<Utc>) -> Result<Vec<SessionId>>;

    /// Drop terminal sessions not updated since the cutoff (cascade deletes
    /// items and events). Returns the number of sessions removed.
    async fn delete_expired_sessions(&self, terminal_before: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// PostgreSQL implementation
// =============================================================================

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Allocate the next sequence number under the session's row lock.
    async fn allocate_seq(
        tx: &mut Transaction<'_, Postgres>,
        id: SessionId,
    ) -> Result<i64> {
        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET last_seq = last_seq + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING last_seq
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        match seq {
            Some(seq) => Ok(seq),
            None => bail!("session {id} not found"),
        }
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        id: SessionId,
        seq: i64,
        kind: EventKind,
    ) -> Result<SessionEvent> {
        let event = SessionEvent::new(id, seq, kind);
        sqlx::query(
            r#"
            INSERT INTO session_events (session_id, seq, ts, kind, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.session_id)
        .bind(event.seq)
        .bind(event.ts)
        .bind(&event.kind)
        .bind(&event.payload)
        .execute(&mut **tx)
        .await?;
        Ok(event)
    }
}

const ITEM_COLUMNS: &str = "session_id, item_index, source_text, bounds, category, price, \
     english_text, description, allergens, ingredients, image_ref, \
     translate_status, translate_attempt, translate_error, \
     describe_status, describe_attempt, describe_error, \
     allergens_status, allergens_attempt, allergens_error, \
     ingredients_status, ingredients_attempt, ingredients_error, \
     image_status, image_attempt, image_error, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, status, failure_reason, total_items, last_seq, image_key, \
     full_text, tokens, materialized_at, created_at, updated_at";

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_session(&self, image_key: &str) -> Result<(Session, SessionEvent)> {
        let id = SessionId::new();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, image_key, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(image_key)
        .execute(&mut *tx)
        .await?;

        let seq = Self::allocate_seq(&mut tx, id).await?;
        let event = Self::insert_event(&mut tx, id, seq, EventKind::SessionCreated).await?;

        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((session, event))
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn list_items(&self, id: SessionId) -> Result<Vec<MenuItem>> {
        let items = sqlx::query_as::<_, MenuItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM menu_items WHERE session_id = $1 ORDER BY item_index"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn get_item(&self, id: SessionId, item_index: i32) -> Result<Option<MenuItem>> {
        let item = sqlx::query_as::<_, MenuItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM menu_items WHERE session_id = $1 AND item_index = $2"
        ))
        .bind(id)
        .bind(item_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    async fn read_events(
        &self,
        id: SessionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<SessionEvent>> {
        let events = sqlx::query_as::<_, SessionEvent>(
            r#"
            SELECT session_id, seq, ts, kind, payload
            FROM session_events
            WHERE session_id = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn append_event(&self, id: SessionId, kind: EventKind) -> Result<SessionEvent> {
        let mut tx = self.pool.begin().await?;
        let seq = Self::allocate_seq(&mut tx, id).await?;
        let event = Self::insert_event(&mut tx, id, seq, kind).await?;
        tx.commit().await?;
        Ok(event)
    }

    async fn set_extract_result(
        &self,
        id: SessionId,
        extracted: &ExtractedText,
    ) -> Result<SessionEvent> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE sessions
            SET full_text = $2, tokens = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&extracted.full_text)
        .bind(Json(&extracted.tokens))
        .execute(&mut *tx)
        .await?;

        let seq = Self::allocate_seq(&mut tx, id).await?;
        let event = Self::insert_event(
            &mut tx,
            id,
            seq,
            EventKind::ExtractCompleted {
                tokens: extracted.tokens.clone(),
                full_text: extracted.full_text.clone(),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn materialize_items(
        &self,
        id: SessionId,
        items: &[NewMenuItem],
    ) -> Result<Option<SessionEvent>> {
        let mut tx = self.pool.begin().await?;

        // total_items is write-once; a duplicate categorize run is a no-op.
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET total_items = $2, materialized_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND total_items IS NULL
            RETURNING last_seq
            "#,
        )
        .bind(id)
        .bind(items.len() as i32)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            return Ok(None);
        }

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO menu_items (session_id, item_index, source_text, bounds,
                                        category, price, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
                "#,
            )
            .bind(id)
            .bind(item.item_index)
            .bind(&item.source_text)
            .bind(item.bounds.map(Json))
            .bind(&item.category)
            .bind(&item.price)
            .execute(&mut *tx)
            .await?;
        }

        let skeletons = items
            .iter()
            .map(|item| ItemSkeleton {
                index: item.item_index,
                source_text: item.source_text.clone(),
                category: item.category.clone(),
                price: item.price.clone(),
            })
            .collect();

        let seq = Self::allocate_seq(&mut tx, id).await?;
        let event = Self::insert_event(
            &mut tx,
            id,
            seq,
            EventKind::ItemsMaterialized {
                total_items: items.len() as i32,
                items: skeletons,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(Some(event))
    }

    async fn update_item_stage(
        &self,
        id: SessionId,
        item_index: i32,
        stage: ItemStage,
        transition: StageTransition,
    ) -> Result<StageWrite> {
        let col = stage.as_str();
        let mut tx = self.pool.begin().await?;

        let current: Option<StageStatus> = sqlx::query_scalar(&format!(
            r#"
            SELECT {col}_status FROM menu_items
            WHERE session_id = $1 AND item_index = $2
            FOR UPDATE
            "#
        ))
        .bind(id)
        .bind(item_index)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            bail!("item ({id}, {item_index}) not found");
        };

        // Monotonic transitions only: terminal statuses never move again.
        if current.is_terminal() {
            return Ok(StageWrite::Stale);
        }

        let event_kind = match &transition {
            StageTransition::InFlight { attempt } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE menu_items
                    SET {col}_status = 'in_flight', {col}_attempt = $3, updated_at = NOW()
                    WHERE session_id = $1 AND item_index = $2
                    "#
                ))
                .bind(id)
                .bind(item_index)
                .bind(attempt)
                .execute(&mut *tx)
                .await?;

                Some(EventKind::StageInFlight { item_index, stage })
            }
            StageTransition::Completed { payload } => {
                let result_column = match payload {
                    StagePayload::Translate { .. } => "english_text",
                    StagePayload::Describe { .. } => "description",
                    StagePayload::Allergens { .. } => "allergens",
                    StagePayload::Ingredients { .. } => "ingredients",
                    StagePayload::Image { .. } => "image_ref",
                };
                let sql = format!(
                    r#"
                    UPDATE menu_items
                    SET {col}_status = 'completed', {col}_error = NULL,
                        {result_column} = $3, updated_at = NOW()
                    WHERE session_id = $1 AND item_index = $2
                    "#
                );
                let update = sqlx::query(&sql).bind(id).bind(item_index);
                let update = match payload {
                    StagePayload::Translate { english_text, .. } => update.bind(english_text),
                    StagePayload::Describe { description, .. } => update.bind(description),
                    StagePayload::Allergens { entries, .. } => update.bind(Json(entries.clone())),
                    StagePayload::Ingredients { ingredients, .. } => {
                        update.bind(Json(ingredients.clone()))
                    }
                    StagePayload::Image { image_ref, .. } => update.bind(image_ref),
                };
                update.execute(&mut *tx).await?;

                Some(EventKind::StageCompleted {
                    item_index,
                    payload: payload.clone(),
                })
            }
            StageTransition::Failed { error, attempt } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE menu_items
                    SET {col}_status = 'failed', {col}_error = $3, {col}_attempt = $4,
                        updated_at = NOW()
                    WHERE session_id = $1 AND item_index = $2
                    "#
                ))
                .bind(id)
                .bind(item_index)
                .bind(error)
                .bind(attempt)
                .execute(&mut *tx)
                .await?;

                Some(EventKind::StageFailed {
                    item_index,
                    stage,
                    error: error.clone(),
                    attempt: *attempt,
                })
            }
            StageTransition::Skipped => {
                sqlx::query(&format!(
                    r#"
                    UPDATE menu_items
                    SET {col}_status = 'skipped', updated_at = NOW()
                    WHERE session_id = $1 AND item_index = $2
                    "#
                ))
                .bind(id)
                .bind(item_index)
                .execute(&mut *tx)
                .await?;

                None
            }
        };

        let event = match event_kind {
            Some(kind) => {
                let seq = Self::allocate_seq(&mut tx, id).await?;
                Some(Self::insert_event(&mut tx, id, seq, kind).await?)
            }
            None => None,
        };

        tx.commit().await?;
        Ok(StageWrite::Applied(event))
    }

    async fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        reason: Option<&str>,
        event: EventKind,
    ) -> Result<Option<SessionEvent>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<SessionStatus> =
            sqlx::query_scalar("SELECT status FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current) = current else {
            bail!("session {id} not found");
        };

        // Terminal statuses are sticky; the first writer wins.
        if current.is_terminal() {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, failure_reason = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        let seq = Self::allocate_seq(&mut tx, id).await?;
        let event = Self::insert_event(&mut tx, id, seq, event).await?;

        tx.commit().await?;
        Ok(Some(event))
    }

    async fn count_active_sessions(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE status = 'processing'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn find_timed_out_sessions(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SessionId>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM sessions
            WHERE status = 'processing' AND created_at < $1
            "#,
        )
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn delete_expired_sessions(&self, terminal_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE status != 'processing' AND updated_at < $1
            "#,
        )
        .bind(terminal_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
