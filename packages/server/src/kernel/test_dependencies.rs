// TestDependencies - in-memory implementations for testing
//
// Provides in-memory store/queue/fan-out implementations and scripted
// providers that can be injected into ServerDeps for tests. The in-memory
// store honors the same guard semantics as the Postgres store (write-once
// completed stages, sticky terminal statuses, gap-free sequences).

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::common::{SessionId, TaskId};
use crate::config::Config;
use crate::domains::sessions::events::{EventKind, ItemSkeleton, StagePayload};
use crate::domains::sessions::models::{
    ItemStage, MenuItem, NewMenuItem, Session, SessionEvent, SessionStatus, StageStatus,
};
use crate::domains::sessions::store::{SessionStore, StageTransition, StageWrite};
use crate::kernel::deps::ServerDeps;
use crate::kernel::fanout::{EventFanout, HubFanout};
use crate::kernel::tasks::{FailureOutcome, Task, TaskErrorKind, TaskQueue, TaskStatus};
use crate::kernel::traits::{
    AllergenEntry, AllergenReport, BaseAllergenDetector, BaseCategorizer, BaseDescriber,
    BaseImageFinder, BaseImageStore, BaseIngredientDetector, BaseTextExtractor, BaseTranslator,
    BoundingBox, Description, ExtractedText, FoundImage, ImageContent, ImageOrigin,
    IngredientEntry, IngredientReport, MenuCategory, MenuEntry, OcrToken, Point, ProviderError,
    Translation,
};

// =============================================================================
// In-memory session store
// =============================================================================

struct SessionRecord {
    session: Session,
    items: BTreeMap<i32, MenuItem>,
    events: Vec<SessionEvent>,
}

#[derive(Default)]
pub struct MemSessionStore {
    inner: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_event(record: &mut SessionRecord, kind: EventKind) -> SessionEvent {
        record.session.last_seq += 1;
        record.session.updated_at = Utc::now();
        let event = SessionEvent::new(record.session.id, record.session.last_seq, kind);
        record.events.push(event.clone());
        event
    }

    fn apply_payload(item: &mut MenuItem, payload: &StagePayload) {
        match payload {
            StagePayload::Translate { english_text, .. } => {
                item.english_text = Some(english_text.clone());
            }
            StagePayload::Describe { description, .. } => {
                item.description = Some(description.clone());
            }
            StagePayload::Allergens { entries, .. } => {
                item.allergens = Some(Json(entries.clone()));
            }
            StagePayload::Ingredients { ingredients, .. } => {
                item.ingredients = Some(Json(ingredients.clone()));
            }
            StagePayload::Image { image_ref, .. } => {
                item.image_ref = Some(image_ref.clone());
            }
        }
    }
}

#[async_trait]
impl SessionStore for MemSessionStore {
    async fn create_session(&self, image_key: &str) -> Result<(Session, SessionEvent)> {
        let mut inner = self.inner.lock().await;
        let mut record = SessionRecord {
            session: Session::new(image_key),
            items: BTreeMap::new(),
            events: Vec::new(),
        };
        let event = Self::push_event(&mut record, EventKind::SessionCreated);
        let session = record.session.clone();
        inner.insert(session.id, record);
        Ok((session, event))
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        let inner = self.inner.lock().await;
        Ok(inner.get(&id).map(|r| r.session.clone()))
    }

    async fn list_items(&self, id: SessionId) -> Result<Vec<MenuItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&id)
            .map(|r| r.items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_item(&self, id: SessionId, item_index: i32) -> Result<Option<MenuItem>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&id)
            .and_then(|r| r.items.get(&item_index).cloned()))
    }

    async fn read_events(
        &self,
        id: SessionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<SessionEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&id)
            .map(|r| {
                r.events
                    .iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_event(&self, id: SessionId, kind: EventKind) -> Result<SessionEvent> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            bail!("session {id} not found");
        };
        Ok(Self::push_event(record, kind))
    }

    async fn set_extract_result(
        &self,
        id: SessionId,
        extracted: &ExtractedText,
    ) -> Result<SessionEvent> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            bail!("session {id} not found");
        };
        record.session.full_text = Some(extracted.full_text.clone());
        record.session.tokens = Some(Json(extracted.tokens.clone()));
        Ok(Self::push_event(
            record,
            EventKind::ExtractCompleted {
                tokens: extracted.tokens.clone(),
                full_text: extracted.full_text.clone(),
            },
        ))
    }

    async fn materialize_items(
        &self,
        id: SessionId,
        items: &[NewMenuItem],
    ) -> Result<Option<SessionEvent>> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            bail!("session {id} not found");
        };
        if record.session.total_items.is_some() {
            return Ok(None);
        }

        record.session.total_items = Some(items.len() as i32);
        record.session.materialized_at = Some(Utc::now());
        for item in items {
            record
                .items
                .insert(item.item_index, MenuItem::new(id, item));
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

        Ok(Some(Self::push_event(
            record,
            EventKind::ItemsMaterialized {
                total_items: items.len() as i32,
                items: skeletons,
            },
        )))
    }

    async fn update_item_stage(
        &self,
        id: SessionId,
        item_index: i32,
        stage: ItemStage,
        transition: StageTransition,
    ) -> Result<StageWrite> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            bail!("session {id} not found");
        };
        let Some(item) = record.items.get_mut(&item_index) else {
            bail!("item ({id}, {item_index}) not found");
        };

        if item.stage_status(stage).is_terminal() {
            return Ok(StageWrite::Stale);
        }

        let event_kind = match &transition {
            StageTransition::InFlight { attempt } => {
                item.set_stage(stage, StageStatus::InFlight);
                item.set_stage_attempt(stage, *attempt);
                Some(EventKind::StageInFlight { item_index, stage })
            }
            StageTransition::Completed { payload } => {
                item.set_stage(stage, StageStatus::Completed);
                item.set_stage_error(stage, None);
                Self::apply_payload(item, payload);
                Some(EventKind::StageCompleted {
                    item_index,
                    payload: payload.clone(),
                })
            }
            StageTransition::Failed { error, attempt } => {
                item.set_stage(stage, StageStatus::Failed);
                item.set_stage_error(stage, Some(error.clone()));
                item.set_stage_attempt(stage, *attempt);
                Some(EventKind::StageFailed {
                    item_index,
                    stage,
                    error: error.clone(),
                    attempt: *attempt,
                })
            }
            StageTransition::Skipped => {
                item.set_stage(stage, StageStatus::Skipped);
                None
            }
        };

        let event = event_kind.map(|kind| Self::push_event(record, kind));
        Ok(StageWrite::Applied(event))
    }

    async fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        reason: Option<&str>,
        event: EventKind,
    ) -> Result<Option<SessionEvent>> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.get_mut(&id) else {
            bail!("session {id} not found");
        };
        if record.session.status.is_terminal() {
            return Ok(None);
        }
        record.session.status = status;
        record.session.failure_reason = reason.map(|r| r.to_string());
        Ok(Some(Self::push_event(record, event)))
    }

    async fn count_active_sessions(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .values()
            .filter(|r| r.session.status == SessionStatus::Processing)
            .count() as i64)
    }

    async fn find_timed_out_sessions(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<SessionId>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .values()
            .filter(|r| {
                r.session.status == SessionStatus::Processing
                    && r.session.created_at < started_before
            })
            .map(|r| r.session.id)
            .collect())
    }

    async fn delete_expired_sessions(&self, terminal_before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|_, r| {
            !(r.session.status.is_terminal() && r.session.updated_at < terminal_before)
        });
        Ok((before - inner.len()) as u64)
    }
}

// =============================================================================
// In-memory task queue
// =============================================================================

pub struct MemTaskQueue {
    tasks: Mutex<Vec<Task>>,
    lease_ms: i64,
}

impl MemTaskQueue {
    pub fn new(lease_ms: i64) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            lease_ms,
        }
    }

    /// Snapshot for assertions.
    pub async fn all_tasks(&self) -> Vec<Task> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl TaskQueue for MemTaskQueue {
    async fn enqueue(&self, new_tasks: Vec<Task>) -> Result<()> {
        self.tasks.lock().await.extend(new_tasks);
        Ok(())
    }

    async fn claim(&self, queue: &str, worker_id: &str, limit: i64) -> Result<Vec<Task>> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        let mut ready: Vec<&mut Task> = tasks
            .iter_mut()
            .filter(|t| {
                t.queue == queue
                    && ((t.status == TaskStatus::Pending
                        && t.run_at.map(|at| at <= now).unwrap_or(true))
                        || (t.status == TaskStatus::Running
                            && t.lease_expires_at.map(|at| at < now).unwrap_or(false)))
            })
            .collect();
        ready.sort_by_key(|t| (t.run_at.unwrap_or(t.created_at), *t.id.as_uuid()));

        let mut claimed = Vec::new();
        for task in ready.into_iter().take(limit.max(0) as usize) {
            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.to_string());
            task.lease_expires_at = Some(now + Duration::milliseconds(self.lease_ms));
            task.updated_at = now;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Succeeded;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: TaskId,
        error: &str,
        kind: TaskErrorKind,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<FailureOutcome> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            bail!("task {id} not found");
        };

        if kind.should_retry() && task.attempt < task.max_attempts && retry_at.is_some() {
            task.status = TaskStatus::Pending;
            task.attempt += 1;
            task.run_at = retry_at;
            task.lease_expires_at = None;
            task.worker_id = None;
            task.error_message = Some(error.to_string());
            task.error_kind = Some(kind);
            task.updated_at = Utc::now();
            return Ok(FailureOutcome::Retrying {
                attempt: task.attempt,
            });
        }

        task.status = if kind == TaskErrorKind::Permanent {
            TaskStatus::Failed
        } else {
            TaskStatus::DeadLetter
        };
        task.error_message = Some(error.to_string());
        task.error_kind = Some(kind);
        task.updated_at = Utc::now();
        Ok(FailureOutcome::Exhausted)
    }

    async fn defer(&self, id: TaskId, run_at: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Pending;
            task.run_at = Some(run_at);
            task.lease_expires_at = None;
            task.worker_id = None;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_cancelled(&self, id: TaskId) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Cancelled;
            task.error_kind = Some(TaskErrorKind::Cancelled);
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn promote(&self, session_id: SessionId, queue: &str) -> Result<u64> {
        let mut tasks = self.tasks.lock().await;
        let now = Utc::now();
        let mut promoted = 0;
        for task in tasks.iter_mut() {
            if task.session_id == session_id
                && task.queue == queue
                && task.status == TaskStatus::Pending
                && task.run_at.map(|at| at > now).unwrap_or(false)
            {
                task.run_at = Some(now);
                task.updated_at = now;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn cancel_pending(&self, session_id: SessionId) -> Result<u64> {
        let mut tasks = self.tasks.lock().await;
        let mut cancelled = 0;
        for task in tasks.iter_mut() {
            if task.session_id == session_id && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                task.error_kind = Some(TaskErrorKind::Cancelled);
                task.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

// =============================================================================
// Scripted provider plumbing
// =============================================================================

/// Fixed result with an optional run of leading failures.
pub struct Scripted<T> {
    result: Option<T>,
    remaining_failures: AtomicU32,
    error: ProviderError,
    pub calls: AtomicU32,
}

impl<T: Clone> Scripted<T> {
    pub fn ok(value: T) -> Self {
        Self {
            result: Some(value),
            remaining_failures: AtomicU32::new(0),
            error: ProviderError::Transient("unused".to_string()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn fail_n_then_ok(failures: u32, error: ProviderError, value: T) -> Self {
        Self {
            result: Some(value),
            remaining_failures: AtomicU32::new(failures),
            error,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_fail(error: ProviderError) -> Self {
        Self {
            result: None,
            remaining_failures: AtomicU32::new(0),
            error,
            calls: AtomicU32::new(0),
        }
    }

    fn invoke(&self) -> Result<T, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(self.error.clone());
        }
        match &self.result {
            Some(value) => Ok(value.clone()),
            None => Err(self.error.clone()),
        }
    }
}

// =============================================================================
// Mock providers
// =============================================================================

pub fn sample_token(text: &str) -> OcrToken {
    OcrToken {
        text: text.to_string(),
        bounds: BoundingBox {
            corners: [
                Point { x: 10.0, y: 10.0 },
                Point { x: 90.0, y: 10.0 },
                Point { x: 90.0, y: 30.0 },
                Point { x: 10.0, y: 30.0 },
            ],
        },
    }
}

pub struct MockExtractor(pub Scripted<ExtractedText>);

#[async_trait]
impl BaseTextExtractor for MockExtractor {
    async fn extract(&self, _image: &[u8]) -> Result<ExtractedText, ProviderError> {
        self.0.invoke()
    }
}

pub struct MockCategorizer(pub Scripted<Vec<MenuCategory>>);

#[async_trait]
impl BaseCategorizer for MockCategorizer {
    async fn categorize(&self, _full_text: &str) -> Result<Vec<MenuCategory>, ProviderError> {
        self.0.invoke()
    }
}

/// Translator with a tiny built-in dictionary.
pub struct MockTranslator {
    failure: Option<ProviderError>,
    pub calls: AtomicU32,
}

impl MockTranslator {
    pub fn ok() -> Self {
        Self {
            failure: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            failure: Some(error),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BaseTranslator for MockTranslator {
    async fn translate(&self, text: &str, _target_lang: &str) -> Result<Translation, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let translated = match text {
            "ブレンド" => "Blend".to_string(),
            "カフェラテ" => "Cafe Latte".to_string(),
            "トースト" => "Toast".to_string(),
            other => format!("{other} (en)"),
        };
        Ok(Translation {
            text: translated,
            detected_lang: Some("ja".to_string()),
        })
    }
}

pub struct MockDescriber;

#[async_trait]
impl BaseDescriber for MockDescriber {
    async fn describe(&self, name: &str, _category: &str) -> Result<Description, ProviderError> {
        Ok(Description {
            text: format!("A classic Japanese menu item: {name}."),
        })
    }
}

pub struct MockAllergenDetector(pub Scripted<AllergenReport>);

impl MockAllergenDetector {
    pub fn with_wheat() -> Self {
        Self(Scripted::ok(AllergenReport {
            entries: vec![AllergenEntry {
                name: "wheat".to_string(),
                severity: Some("moderate".to_string()),
                likelihood: Some("likely".to_string()),
                source: Some("soy sauce".to_string()),
            }],
            confidence: Some(0.8),
        }))
    }
}

#[async_trait]
impl BaseAllergenDetector for MockAllergenDetector {
    async fn detect(&self, _name: &str, _category: &str) -> Result<AllergenReport, ProviderError> {
        self.0.invoke()
    }
}

pub struct MockIngredientDetector(pub Scripted<IngredientReport>);

impl MockIngredientDetector {
    pub fn with_coffee() -> Self {
        Self(Scripted::ok(IngredientReport {
            ingredients: vec![IngredientEntry {
                name: "coffee beans".to_string(),
                role: Some("main".to_string()),
            }],
            confidence: Some(0.9),
        }))
    }
}

#[async_trait]
impl BaseIngredientDetector for MockIngredientDetector {
    async fn detect(
        &self,
        _name: &str,
        _category: &str,
    ) -> Result<IngredientReport, ProviderError> {
        self.0.invoke()
    }
}

pub struct MockImageFinder(pub Scripted<FoundImage>);

impl MockImageFinder {
    pub fn url() -> Self {
        Self(Scripted::ok(FoundImage {
            content: ImageContent::Url("https://images.example/blend.jpg".to_string()),
            origin: ImageOrigin::Search,
            attribution: Some("Example Photographer".to_string()),
        }))
    }

    pub fn generated_bytes() -> Self {
        Self(Scripted::ok(FoundImage {
            content: ImageContent::Bytes {
                data: vec![0x89, 0x50, 0x4e, 0x47],
                content_type: "image/png".to_string(),
            },
            origin: ImageOrigin::Generated,
            attribution: None,
        }))
    }
}

#[async_trait]
impl BaseImageFinder for MockImageFinder {
    async fn find(
        &self,
        _name: &str,
        _category: &str,
        _description: Option<&str>,
    ) -> Result<FoundImage, ProviderError> {
        self.0.invoke()
    }
}

#[derive(Default)]
pub struct MemImageStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BaseImageStore for MemImageStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no object at {key}"))
    }
}

// =============================================================================
// Test deps assembly
// =============================================================================

/// Configuration tuned for fast test loops.
pub fn test_config() -> Config {
    let mut config = Config {
        database_url: String::new(),
        nats_url: None,
        port: 0,
        data_dir: ".".to_string(),
        anthropic_api_key: None,
        vision_api_key: None,
        translate_api_key: None,
        image_search_api_key: None,
        openai_api_key: None,
        pipeline: Default::default(),
        providers: Default::default(),
        session: Default::default(),
        stream: Default::default(),
        upload: Default::default(),
    };
    config.pipeline.worker.poll_interval_ms = 5;
    config.pipeline.worker.lease_ms = 2_000;
    config.pipeline.retry.base_ms = 2;
    config.pipeline.retry.cap_ms = 20;
    config.pipeline.retry.rate_limited_base_ms = 2;
    config.pipeline.image_wait_for_translate_ms = 500;
    config
}

/// Assembled in-memory dependencies plus direct handles for assertions.
pub struct TestDeps {
    pub deps: Arc<ServerDeps>,
    pub queue: Arc<MemTaskQueue>,
}

pub struct TestDepsBuilder {
    config: Config,
    extractor: Arc<dyn BaseTextExtractor>,
    categorizer: Arc<dyn BaseCategorizer>,
    translator: Arc<dyn BaseTranslator>,
    translator_fallback: Option<Arc<dyn BaseTranslator>>,
    describer: Arc<dyn BaseDescriber>,
    allergen_detector: Arc<dyn BaseAllergenDetector>,
    ingredient_detector: Arc<dyn BaseIngredientDetector>,
    image_finder: Arc<dyn BaseImageFinder>,
}

impl TestDepsBuilder {
    /// Defaults model the 1-item happy path: a single `ブレンド ¥400` menu.
    pub fn new() -> Self {
        Self {
            config: test_config(),
            extractor: Arc::new(MockExtractor(Scripted::ok(ExtractedText {
                full_text: "ブレンド ¥400".to_string(),
                tokens: vec![sample_token("ブレンド")],
            }))),
            categorizer: Arc::new(MockCategorizer(Scripted::ok(vec![MenuCategory {
                name: "Drinks".to_string(),
                items: vec![MenuEntry {
                    name: "ブレンド".to_string(),
                    price: Some("¥400".to_string()),
                }],
            }]))),
            translator: Arc::new(MockTranslator::ok()),
            translator_fallback: None,
            describer: Arc::new(MockDescriber),
            allergen_detector: Arc::new(MockAllergenDetector::with_wheat()),
            ingredient_detector: Arc::new(MockIngredientDetector::with_coffee()),
            image_finder: Arc::new(MockImageFinder::url()),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn BaseTextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn categorizer(mut self, categorizer: Arc<dyn BaseCategorizer>) -> Self {
        self.categorizer = categorizer;
        self
    }

    pub fn translator(mut self, translator: Arc<dyn BaseTranslator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn translator_fallback(mut self, translator: Arc<dyn BaseTranslator>) -> Self {
        self.translator_fallback = Some(translator);
        self
    }

    pub fn image_finder(mut self, image_finder: Arc<dyn BaseImageFinder>) -> Self {
        self.image_finder = image_finder;
        self
    }

    pub fn build(self) -> TestDeps {
        let lease_ms = self.config.pipeline.worker.lease_ms;
        let queue = Arc::new(MemTaskQueue::new(lease_ms));
        let deps = Arc::new(ServerDeps {
            config: self.config,
            store: Arc::new(MemSessionStore::new()),
            queue: queue.clone(),
            fanout: Arc::new(HubFanout::new()) as Arc<dyn EventFanout>,
            image_store: Arc::new(MemImageStore::new()),
            text_extractor: self.extractor,
            categorizer: self.categorizer,
            translator: self.translator,
            translator_fallback: self.translator_fallback,
            describer: self.describer,
            allergen_detector: self.allergen_detector,
            ingredient_detector: self.ingredient_detector,
            image_finder: self.image_finder,
        });
        TestDeps { deps, queue }
    }
}

impl Default for TestDepsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
