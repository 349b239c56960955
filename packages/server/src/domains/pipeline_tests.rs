//! End-to-end pipeline tests over in-memory dependencies.
//!
//! Each test runs the real orchestrator, registry, and worker pools against
//! the in-memory store/queue/fan-out and scripted providers, then asserts
//! on the terminal snapshot and the full event log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::SessionId;
use crate::domains::pipeline::{build_task_registry, orchestrator::Orchestrator};
use crate::domains::sessions::events::{EventKind, StagePayload};
use crate::domains::sessions::models::{
    ItemStage, Session, SessionEvent, SessionStatus, StageStatus,
};
use crate::kernel::deps::ServerDeps;
use crate::kernel::tasks::{Task, TaskStatus, WorkerPool};
use crate::kernel::test_dependencies::{
    sample_token, test_config, MemTaskQueue, MockCategorizer, MockExtractor, MockTranslator,
    Scripted, TestDeps, TestDepsBuilder,
};
use crate::kernel::traits::{
    BaseImageFinder, DisabledProvider, ExtractedText, FoundImage, ImageContent, ImageOrigin,
    MenuCategory, MenuEntry, ProviderError,
};

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46];

struct Harness {
    deps: Arc<ServerDeps>,
    queue: Arc<MemTaskQueue>,
    orch: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl Harness {
    fn start(test_deps: TestDeps) -> Self {
        let TestDeps { deps, queue } = test_deps;
        let orch = Orchestrator::new(deps.clone());
        let registry = Arc::new(build_task_registry(orch.clone()));
        let shutdown = CancellationToken::new();
        WorkerPool::new(registry, deps.clone()).spawn(shutdown.clone());
        Self {
            deps,
            queue,
            orch,
            shutdown,
        }
    }

    async fn upload(&self) -> SessionId {
        self.orch
            .start_session(JPEG, "image/jpeg")
            .await
            .expect("session should start")
            .id
    }

    async fn session(&self, id: SessionId) -> Session {
        self.deps
            .store
            .get_session(id)
            .await
            .expect("store should answer")
            .expect("session should exist")
    }

    async fn events(&self, id: SessionId) -> Vec<SessionEvent> {
        self.deps
            .store
            .read_events(id, 0, 100_000)
            .await
            .expect("events should read")
    }

    async fn wait_terminal(&self, id: SessionId) -> Session {
        let reached = wait_for(Duration::from_secs(10), || async move {
            self.session(id).await.is_terminal()
        })
        .await;
        assert!(reached, "session never reached a terminal state");
        self.session(id).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn wait_for<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn kinds(events: &[SessionEvent]) -> Vec<&str> {
    events.iter().map(|e| e.kind.as_str()).collect()
}

fn count_kind(events: &[SessionEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

/// Whole-log invariants: gap-free strictly-increasing seqs, and
/// per-(item, stage) monotonic transitions.
fn assert_event_log_invariants(events: &[SessionEvent], last_seq: i64) {
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<i64> = (1..=last_seq).collect();
    assert_eq!(seqs, expected, "event log must be gap-free and ordered");

    for event in events {
        if let EventKind::StageCompleted {
            item_index,
            payload,
        } = &event.payload.0
        {
            let stage = payload.stage();
            let in_flight_before = events.iter().any(|e| {
                e.seq < event.seq
                    && matches!(&e.payload.0, EventKind::StageInFlight { item_index: i, stage: s }
                        if i == item_index && *s == stage)
            });
            assert!(
                in_flight_before,
                "stage_completed({item_index}, {stage}) without prior stage_in_flight"
            );
        }
    }
}

fn completed_stage_events(events: &[SessionEvent], stage: ItemStage) -> Vec<(i32, StagePayload)> {
    events
        .iter()
        .filter_map(|e| match &e.payload.0 {
            EventKind::StageCompleted {
                item_index,
                payload,
            } if payload.stage() == stage => Some((*item_index, payload.clone())),
            _ => None,
        })
        .collect()
}

fn three_item_menu() -> (MockExtractor, MockCategorizer) {
    let extractor = MockExtractor(Scripted::ok(ExtractedText {
        full_text: "ブレンド ¥400\nカフェラテ ¥500\nトースト ¥300".to_string(),
        tokens: vec![
            sample_token("ブレンド"),
            sample_token("カフェラテ"),
            sample_token("トースト"),
        ],
    }));
    let categorizer = MockCategorizer(Scripted::ok(vec![
        MenuCategory {
            name: "Drinks".to_string(),
            items: vec![
                MenuEntry {
                    name: "ブレンド".to_string(),
                    price: Some("¥400".to_string()),
                },
                MenuEntry {
                    name: "カフェラテ".to_string(),
                    price: Some("¥500".to_string()),
                },
            ],
        },
        MenuCategory {
            name: "Food".to_string(),
            items: vec![MenuEntry {
                name: "トースト".to_string(),
                price: Some("¥300".to_string()),
            }],
        },
    ]));
    (extractor, categorizer)
}

struct SlowImageFinder(Duration);

#[async_trait]
impl BaseImageFinder for SlowImageFinder {
    async fn find(
        &self,
        _name: &str,
        _category: &str,
        _description: Option<&str>,
    ) -> Result<FoundImage, ProviderError> {
        tokio::time::sleep(self.0).await;
        Ok(FoundImage {
            content: ImageContent::Url("https://images.example/slow.jpg".to_string()),
            origin: ImageOrigin::Search,
            attribution: None,
        })
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn happy_path_single_item_menu() {
    let harness = Harness::start(TestDepsBuilder::new().build());
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_items, Some(1));

    let items = harness.deps.store.list_items(id).await.unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.source_text, "ブレンド");
    assert_eq!(item.price.as_deref(), Some("¥400"));
    assert_eq!(item.category, "Drinks");
    assert_eq!(item.english_text.as_deref(), Some("Blend"));
    assert!(item.description.as_deref().is_some_and(|d| !d.is_empty()));
    assert!(item.allergens.is_some());
    assert!(item.image_ref.is_some());
    assert!(item.bounds.is_some());
    assert!(item.all_stages_terminal());

    let events = harness.events(id).await;
    let session = harness.session(id).await;
    assert!(session.last_seq >= 12, "expected a rich log, got {}", session.last_seq);
    assert_event_log_invariants(&events, session.last_seq);

    let kinds = kinds(&events);
    assert_eq!(kinds[0], "session_created");
    assert!(kinds.contains(&"extract_completed"));
    assert!(kinds.contains(&"categorize_completed"));
    assert!(kinds.contains(&"items_materialized"));
    assert_eq!(*kinds.last().unwrap(), "session_completed");
    assert_eq!(count_kind(&events, "session_completed"), 1);

    // Exactly one completion per (item, stage).
    for stage in ItemStage::ALL {
        assert_eq!(
            completed_stage_events(&events, stage).len(),
            1,
            "expected exactly one stage_completed for {stage}"
        );
    }
}

#[tokio::test]
async fn disabled_translator_falls_back_to_identity() {
    let (extractor, categorizer) = three_item_menu();
    let deps = TestDepsBuilder::new()
        .extractor(Arc::new(extractor))
        .categorizer(Arc::new(categorizer))
        .translator(Arc::new(DisabledProvider("translate")))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_items, Some(3));

    let items = harness.deps.store.list_items(id).await.unwrap();
    for item in &items {
        // Identity fallback: English text echoes the source.
        assert_eq!(item.english_text.as_deref(), Some(item.source_text.as_str()));
        assert_eq!(item.translate_status, StageStatus::Completed);
    }

    let events = harness.events(id).await;
    let translations = completed_stage_events(&events, ItemStage::Translate);
    assert_eq!(translations.len(), 3);
    for (_, payload) in translations {
        let StagePayload::Translate { fallback_used, .. } = payload else {
            panic!("wrong payload kind");
        };
        assert!(fallback_used, "identity fallback must set fallback_used");
    }
}

#[tokio::test]
async fn cancellation_skips_open_stages_and_never_completes() {
    let deps = TestDepsBuilder::new()
        .image_finder(Arc::new(SlowImageFinder(Duration::from_millis(400))))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    // Let the fan-out happen, then cancel while image work is in flight.
    let h = &harness;
    let materialized = wait_for(Duration::from_secs(5), || async move {
        h.session(id).await.total_items.is_some()
    })
    .await;
    assert!(materialized);

    assert!(harness
        .orch
        .cancel_session(id, "client request")
        .await
        .unwrap());

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Failed);

    // Give in-flight executors a beat to hit their next checkpoint.
    let settled = wait_for(Duration::from_secs(5), || async move {
        let items = h.deps.store.list_items(id).await.unwrap();
        items.iter().all(|item| item.all_stages_terminal())
    })
    .await;
    assert!(settled, "all stages must reach a terminal status");

    let items = harness.deps.store.list_items(id).await.unwrap();
    assert_eq!(items[0].image_status, StageStatus::Skipped);

    let events = harness.events(id).await;
    assert_eq!(count_kind(&events, "session_cancelled"), 1);
    assert_eq!(count_kind(&events, "session_completed"), 0);
}

#[tokio::test]
async fn duplicate_task_delivery_completes_stage_once() {
    let harness = Harness::start(TestDepsBuilder::new().build());
    let id = harness.upload().await;
    harness.wait_terminal(id).await;

    // Redeliver a describe task for the already-finished item.
    harness
        .deps
        .queue
        .enqueue(vec![Task::for_item(id, 0, ItemStage::Describe.queue())])
        .await
        .unwrap();

    let h = &harness;
    let drained = wait_for(Duration::from_secs(5), || async move {
        h.queue
            .all_tasks()
            .await
            .iter()
            .filter(|t| t.queue == ItemStage::Describe.queue())
            .all(|t| t.status == TaskStatus::Succeeded)
    })
    .await;
    assert!(drained, "duplicate task should be acked");

    let events = harness.events(id).await;
    assert_eq!(
        completed_stage_events(&events, ItemStage::Describe).len(),
        1,
        "duplicate delivery must not complete a stage twice"
    );
    assert!(count_kind(&events, "stage_skipped_duplicate") >= 1);
}

#[tokio::test]
async fn zero_item_menu_completes_immediately() {
    let deps = TestDepsBuilder::new()
        .categorizer(Arc::new(MockCategorizer(Scripted::ok(vec![]))))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_items, Some(0));

    let events = harness.events(id).await;
    assert_event_log_invariants(&events, harness.session(id).await.last_seq);
    assert!(!kinds(&events).iter().any(|k| k.starts_with("stage_")));
}

#[tokio::test]
async fn too_many_items_fails_the_session() {
    let (extractor, categorizer) = three_item_menu();
    let mut config = test_config();
    config.session.max_items = 2;
    let deps = TestDepsBuilder::new()
        .config(config)
        .extractor(Arc::new(extractor))
        .categorizer(Arc::new(categorizer))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("too_many_items"));

    let events = harness.events(id).await;
    assert_eq!(count_kind(&events, "session_failed"), 1);
    assert_eq!(count_kind(&events, "items_materialized"), 0);
    let failed = events
        .iter()
        .find(|e| e.kind == "session_failed")
        .expect("session_failed event");
    let EventKind::SessionFailed { reason } = &failed.payload.0 else {
        panic!("wrong payload");
    };
    assert_eq!(reason, "too_many_items");
}

#[tokio::test]
async fn extract_exhaustion_fails_the_session_before_fan_out() {
    let deps = TestDepsBuilder::new()
        .extractor(Arc::new(MockExtractor(Scripted::always_fail(
            ProviderError::Transient("ocr offline".to_string()),
        ))))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("extract_failed"));

    let events = harness.events(id).await;
    assert_eq!(count_kind(&events, "extract_failed"), 1);
    assert_eq!(count_kind(&events, "session_failed"), 1);

    // No per-item work was ever dispatched.
    let tasks = harness.queue.all_tasks().await;
    assert!(tasks.iter().all(|t| t.queue == "ocr"));
}

#[tokio::test]
async fn transient_extract_failures_retry_to_success() {
    let deps = TestDepsBuilder::new()
        .extractor(Arc::new(MockExtractor(Scripted::fail_n_then_ok(
            2,
            ProviderError::Transient("blip".to_string()),
            ExtractedText {
                full_text: "ブレンド ¥400".to_string(),
                tokens: vec![sample_token("ブレンド")],
            },
        ))))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Completed);

    let events = harness.events(id).await;
    assert_eq!(count_kind(&events, "extract_completed"), 1);
    // One in-flight marker per attempt.
    assert_eq!(count_kind(&events, "extract_in_flight"), 3);
}

#[tokio::test]
async fn persistent_rate_limiting_fails_the_stage_not_the_session() {
    let deps = TestDepsBuilder::new()
        .translator(Arc::new(MockTranslator::failing(ProviderError::RateLimited(
            "429".to_string(),
        ))))
        .build();
    let harness = Harness::start(deps);
    let id = harness.upload().await;

    let session = harness.wait_terminal(id).await;
    assert_eq!(session.status, SessionStatus::Completed);

    let items = harness.deps.store.list_items(id).await.unwrap();
    assert_eq!(items[0].translate_status, StageStatus::Failed);
    assert!(items[0].translate_error.is_some());

    let events = harness.events(id).await;
    assert!(events.iter().any(|e| matches!(
        &e.payload.0,
        EventKind::StageFailed { stage: ItemStage::Translate, .. }
    )));
}

#[tokio::test]
async fn image_stage_runs_after_translate_when_translate_is_fast_enough() {
    let harness = Harness::start(TestDepsBuilder::new().build());
    let id = harness.upload().await;

    harness.wait_terminal(id).await;
    let events = harness.events(id).await;

    let translate_seq = events
        .iter()
        .find(|e| {
            matches!(&e.payload.0, EventKind::StageCompleted { payload, .. }
                if payload.stage() == ItemStage::Translate)
        })
        .map(|e| e.seq)
        .expect("translate completed");
    let image_seq = events
        .iter()
        .find(|e| {
            matches!(&e.payload.0, EventKind::StageCompleted { payload, .. }
                if payload.stage() == ItemStage::Image)
        })
        .map(|e| e.seq)
        .expect("image completed");

    assert!(
        translate_seq < image_seq,
        "image must wait for translate when translate finishes within the budget"
    );
}

#[tokio::test]
async fn replay_reconstructs_final_snapshot() {
    let harness = Harness::start(TestDepsBuilder::new().build());
    let id = harness.upload().await;
    harness.wait_terminal(id).await;

    let events = harness.events(id).await;

    // Fold the event log into the client's view of the item.
    let mut english: Option<String> = None;
    let mut image_ref: Option<String> = None;
    let mut completed = false;
    for event in &events {
        match &event.payload.0 {
            EventKind::StageCompleted { payload, .. } => match payload {
                StagePayload::Translate { english_text, .. } => {
                    english = Some(english_text.clone());
                }
                StagePayload::Image { image_ref: r, .. } => image_ref = Some(r.clone()),
                _ => {}
            },
            EventKind::SessionCompleted => completed = true,
            _ => {}
        }
    }

    let items = harness.deps.store.list_items(id).await.unwrap();
    assert!(completed);
    assert_eq!(english.as_deref(), items[0].english_text.as_deref());
    assert_eq!(image_ref.as_deref(), items[0].image_ref.as_deref());
}
