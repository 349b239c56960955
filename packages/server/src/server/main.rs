// Main entry point for the MenuLens API server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::config::Config;
use server_core::domains::pipeline::{build_task_registry, orchestrator::Orchestrator};
use server_core::domains::sessions::store::PgSessionStore;
use server_core::kernel::ai::ClaudeClient;
use server_core::kernel::fanout::{EventFanout, HubFanout, NatsFanout};
use server_core::kernel::image_search_client::ImageClient;
use server_core::kernel::image_store::LocalImageStore;
use server_core::kernel::maintenance;
use server_core::kernel::tasks::{PgTaskQueue, WorkerPool};
use server_core::kernel::translate_client::TranslateClient;
use server_core::kernel::vision_client::VisionClient;
use server_core::kernel::{
    BaseAllergenDetector, BaseCategorizer, BaseDescriber, BaseImageFinder, BaseIngredientDetector,
    BaseTextExtractor, BaseTranslator, DisabledProvider, ServerDeps,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting MenuLens API");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Live fan-out: NATS when configured, in-process hub otherwise.
    let fanout: Arc<dyn EventFanout> = match &config.nats_url {
        Some(url) => {
            tracing::info!(url = %url, "Connecting to NATS");
            Arc::new(
                NatsFanout::connect(url)
                    .await
                    .context("Failed to connect to NATS")?,
            )
        }
        None => {
            tracing::info!("NATS_URL not set, using in-process fan-out");
            Arc::new(HubFanout::new())
        }
    };

    // Provider adapters. Missing keys and disabled flags degrade to the
    // DisabledProvider, which the executors treat as "fall back or fail".
    let providers = &config.providers;

    let text_extractor: Arc<dyn BaseTextExtractor> =
        match (&config.vision_api_key, providers.vision.enabled) {
            (Some(key), true) => Arc::new(VisionClient::new(key.clone(), providers.vision.rps)?),
            _ => Arc::new(DisabledProvider("vision")),
        };

    let translator: Arc<dyn BaseTranslator> =
        match (&config.translate_api_key, providers.translate.enabled) {
            (Some(key), true) => {
                Arc::new(TranslateClient::new(key.clone(), providers.translate.rps)?)
            }
            _ => Arc::new(DisabledProvider("translate")),
        };

    let (categorizer, describer, allergen_detector, ingredient_detector) =
        match (&config.anthropic_api_key, providers.llm.enabled) {
            (Some(key), true) => {
                let claude = Arc::new(ClaudeClient::new(key.clone(), providers.llm.rps));
                (
                    claude.clone() as Arc<dyn BaseCategorizer>,
                    claude.clone() as Arc<dyn BaseDescriber>,
                    claude.clone() as Arc<dyn BaseAllergenDetector>,
                    claude as Arc<dyn BaseIngredientDetector>,
                )
            }
            _ => (
                Arc::new(DisabledProvider("llm")) as Arc<dyn BaseCategorizer>,
                Arc::new(DisabledProvider("llm")) as Arc<dyn BaseDescriber>,
                Arc::new(DisabledProvider("llm")) as Arc<dyn BaseAllergenDetector>,
                Arc::new(DisabledProvider("llm")) as Arc<dyn BaseIngredientDetector>,
            ),
        };

    let image_finder: Arc<dyn BaseImageFinder> =
        if providers.image_search.enabled || providers.image_gen.enabled {
            Arc::new(ImageClient::new(
                config.image_search_api_key.clone(),
                config.openai_api_key.clone(),
                providers.image_search.rps,
                providers.image_gen.rps,
            )?)
        } else {
            Arc::new(DisabledProvider("image"))
        };

    let deps = Arc::new(ServerDeps {
        store: Arc::new(PgSessionStore::new(pool.clone())),
        queue: Arc::new(PgTaskQueue::new(
            pool.clone(),
            config.pipeline.worker.lease_ms,
        )),
        fanout,
        image_store: Arc::new(LocalImageStore::new(&config.data_dir)),
        text_extractor,
        categorizer,
        translator,
        translator_fallback: None,
        describer,
        allergen_detector,
        ingredient_detector,
        image_finder,
        config,
    });

    let orchestrator = Orchestrator::new(deps.clone());

    // Worker pools for every queue.
    let registry = Arc::new(build_task_registry(orchestrator.clone()));
    let shutdown = CancellationToken::new();
    let worker_handles = WorkerPool::new(registry, deps.clone()).spawn(shutdown.clone());
    tracing::info!(workers = worker_handles.len(), "worker pools started");

    // Watchdog + retention sweeper.
    let _scheduler = maintenance::start_scheduler(orchestrator.clone()).await?;

    let app = server_core::server::app::build_app(deps.clone(), orchestrator, Some(pool.clone()));

    let addr = format!("0.0.0.0:{}", deps.config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("Server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("shutdown complete");

    Ok(())
}
