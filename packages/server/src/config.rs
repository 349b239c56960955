//! Application configuration loaded from environment variables.
//!
//! Queue, stage, and provider settings follow the naming scheme
//! `QUEUE_<NAME>_CONCURRENCY`, `STAGE_<NAME>_*`, `PROVIDER_<NAME>_*`.
//! Every key has a default so a bare `DATABASE_URL` is enough to boot.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Live fan-out broker. When unset, events fan out through the
    /// in-process hub only (single-node deployments, tests).
    pub nats_url: Option<String>,
    pub port: u16,
    /// Root directory for the local image store.
    pub data_dir: String,
    pub anthropic_api_key: Option<String>,
    pub vision_api_key: Option<String>,
    pub translate_api_key: Option<String>,
    pub image_search_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub pipeline: PipelineSettings,
    pub providers: ProviderSettings,
    pub session: SessionSettings,
    pub stream: StreamSettings,
    pub upload: UploadSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL").ok(),
            port: env_parse("PORT", 8080)?,
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            vision_api_key: env::var("VISION_API_KEY").ok(),
            translate_api_key: env::var("TRANSLATE_API_KEY").ok(),
            image_search_api_key: env::var("IMAGE_SEARCH_API_KEY").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            pipeline: PipelineSettings::from_env()?,
            providers: ProviderSettings::from_env()?,
            session: SessionSettings::from_env()?,
            stream: StreamSettings::from_env()?,
            upload: UploadSettings::from_env()?,
        })
    }
}

/// Settings for one queue/stage pair.
#[derive(Debug, Clone)]
pub struct StageSettings {
    /// Worker pool size for the queue (global concurrency ceiling).
    pub concurrency: usize,
    /// Fan-out granularity: items enqueued per batch.
    pub chunk_size: usize,
    /// Retry ceiling before a task is dead-lettered.
    pub max_attempts: i32,
    /// Per-task timeout (provider call + overhead).
    pub timeout_ms: u64,
    /// Per-session in-flight cap, so one large menu cannot starve others.
    pub session_concurrency: usize,
}

impl StageSettings {
    fn text_stage() -> Self {
        Self {
            concurrency: 4,
            chunk_size: 8,
            max_attempts: 3,
            timeout_ms: 30_000,
            session_concurrency: 4,
        }
    }

    fn image_stage() -> Self {
        Self {
            concurrency: 4,
            chunk_size: 3,
            max_attempts: 3,
            timeout_ms: 60_000,
            session_concurrency: 2,
        }
    }

    fn scaffold_stage() -> Self {
        Self {
            concurrency: 2,
            chunk_size: 1,
            max_attempts: 3,
            timeout_ms: 60_000,
            session_concurrency: 1,
        }
    }

    fn from_env(name: &str, defaults: Self) -> Result<Self> {
        let upper = name.to_uppercase();
        Ok(Self {
            concurrency: env_parse(&format!("QUEUE_{upper}_CONCURRENCY"), defaults.concurrency)?,
            chunk_size: env_parse(&format!("STAGE_{upper}_CHUNK_SIZE"), defaults.chunk_size)?,
            max_attempts: env_parse(&format!("STAGE_{upper}_MAX_ATTEMPTS"), defaults.max_attempts)?,
            timeout_ms: env_parse(&format!("STAGE_{upper}_TIMEOUT_MS"), defaults.timeout_ms)?,
            session_concurrency: env_parse(
                &format!("STAGE_{upper}_SESSION_CONCURRENCY"),
                defaults.session_concurrency,
            )?,
        })
    }
}

/// Worker loop settings shared by all queues.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Sleep between empty claim attempts.
    pub poll_interval_ms: u64,
    /// Visibility timeout: a crashed worker's task is reclaimed after this.
    pub lease_ms: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            lease_ms: 60_000,
        }
    }
}

/// Retry backoff settings (exponential, base 2, ±30 % jitter).
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Longer base delay for rate-limited failures.
    pub rate_limited_base_ms: u64,
    /// Whether rate-limited failures consume the attempt budget.
    pub rate_limit_counts_attempts: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 60_000,
            rate_limited_base_ms: 5_000,
            rate_limit_counts_attempts: false,
        }
    }
}

/// Per-stage and runtime settings for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ocr: StageSettings,
    pub categorize: StageSettings,
    pub translate: StageSettings,
    pub describe: StageSettings,
    pub allergens: StageSettings,
    pub ingredients: StageSettings,
    pub image: StageSettings,
    /// How long the image stage waits for translate before proceeding with
    /// the source text.
    pub image_wait_for_translate_ms: u64,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ocr: StageSettings::scaffold_stage(),
            categorize: StageSettings::scaffold_stage(),
            translate: StageSettings::text_stage(),
            describe: StageSettings::text_stage(),
            allergens: StageSettings::text_stage(),
            ingredients: StageSettings::text_stage(),
            image: StageSettings::image_stage(),
            image_wait_for_translate_ms: 20_000,
            worker: WorkerSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            ocr: StageSettings::from_env("ocr", defaults.ocr)?,
            categorize: StageSettings::from_env("categorize", defaults.categorize)?,
            translate: StageSettings::from_env("translate", defaults.translate)?,
            describe: StageSettings::from_env("describe", defaults.describe)?,
            allergens: StageSettings::from_env("allergens", defaults.allergens)?,
            ingredients: StageSettings::from_env("ingredients", defaults.ingredients)?,
            image: StageSettings::from_env("image", defaults.image)?,
            image_wait_for_translate_ms: env_parse(
                "STAGE_IMAGE_WAIT_FOR_TRANSLATE_MS",
                defaults.image_wait_for_translate_ms,
            )?,
            worker: WorkerSettings {
                poll_interval_ms: env_parse(
                    "WORKER_POLL_INTERVAL_MS",
                    defaults.worker.poll_interval_ms,
                )?,
                lease_ms: env_parse("WORKER_LEASE_MS", defaults.worker.lease_ms)?,
            },
            retry: RetrySettings {
                base_ms: env_parse("RETRY_BASE_MS", defaults.retry.base_ms)?,
                cap_ms: env_parse("RETRY_CAP_MS", defaults.retry.cap_ms)?,
                rate_limited_base_ms: env_parse(
                    "RETRY_RATE_LIMITED_BASE_MS",
                    defaults.retry.rate_limited_base_ms,
                )?,
                rate_limit_counts_attempts: env_parse(
                    "RETRY_RATE_LIMIT_COUNTS_ATTEMPTS",
                    defaults.retry.rate_limit_counts_attempts,
                )?,
            },
        })
    }

    /// Look up settings by queue name.
    pub fn stage(&self, queue: &str) -> &StageSettings {
        match queue {
            "ocr" => &self.ocr,
            "categorize" => &self.categorize,
            "translate" => &self.translate,
            "describe" => &self.describe,
            "allergens" => &self.allergens,
            "ingredients" => &self.ingredients,
            "image" => &self.image,
            _ => &self.translate,
        }
    }
}

/// Rate-limit capacity and enable flag for one external provider.
#[derive(Debug, Clone)]
pub struct ProviderLimit {
    pub enabled: bool,
    /// Token-bucket refill rate, requests per second.
    pub rps: f32,
}

impl ProviderLimit {
    fn new(rps: f32) -> Self {
        Self { enabled: true, rps }
    }

    fn from_env(name: &str, defaults: Self) -> Result<Self> {
        let upper = name.to_uppercase();
        Ok(Self {
            enabled: env_parse(&format!("PROVIDER_{upper}_ENABLED"), defaults.enabled)?,
            rps: env_parse(&format!("PROVIDER_{upper}_RPS"), defaults.rps)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub vision: ProviderLimit,
    pub translate: ProviderLimit,
    pub llm: ProviderLimit,
    pub image_search: ProviderLimit,
    pub image_gen: ProviderLimit,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            vision: ProviderLimit::new(5.0),
            translate: ProviderLimit::new(10.0),
            llm: ProviderLimit::new(2.0),
            image_search: ProviderLimit::new(5.0),
            image_gen: ProviderLimit::new(0.5),
        }
    }
}

impl ProviderSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            vision: ProviderLimit::from_env("vision", defaults.vision)?,
            translate: ProviderLimit::from_env("translate", defaults.translate)?,
            llm: ProviderLimit::from_env("llm", defaults.llm)?,
            image_search: ProviderLimit::from_env("image_search", defaults.image_search)?,
            image_gen: ProviderLimit::from_env("image_gen", defaults.image_gen)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long terminal sessions remain queryable.
    pub retention_seconds: i64,
    /// Cap on items after categorize; exceeding fails the session.
    pub max_items: i32,
    /// Upper bound on a session's total processing time.
    pub timeout_seconds: i64,
    /// Active-session capacity gate for uploads (503 when full).
    pub max_active: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retention_seconds: 86_400,
            max_items: 100,
            timeout_seconds: 1_800,
            max_active: 64,
        }
    }
}

impl SessionSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            retention_seconds: env_parse("SESSION_RETENTION_SECONDS", defaults.retention_seconds)?,
            max_items: env_parse("SESSION_MAX_ITEMS", defaults.max_items)?,
            timeout_seconds: env_parse("SESSION_TIMEOUT_SECONDS", defaults.timeout_seconds)?,
            max_active: env_parse("SESSION_MAX_ACTIVE", defaults.max_active)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Idle keepalive interval on the event stream.
    pub heartbeat_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_ms: 15_000,
        }
    }
}

impl StreamSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            heartbeat_ms: env_parse("STREAM_HEARTBEAT_MS", defaults.heartbeat_ms)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_bytes: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl UploadSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_bytes: env_parse("UPLOAD_MAX_BYTES", defaults.max_bytes)?,
        })
    }
}

/// Parse an optional environment variable, falling back to a default.
///
/// A set-but-unparseable value is an error, not a silent fallback.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has invalid value {:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_defaults() {
        let pipeline = PipelineSettings::default();
        assert_eq!(pipeline.translate.chunk_size, 8);
        assert_eq!(pipeline.image.chunk_size, 3);
        assert_eq!(pipeline.translate.max_attempts, 3);
    }

    #[test]
    fn stage_lookup_by_queue_name() {
        let pipeline = PipelineSettings::default();
        assert_eq!(pipeline.stage("image").chunk_size, 3);
        assert_eq!(pipeline.stage("describe").chunk_size, 8);
        assert_eq!(pipeline.stage("ocr").chunk_size, 1);
    }

    #[test]
    fn env_parse_prefers_default_when_unset() {
        let value: u64 = env_parse("MENULENS_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("MENULENS_TEST_GARBAGE_KEY", "not-a-number");
        let result: Result<u64> = env_parse("MENULENS_TEST_GARBAGE_KEY", 1);
        assert!(result.is_err());
        std::env::remove_var("MENULENS_TEST_GARBAGE_KEY");
    }

    #[test]
    fn session_defaults() {
        let session = SessionSettings::default();
        assert_eq!(session.retention_seconds, 86_400);
        assert_eq!(session.timeout_seconds, 1_800);
    }
}
