// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Business logic (what to prompt for, how to fall back) lives in the
// pipeline stage executors that consume these traits.
//
// Naming convention: Base* for trait names (e.g., BaseTranslator)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Provider error taxonomy
// =============================================================================

/// Classified provider failure. The task runtime decides retry behavior from
/// the variant, so adapters must classify rather than stringify.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network blip, 5xx, timeout. Retried with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// 429. Retried with a longer delay.
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// 4xx other than 429, malformed response. Not retried.
    #[error("permanent provider failure: {0}")]
    Permanent(String),

    /// Circuit open or provider disabled by configuration.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Classify an HTTP status + body into a provider error.
    pub fn from_status(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        let body = body.into();
        if status.as_u16() == 429 {
            ProviderError::RateLimited(format!("{}: {}", status, body))
        } else if status.is_server_error() {
            ProviderError::Transient(format!("{}: {}", status, body))
        } else {
            ProviderError::Permanent(format!("{}: {}", status, body))
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return ProviderError::from_status(status, e.to_string());
        }
        // Connect/timeout/body errors without a status are transport-level.
        ProviderError::Transient(e.to_string())
    }
}

// =============================================================================
// Provider result types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Four corners of a recognized region, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub corners: [Point; 4],
}

/// One recognized text token with its spatial region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    #[serde(rename = "box")]
    pub bounds: BoundingBox,
}

/// Output of the text extraction provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedText {
    pub full_text: String,
    pub tokens: Vec<OcrToken>,
}

/// One menu entry inside a category, as named by the categorizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

/// One menu category with its ordered entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuCategory {
    pub name: String,
    pub items: Vec<MenuEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Translation {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_lang: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Description {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllergenEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likelihood: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllergenReport {
    pub entries: Vec<AllergenEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientReport {
    pub ingredients: Vec<IngredientEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Which path produced an item image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOrigin {
    Search,
    Generated,
}

#[derive(Debug, Clone)]
pub enum ImageContent {
    Url(String),
    Bytes { data: Vec<u8>, content_type: String },
}

#[derive(Debug, Clone)]
pub struct FoundImage {
    pub content: ImageContent,
    pub origin: ImageOrigin,
    pub attribution: Option<String>,
}

// =============================================================================
// Capability traits
// =============================================================================

/// OCR over an uploaded menu photo.
#[async_trait]
pub trait BaseTextExtractor: Send + Sync {
    async fn extract(&self, image: &[u8]) -> Result<ExtractedText, ProviderError>;
}

/// Groups raw menu text into categories of named entries.
#[async_trait]
pub trait BaseCategorizer: Send + Sync {
    async fn categorize(&self, full_text: &str) -> Result<Vec<MenuCategory>, ProviderError>;
}

/// Translates one menu item name.
#[async_trait]
pub trait BaseTranslator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<Translation, ProviderError>;
}

/// Produces a short natural-language description of a dish.
#[async_trait]
pub trait BaseDescriber: Send + Sync {
    async fn describe(&self, name: &str, category: &str) -> Result<Description, ProviderError>;
}

#[async_trait]
pub trait BaseAllergenDetector: Send + Sync {
    async fn detect(&self, name: &str, category: &str) -> Result<AllergenReport, ProviderError>;
}

#[async_trait]
pub trait BaseIngredientDetector: Send + Sync {
    async fn detect(&self, name: &str, category: &str) -> Result<IngredientReport, ProviderError>;
}

/// Finds or synthesizes a representative image for a dish.
#[async_trait]
pub trait BaseImageFinder: Send + Sync {
    async fn find(
        &self,
        name: &str,
        category: &str,
        description: Option<&str>,
    ) -> Result<FoundImage, ProviderError>;
}

/// Object storage for uploaded photos and fetched/synthesized item images.
#[async_trait]
pub trait BaseImageStore: Send + Sync {
    /// Store bytes under a key, returning the reference handed to clients.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> anyhow::Result<String>;

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

// =============================================================================
// Disabled provider (config-driven off switch)
// =============================================================================

/// Stand-in for a provider disabled by configuration. Every call reports
/// `Unavailable`, which stage executors treat as "fall back or fail".
pub struct DisabledProvider(pub &'static str);

impl DisabledProvider {
    fn unavailable(&self) -> ProviderError {
        ProviderError::Unavailable(format!("{} provider disabled", self.0))
    }
}

#[async_trait]
impl BaseTextExtractor for DisabledProvider {
    async fn extract(&self, _image: &[u8]) -> Result<ExtractedText, ProviderError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl BaseCategorizer for DisabledProvider {
    async fn categorize(&self, _full_text: &str) -> Result<Vec<MenuCategory>, ProviderError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl BaseTranslator for DisabledProvider {
    async fn translate(
        &self,
        _text: &str,
        _target_lang: &str,
    ) -> Result<Translation, ProviderError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl BaseDescriber for DisabledProvider {
    async fn describe(&self, _name: &str, _category: &str) -> Result<Description, ProviderError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl BaseAllergenDetector for DisabledProvider {
    async fn detect(&self, _name: &str, _category: &str) -> Result<AllergenReport, ProviderError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl BaseIngredientDetector for DisabledProvider {
    async fn detect(
        &self,
        _name: &str,
        _category: &str,
    ) -> Result<IngredientReport, ProviderError> {
        Err(self.unavailable())
    }
}

#[async_trait]
impl BaseImageFinder for DisabledProvider {
    async fn find(
        &self,
        _name: &str,
        _category: &str,
        _description: Option<&str>,
    ) -> Result<FoundImage, ProviderError> {
        Err(self.unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = ProviderError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(e, ProviderError::RateLimited(_)));

        let e = ProviderError::from_status(reqwest::StatusCode::BAD_GATEWAY, "upstream");
        assert!(matches!(e, ProviderError::Transient(_)));

        let e = ProviderError::from_status(reqwest::StatusCode::BAD_REQUEST, "bad image");
        assert!(matches!(e, ProviderError::Permanent(_)));
        assert!(!e.is_retryable());
    }

    #[tokio::test]
    async fn disabled_provider_reports_unavailable() {
        let provider = DisabledProvider("translate");
        let err = provider.translate("ブレンド", "en").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[test]
    fn ocr_token_serializes_box_field() {
        let token = OcrToken {
            text: "ブレンド".to_string(),
            bounds: BoundingBox {
                corners: [
                    Point { x: 0.0, y: 0.0 },
                    Point { x: 10.0, y: 0.0 },
                    Point { x: 10.0, y: 4.0 },
                    Point { x: 0.0, y: 4.0 },
                ],
            },
        };
        let json = serde_json::to_value(&token).unwrap();
        assert!(json.get("box").is_some());
    }
}
