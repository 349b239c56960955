//! Representative-image lookup: stock photo search first, image synthesis
//! as the fallback. Records which path produced the result.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rate_limit::ProviderGuard;
use super::traits::{BaseImageFinder, FoundImage, ImageContent, ImageOrigin, ProviderError};

const SEARCH_URL: &str = "https://api.unsplash.com/search/photos";
const GENERATE_URL: &str = "https://api.openai.com/v1/images/generations";

/// Image provider with an internal search → synthesis fallback chain.
pub struct ImageClient {
    search_key: Option<String>,
    generate_key: Option<String>,
    client: reqwest::Client,
    search_guard: ProviderGuard,
    generate_guard: ProviderGuard,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    urls: SearchUrls,
    user: Option<SearchUser>,
}

#[derive(Debug, Deserialize)]
struct SearchUrls {
    regular: String,
}

#[derive(Debug, Deserialize)]
struct SearchUser {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'static str,
    prompt: &'a str,
    n: u8,
    size: &'static str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    b64_json: String,
}

impl ImageClient {
    pub fn new(
        search_key: Option<String>,
        generate_key: Option<String>,
        search_rps: f32,
        generate_rps: f32,
    ) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            search_key,
            generate_key,
            client,
            search_guard: ProviderGuard::new("image_search", search_rps, Duration::from_secs(15)),
            generate_guard: ProviderGuard::new("image_gen", generate_rps, Duration::from_secs(50)),
        })
    }

    async fn search(&self, query: &str) -> Result<Option<FoundImage>, ProviderError> {
        let Some(key) = &self.search_key else {
            return Err(ProviderError::Unavailable(
                "image search key not configured".to_string(),
            ));
        };

        self.search_guard
            .call(async {
                let response = self
                    .client
                    .get(SEARCH_URL)
                    .header("Authorization", format!("Client-ID {key}"))
                    .query(&[("query", query), ("per_page", "1")])
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(status, body));
                }

                let parsed: SearchResponse = response.json().await.map_err(|e| {
                    ProviderError::Permanent(format!("malformed search response: {e}"))
                })?;

                Ok(parsed.results.into_iter().next().map(|hit| FoundImage {
                    content: ImageContent::Url(hit.urls.regular),
                    origin: ImageOrigin::Search,
                    attribution: hit.user.and_then(|u| u.name),
                }))
            })
            .await
    }

    async fn generate(&self, prompt: &str) -> Result<FoundImage, ProviderError> {
        let Some(key) = &self.generate_key else {
            return Err(ProviderError::Unavailable(
                "image generation key not configured".to_string(),
            ));
        };

        let request = GenerateRequest {
            model: "dall-e-3",
            prompt,
            n: 1,
            size: "1024x1024",
            response_format: "b64_json",
        };

        self.generate_guard
            .call(async {
                let response = self
                    .client
                    .post(GENERATE_URL)
                    .bearer_auth(key)
                    .json(&request)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(status, body));
                }

                let parsed: GenerateResponse = response.json().await.map_err(|e| {
                    ProviderError::Permanent(format!("malformed generation response: {e}"))
                })?;

                let image = parsed.data.into_iter().next().ok_or_else(|| {
                    ProviderError::Permanent("generation response had no images".to_string())
                })?;

                let data = base64::engine::general_purpose::STANDARD
                    .decode(image.b64_json)
                    .map_err(|e| {
                        ProviderError::Permanent(format!("generated image was not base64: {e}"))
                    })?;

                Ok(FoundImage {
                    content: ImageContent::Bytes {
                        data,
                        content_type: "image/png".to_string(),
                    },
                    origin: ImageOrigin::Generated,
                    attribution: None,
                })
            })
            .await
    }
}

#[async_trait]
impl BaseImageFinder for ImageClient {
    async fn find(
        &self,
        name: &str,
        category: &str,
        description: Option<&str>,
    ) -> Result<FoundImage, ProviderError> {
        let query = format!("{name} {category} japanese food");

        match self.search(&query).await {
            Ok(Some(image)) => return Ok(image),
            Ok(None) => {
                tracing::debug!(query = %query, "image search returned no results, generating");
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "image search unavailable, generating");
            }
        }

        let prompt = match description {
            Some(desc) => format!("Appetizing food photograph of {name} ({category}): {desc}"),
            None => format!("Appetizing food photograph of the Japanese dish {name} ({category})"),
        };
        self.generate(&prompt).await
    }
}
