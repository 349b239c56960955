//! Translation client for the Translate v2 API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rate_limit::ProviderGuard;
use super::traits::{BaseTranslator, ProviderError, Translation};

const TRANSLATE_URL: &str = "https://translation.googleapis.com/language/translate/v2";

pub struct TranslateClient {
    api_key: String,
    client: reqwest::Client,
    guard: ProviderGuard,
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: &'a str,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    data: TranslateData,
}

#[derive(Debug, Deserialize)]
struct TranslateData {
    translations: Vec<TranslatedItem>,
}

#[derive(Debug, Deserialize)]
struct TranslatedItem {
    #[serde(rename = "translatedText")]
    translated_text: String,
    #[serde(rename = "detectedSourceLanguage")]
    detected_source_language: Option<String>,
}

impl TranslateClient {
    pub fn new(api_key: String, rps: f32) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            api_key,
            client,
            guard: ProviderGuard::new("translate", rps, Duration::from_secs(10)),
        })
    }
}

#[async_trait]
impl BaseTranslator for TranslateClient {
    async fn translate(&self, text: &str, target_lang: &str) -> Result<Translation, ProviderError> {
        let request = TranslateRequest {
            q: text,
            target: target_lang,
            format: "text",
        };

        self.guard
            .call(async {
                let response = self
                    .client
                    .post(TRANSLATE_URL)
                    .query(&[("key", self.api_key.as_str())])
                    .json(&request)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(status, body));
                }

                let parsed: TranslateResponse = response.json().await.map_err(|e| {
                    ProviderError::Permanent(format!("malformed translate response: {e}"))
                })?;

                let item = parsed.data.translations.into_iter().next().ok_or_else(|| {
                    ProviderError::Permanent("translate response had no translations".to_string())
                })?;

                Ok(Translation {
                    text: item.translated_text,
                    detected_lang: item.detected_source_language,
                })
            })
            .await
    }
}
