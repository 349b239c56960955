//! OCR client for the Vision `images:annotate` API.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::rate_limit::ProviderGuard;
use super::traits::{
    BaseTextExtractor, BoundingBox, ExtractedText, OcrToken, Point, ProviderError,
};

const ANNOTATE_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Vision API client for text extraction from menu photos.
pub struct VisionClient {
    api_key: String,
    client: reqwest::Client,
    guard: ProviderGuard,
}

#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateEntry>,
}

#[derive(Debug, Serialize)]
struct AnnotateEntry {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    responses: Vec<AnnotateResult>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotateResult {
    #[serde(rename = "textAnnotations", default)]
    text_annotations: Vec<TextAnnotation>,
    #[serde(rename = "fullTextAnnotation")]
    full_text: Option<FullTextAnnotation>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    description: String,
    #[serde(rename = "boundingPoly")]
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

#[derive(Debug, Deserialize)]
struct FullTextAnnotation {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl VisionClient {
    pub fn new(api_key: String, rps: f32) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            api_key,
            client,
            guard: ProviderGuard::new("vision", rps, Duration::from_secs(20)),
        })
    }

    fn token_from_annotation(annotation: TextAnnotation) -> Option<OcrToken> {
        let vertices = annotation.bounding_poly?.vertices;
        if vertices.len() != 4 {
            return None;
        }
        let corner = |v: Vertex| Point { x: v.x, y: v.y };
        Some(OcrToken {
            text: annotation.description,
            bounds: BoundingBox {
                corners: [
                    corner(vertices[0]),
                    corner(vertices[1]),
                    corner(vertices[2]),
                    corner(vertices[3]),
                ],
            },
        })
    }
}

#[async_trait]
impl BaseTextExtractor for VisionClient {
    async fn extract(&self, image: &[u8]) -> Result<ExtractedText, ProviderError> {
        let request = AnnotateRequest {
            requests: vec![AnnotateEntry {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(image),
                },
                features: vec![Feature {
                    kind: "TEXT_DETECTION",
                }],
            }],
        };

        self.guard
            .call(async {
                let response = self
                    .client
                    .post(ANNOTATE_URL)
                    .query(&[("key", self.api_key.as_str())])
                    .json(&request)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(status, body));
                }

                let parsed: AnnotateResponse = response.json().await.map_err(|e| {
                    ProviderError::Permanent(format!("malformed annotate response: {e}"))
                })?;

                let result = parsed.responses.into_iter().next().unwrap_or_default();
                if let Some(error) = result.error {
                    return Err(ProviderError::Permanent(error.message));
                }

                let mut annotations = result.text_annotations.into_iter();
                // The first annotation is the whole detected block; the rest
                // are individual tokens.
                let block = annotations.next();
                let full_text = result
                    .full_text
                    .map(|f| f.text)
                    .or_else(|| block.map(|b| b.description))
                    .unwrap_or_default();

                let tokens = annotations
                    .filter_map(Self::token_from_annotation)
                    .collect();

                Ok(ExtractedText { full_text, tokens })
            })
            .await
    }
}
