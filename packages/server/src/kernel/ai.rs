// AI implementation using Anthropic Claude
//
// This is the infrastructure implementation of the LLM-backed menu
// capabilities (categorize, describe, allergens, ingredients). Business
// logic lives in the pipeline stage executors.

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::providers::anthropic;
use serde::Deserialize;
use std::time::Duration;

use super::rate_limit::ProviderGuard;
use super::traits::{
    AllergenEntry, AllergenReport, BaseAllergenDetector, BaseCategorizer, BaseDescriber,
    BaseIngredientDetector, Description, IngredientEntry, IngredientReport, MenuCategory,
    MenuEntry, ProviderError,
};

/// Anthropic Claude implementation of the LLM menu capabilities.
pub struct ClaudeClient {
    client: anthropic::Client,
    guard: ProviderGuard,
}

impl ClaudeClient {
    pub fn new(api_key: String, rps: f32) -> Self {
        let client = anthropic::ClientBuilder::new(&api_key).build();
        Self {
            client,
            guard: ProviderGuard::new("llm", rps, Duration::from_secs(30)),
        }
    }

    async fn prompt(&self, preamble: &str, prompt: String) -> Result<String, ProviderError> {
        self.guard
            .call(async {
                let agent = self
                    .client
                    .agent(anthropic::CLAUDE_3_5_SONNET)
                    .preamble(preamble)
                    .max_tokens(2048)
                    .build();

                agent
                    .prompt(prompt.as_str())
                    .await
                    .map_err(|e| ProviderError::Transient(format!("anthropic call failed: {e}")))
            })
            .await
    }

    async fn prompt_json<T: serde::de::DeserializeOwned>(
        &self,
        preamble: &str,
        prompt: String,
    ) -> Result<T, ProviderError> {
        let raw = self.prompt(preamble, prompt).await?;
        let json = extract_json(&raw);
        serde_json::from_str(json)
            .map_err(|e| ProviderError::Permanent(format!("malformed LLM response: {e}")))
    }
}

/// Strip markdown code fences and surrounding prose from an LLM reply,
/// keeping the outermost JSON value.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    // Fall back to the widest bracketed span when the model added prose.
    let open = inner.find(['{', '[']);
    let close = inner.rfind(['}', ']']);
    match (open, close) {
        (Some(start), Some(end)) if start < end => &inner[start..=end],
        _ => inner,
    }
}

#[derive(Debug, Deserialize)]
struct CategoryRow {
    category: String,
    #[serde(default)]
    items: Vec<CategoryItem>,
}

#[derive(Debug, Deserialize)]
struct CategoryItem {
    name: String,
    #[serde(default)]
    price: Option<String>,
}

#[async_trait]
impl BaseCategorizer for ClaudeClient {
    async fn categorize(&self, full_text: &str) -> Result<Vec<MenuCategory>, ProviderError> {
        let preamble = "You organize OCR text from Japanese restaurant menus. \
            Respond with JSON only: \
            [{\"category\": \"Drinks\", \"items\": [{\"name\": \"ブレンド\", \"price\": \"¥400\"}]}]. \
            Category names are in English; item names keep the original Japanese. \
            Separate the price from the item name when one is present.";

        let rows: Vec<CategoryRow> = self
            .prompt_json(preamble, format!("Menu text:\n{full_text}"))
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| MenuCategory {
                name: row.category,
                items: row
                    .items
                    .into_iter()
                    .map(|item| MenuEntry {
                        name: item.name,
                        price: item.price,
                    })
                    .collect(),
            })
            .collect())
    }
}

#[async_trait]
impl BaseDescriber for ClaudeClient {
    async fn describe(&self, name: &str, category: &str) -> Result<Description, ProviderError> {
        let preamble = "You write one-sentence descriptions of Japanese dishes for \
            foreign visitors. Plain text, no preamble, at most 40 words.";

        let text = self
            .prompt(
                preamble,
                format!("Dish: {name}\nMenu category: {category}"),
            )
            .await?;

        Ok(Description {
            text: text.trim().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AllergenRows {
    #[serde(default)]
    entries: Vec<AllergenEntry>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl BaseAllergenDetector for ClaudeClient {
    async fn detect(&self, name: &str, category: &str) -> Result<AllergenReport, ProviderError> {
        let preamble = "You identify likely allergens in Japanese dishes. \
            Respond with JSON only: {\"entries\": [{\"name\": \"wheat\", \
            \"severity\": \"high\", \"likelihood\": \"likely\", \"source\": \"soy sauce\"}], \
            \"confidence\": 0.8}. An empty entries list is a valid answer.";

        let rows: AllergenRows = self
            .prompt_json(
                preamble,
                format!("Dish: {name}\nMenu category: {category}"),
            )
            .await?;

        Ok(AllergenReport {
            entries: rows.entries,
            confidence: rows.confidence,
        })
    }
}

#[derive(Debug, Deserialize)]
struct IngredientRows {
    #[serde(default)]
    ingredients: Vec<IngredientEntry>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl BaseIngredientDetector for ClaudeClient {
    async fn detect(&self, name: &str, category: &str) -> Result<IngredientReport, ProviderError> {
        let preamble = "You list the typical ingredients of Japanese dishes. \
            Respond with JSON only: {\"ingredients\": [{\"name\": \"pork\", \
            \"role\": \"main\"}], \"confidence\": 0.7}.";

        let rows: IngredientRows = self
            .prompt_json(
                preamble,
                format!("Dish: {name}\nMenu category: {category}"),
            )
            .await?;

        Ok(IngredientReport {
            ingredients: rows.ingredients,
            confidence: rows.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_passes_plain_json() {
        assert_eq!(extract_json("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn extract_json_strips_fences() {
        let raw = "```json\n[{\"category\": \"Drinks\"}]\n```";
        assert_eq!(extract_json(raw), "[{\"category\": \"Drinks\"}]");
    }

    #[test]
    fn extract_json_drops_surrounding_prose() {
        let raw = "Here is the menu:\n[{\"category\": \"Drinks\", \"items\": []}]\nHope it helps!";
        let parsed: Vec<CategoryRow> = serde_json::from_str(extract_json(raw)).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].category, "Drinks");
    }
}
