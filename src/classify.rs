//! Metadata classification: title, summary, category and tags for a file.
//!
//! Classification is degrade-not-fail. [`classify_or_default`] turns any
//! classifier error into [`Classification::fallback`] so the file still
//! reaches `complete`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ClassifierConfig;
use crate::models::{truncate_chars, Category, Classification};

/// Tags kept per classification.
pub const MAX_TAGS: usize = 8;

const MAX_TITLE_CHARS: usize = 200;

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, filename: &str, content: &str) -> Result<Classification>;
}

pub fn create_classifier(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledClassifier)),
        "openai" => Ok(Arc::new(OpenAiClassifier::new(config)?)),
        other => bail!("Unknown classifier provider: {}", other),
    }
}

/// Classify `content`, truncated to `max_chars`, falling back to the
/// filename-derived default on any error.
pub async fn classify_or_default(
    classifier: &dyn Classifier,
    filename: &str,
    content: &str,
    max_chars: usize,
) -> Classification {
    let input = truncate_chars(content, max_chars);
    match classifier.classify(filename, input).await {
        Ok(c) => c,
        Err(e) => {
            warn!(filename, error = %e, "classification failed, using defaults");
            Classification::fallback(filename)
        }
    }
}

/// Produces the fallback classification without calling anything.
pub struct DisabledClassifier;

#[async_trait]
impl Classifier for DisabledClassifier {
    async fn classify(&self, filename: &str, _content: &str) -> Result<Classification> {
        Ok(Classification::fallback(filename))
    }
}

/// Chat-completions classifier asking for a JSON object.
pub struct OpenAiClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawClassification {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl OpenAiClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            api_key,
            model: config.model.clone(),
        })
    }

    fn system_prompt() -> String {
        let categories: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        format!(
            "You file documents in a personal knowledge base. Reply with a JSON object \
             with keys \"title\" (short, human readable), \"summary\" (one or two sentences), \
             \"category\" (exactly one of: {}) and \"tags\" (up to {} short lowercase keywords).",
            categories.join(", "),
            MAX_TAGS
        )
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, filename: &str, content: &str) -> Result<Classification> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": Self::system_prompt() },
                { "role": "user", "content": format!("Filename: {}\n\n{}", filename, content) }
            ]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Classifier API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let message = json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid classifier response: missing content"))?;

        let raw: RawClassification = serde_json::from_str(message)?;
        Ok(normalize(filename, raw))
    }
}

fn normalize(filename: &str, raw: RawClassification) -> Classification {
    let title = raw
        .title
        .map(|t| truncate_chars(t.trim(), MAX_TITLE_CHARS).to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| filename.to_string());

    let summary = raw.summary.map(|s| s.trim().to_string()).unwrap_or_default();

    let category = raw
        .category
        .as_deref()
        .map(Category::parse_lenient)
        .unwrap_or(Category::Other);

    Classification {
        title,
        summary,
        category,
        tags: normalize_tags(raw.tags),
    }
}

/// Trim, lowercase, drop empties and duplicates, keep at most [`MAX_TAGS`].
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| {
            t.trim()
                .to_lowercase()
                .chars()
                .filter(|c| !c.is_control())
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .take(MAX_TAGS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Classifier for Failing {
        async fn classify(&self, _: &str, _: &str) -> Result<Classification> {
            bail!("rate limited")
        }
    }

    struct Echo;

    #[async_trait]
    impl Classifier for Echo {
        async fn classify(&self, filename: &str, content: &str) -> Result<Classification> {
            Ok(Classification {
                title: filename.to_string(),
                summary: content.to_string(),
                category: Category::Work,
                tags: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_failure_degrades_to_fallback() {
        let c = classify_or_default(&Failing, "notes.txt", "body", 8000).await;
        assert_eq!(c, Classification::fallback("notes.txt"));
        assert_eq!(c.category, Category::Other);
    }

    #[tokio::test]
    async fn test_input_is_truncated() {
        let long = "a".repeat(9000);
        let c = classify_or_default(&Echo, "a.txt", &long, 8000).await;
        assert_eq!(c.summary.len(), 8000);
    }

    #[test]
    fn test_normalize_coerces_fields() {
        let raw: RawClassification = serde_json::from_str(
            r#"{"title": "  ", "summary": " Q3 numbers ", "category": "finance",
                "tags": ["Budget", "budget ", "", "q3", "a","b","c","d","e","f","g"]}"#,
        )
        .unwrap();
        let c = normalize("report.pdf", raw);
        assert_eq!(c.title, "report.pdf");
        assert_eq!(c.summary, "Q3 numbers");
        assert_eq!(c.category, Category::Finance);
        assert_eq!(c.tags.len(), MAX_TAGS);
        assert_eq!(&c.tags[..3], &["budget", "q3", "a"]);
    }

    #[test]
    fn test_unknown_category_maps_to_other() {
        let raw = RawClassification {
            category: Some("Gardening".to_string()),
            ..Default::default()
        };
        assert_eq!(normalize("x", raw).category, Category::Other);
    }
}
