use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding stored uploads (`files/`) and staging area (`tmp/`).
    pub root: PathBuf,
}

impl StorageConfig {
    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Admissions allowed per `window_ms` (classification service quota).
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_ingest_retries")]
    pub max_retries: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_per_window: default_max_per_window(),
            window_ms: default_window_ms(),
            max_retries: default_ingest_retries(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_per_window() -> u32 {
    20
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_ingest_retries() -> i64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_tokens")]
    pub window_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_tokens: default_window_tokens(),
            overlap_tokens: default_overlap(),
            min_tokens: default_min_tokens(),
        }
    }
}

fn default_window_tokens() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}
fn default_min_tokens() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,
    #[serde(default = "default_max_top_n")]
    pub max_top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            default_top_n: default_top_n(),
            max_top_n: default_max_top_n(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.6
}
fn default_keyword_weight() -> f64 {
    0.4
}
fn default_top_n() -> usize {
    20
}
fn default_max_top_n() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Content sent to the classifier is truncated to this many characters.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_classifier_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// `disabled`, `sqlite` (vectors next to the record store) or `qdrant`.
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            url: default_qdrant_url(),
            collection: default_collection(),
        }
    }
}

fn default_vector_backend() -> String {
    "sqlite".to_string()
}
fn default_qdrant_url() -> String {
    "http://127.0.0.1:6333".to_string()
}
fn default_collection() -> String {
    "file_chunks".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.window_tokens == 0 {
        anyhow::bail!("chunking.window_tokens must be > 0");
    }
    if chunking.overlap_tokens >= chunking.window_tokens {
        anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.window_tokens");
    }

    let ingest = &config.ingest;
    if ingest.max_concurrent == 0 {
        anyhow::bail!("ingest.max_concurrent must be >= 1");
    }
    if ingest.max_per_window == 0 || ingest.window_ms == 0 {
        anyhow::bail!("ingest.max_per_window and ingest.window_ms must be > 0");
    }
    if ingest.max_retries < 1 {
        anyhow::bail!("ingest.max_retries must be >= 1");
    }

    let retrieval = &config.retrieval;
    for (name, weight) in [
        ("semantic_weight", retrieval.semantic_weight),
        ("keyword_weight", retrieval.keyword_weight),
    ] {
        if !(0.0..=1.0).contains(&weight) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if retrieval.max_top_n == 0 {
        anyhow::bail!("retrieval.max_top_n must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.classifier.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown classifier provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.vector.backend.as_str() {
        "disabled" | "sqlite" | "qdrant" => {}
        other => anyhow::bail!(
            "Unknown vector backend: '{}'. Must be disabled, sqlite, or qdrant.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "/tmp/kh.sqlite"

        [storage]
        root = "/tmp/kh-store"
    "#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.window_tokens, 500);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.chunking.min_tokens, 100);
        assert_eq!(config.ingest.max_retries, 3);
        assert_eq!(config.retrieval.max_top_n, 50);
        assert_eq!(config.classifier.max_input_chars, 8_000);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.vector.backend, "sqlite");
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let text = format!(
            "{}\n[chunking]\nwindow_tokens = 50\noverlap_tokens = 50\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_enabled_embedding_requires_dims() {
        let text = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_vector_backend_rejected() {
        let text = format!("{}\n[vector]\nbackend = \"faiss\"\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }
}
