//! TOML configuration parsing and validation.
//!
//! Every component gets its own config struct with documented defaults;
//! unrecognized keys are rejected at parse time rather than silently
//! ignored, so typos surface immediately.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub terms: TermsConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Where the vector store persists its collections.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/vectors.json")
}

/// Knowledge index tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeConfig {
    #[serde(default = "default_items_path")]
    pub items_path: PathBuf,
    /// Character budget per imported chunk.
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget: usize,
    /// Results returned by a search.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates fetched per query variant before merging.
    #[serde(default = "default_variant_top_k")]
    pub variant_top_k: usize,
    /// Floor for passages admitted into an answer context.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Relaxed floor used for the per-variant searches; kept below
    /// `min_similarity` to trade precision for recall.
    #[serde(default = "default_variant_min_similarity")]
    pub variant_min_similarity: f32,
    /// Prefix rewrites applied to the query ("what is {q}").
    #[serde(default = "default_variant_prefixes")]
    pub variant_prefixes: Vec<String>,
    /// Suffix rewrites applied to the query ("{q} explained").
    #[serde(default = "default_variant_suffixes")]
    pub variant_suffixes: Vec<String>,
    /// Keywords extracted from the query as extra variants.
    #[serde(default = "default_keyword_count")]
    pub keyword_count: usize,
    /// Passages concatenated into an answer context.
    #[serde(default = "default_max_context_items")]
    pub max_context_items: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            items_path: default_items_path(),
            chunk_budget: default_chunk_budget(),
            top_k: default_top_k(),
            variant_top_k: default_variant_top_k(),
            min_similarity: default_min_similarity(),
            variant_min_similarity: default_variant_min_similarity(),
            variant_prefixes: default_variant_prefixes(),
            variant_suffixes: default_variant_suffixes(),
            keyword_count: default_keyword_count(),
            max_context_items: default_max_context_items(),
        }
    }
}

fn default_items_path() -> PathBuf {
    PathBuf::from("data/knowledge/items.json")
}
fn default_chunk_budget() -> usize {
    1000
}
fn default_top_k() -> usize {
    5
}
fn default_variant_top_k() -> usize {
    15
}
fn default_min_similarity() -> f32 {
    0.55
}
fn default_variant_min_similarity() -> f32 {
    0.4
}
fn default_variant_prefixes() -> Vec<String> {
    vec![
        "what is ".to_string(),
        "how to ".to_string(),
        "explain ".to_string(),
        "about ".to_string(),
    ]
}
fn default_variant_suffixes() -> Vec<String> {
    vec![
        " explained".to_string(),
        " definition".to_string(),
        " process".to_string(),
    ]
}
fn default_keyword_count() -> usize {
    3
}
fn default_max_context_items() -> usize {
    3
}

/// Terminology dictionary tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TermsConfig {
    #[serde(default = "default_terms_path")]
    pub path: PathBuf,
    /// Similarity floor for fuzzy term lookup; terms are short, so this
    /// sits below the knowledge floor.
    #[serde(default = "default_fuzzy_min_similarity")]
    pub fuzzy_min_similarity: f32,
    #[serde(default = "default_fuzzy_top_k")]
    pub fuzzy_top_k: usize,
}

impl Default for TermsConfig {
    fn default() -> Self {
        Self {
            path: default_terms_path(),
            fuzzy_min_similarity: default_fuzzy_min_similarity(),
            fuzzy_top_k: default_fuzzy_top_k(),
        }
    }
}

fn default_terms_path() -> PathBuf {
    PathBuf::from("data/terms.json")
}
fn default_fuzzy_min_similarity() -> f32 {
    0.3
}
fn default_fuzzy_top_k() -> usize {
    15
}

/// Translation pipeline tuning.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TranslationConfig {
    /// Budget for one generation call, seconds.
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause before the single timeout retry, seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_generation_timeout_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_retry_backoff_secs() -> u64 {
    2
}

/// Embedding backend selection.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"ollama"`, or `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Generation backend selection.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    /// `"disabled"`, `"ollama"`, or `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            max_retries: 2,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.knowledge.chunk_budget == 0 {
        anyhow::bail!("knowledge.chunk_budget must be > 0");
    }
    if config.knowledge.top_k == 0 {
        anyhow::bail!("knowledge.top_k must be >= 1");
    }
    for (name, value) in [
        ("knowledge.min_similarity", config.knowledge.min_similarity),
        (
            "knowledge.variant_min_similarity",
            config.knowledge.variant_min_similarity,
        ),
        (
            "terms.fuzzy_min_similarity",
            config.terms.fuzzy_min_similarity,
        ),
    ] {
        if !(-1.0..=1.0).contains(&value) {
            anyhow::bail!("{} must be in [-1.0, 1.0]", name);
        }
    }

    for (section, provider, model) in [
        (
            "embedding",
            &config.embedding.provider,
            &config.embedding.model,
        ),
        (
            "generation",
            &config.generation.provider,
            &config.generation.model,
        ),
    ] {
        match provider.as_str() {
            "disabled" | "ollama" | "openai" => {}
            other => anyhow::bail!(
                "Unknown {} provider: '{}'. Must be disabled, ollama, or openai.",
                section,
                other
            ),
        }
        if provider != "disabled" && model.is_none() {
            anyhow::bail!(
                "{}.model must be specified when provider is '{}'",
                section,
                provider
            );
        }
    }

    if config.embedding.is_enabled() && config.embedding.dims.unwrap_or(0) == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.knowledge.chunk_budget, 1000);
        assert_eq!(config.knowledge.top_k, 5);
        assert!(config.knowledge.variant_min_similarity < config.knowledge.min_similarity);
        assert_eq!(config.embedding.provider, "disabled");
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = toml::from_str("[knowledge]\nchunk_bugdet = 500\n");
        assert!(result.is_err());
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"ollama\"\n").unwrap();
        assert!(validate(&config).is_err());

        let config: Config = toml::from_str(
            "[embedding]\nprovider = \"ollama\"\nmodel = \"bge-m3\"\ndims = 1024\n",
        )
        .unwrap();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn similarity_floors_must_be_in_range() {
        let config: Config =
            toml::from_str("[knowledge]\nmin_similarity = 1.5\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config: Config =
            toml::from_str("[generation]\nprovider = \"carrier-pigeon\"\n").unwrap();
        assert!(validate(&config).is_err());
    }
}
