//! Embedding provider port and implementations.
//!
//! The [`EmbeddingPort`] trait is the only way components obtain vectors;
//! instances are constructed once by the composition root and handed down
//! as `Arc<dyn EmbeddingPort>`. Nothing in this crate holds a global
//! model handle.
//!
//! Implementations:
//! - **[`DisabledEmbedder`]** — always returns `ModelUnavailable`; callers
//!   that can degrade (lexical search) do so, others surface the error.
//! - **[`OllamaEmbedder`]** — `POST /api/embed` on a local Ollama daemon.
//! - **[`OpenAiEmbedder`]** — the OpenAI embeddings API.
//!
//! # Retry strategy
//!
//! HTTP 429 and 5xx are retried with exponential backoff (1s, 2s, 4s, …,
//! capped at 32s); other 4xx fail immediately; network errors are retried.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use termbridge_core::Error;

use crate::config::EmbeddingConfig;

/// An opaque `text -> vector` capability.
///
/// Must be deterministic for identical input and model. Shared and
/// stateless: components never assume exclusive access.
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    /// Model identifier (e.g. `"bge-m3"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality the model produces.
    fn dims(&self) -> usize;
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error>;

    /// Embed a batch, preserving order. The default loops over
    /// [`embed`](EmbeddingPort::embed); HTTP providers override with a
    /// single batched call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Build the configured embedder.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingPort>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled ============

/// No-op embedder used when no backend is configured.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingPort for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, Error> {
        Err(Error::ModelUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Ollama ============

/// Embedder backed by a local Ollama instance's `/api/embed` endpoint.
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            Error::ModelUnavailable(format!("invalid embed response: {e}"))
                        })?;
                        return parse_ollama_embeddings(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::ModelUnavailable(format!(
                            "Ollama embed error {status}: {body_text}"
                        )));
                        continue;
                    }
                    return Err(Error::ModelUnavailable(format!(
                        "Ollama embed error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::ModelUnavailable(format!(
                        "Ollama connection error (is Ollama running at {}?): {e}",
                        self.url
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::ModelUnavailable("embedding failed after retries".into())))
    }
}

fn parse_ollama_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, Error> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            Error::ModelUnavailable("invalid Ollama response: missing embeddings array".into())
        })?;

    let mut out = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                Error::ModelUnavailable("invalid Ollama response: embedding is not an array".into())
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        out.push(vec);
    }
    Ok(out)
}

#[async_trait]
impl EmbeddingPort for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::ModelUnavailable("empty embedding response".into()))
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ============ OpenAI ============

/// Embedder backed by the OpenAI embeddings API. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            model,
            dims,
            url,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/v1/embeddings", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            Error::ModelUnavailable(format!("invalid embed response: {e}"))
                        })?;
                        return parse_openai_embeddings(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::ModelUnavailable(format!(
                            "OpenAI embed error {status}: {body_text}"
                        )));
                        continue;
                    }
                    return Err(Error::ModelUnavailable(format!(
                        "OpenAI embed error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::ModelUnavailable(format!("request error: {e}")));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::ModelUnavailable("embedding failed after retries".into())))
    }
}

fn parse_openai_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, Error> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        Error::ModelUnavailable("invalid OpenAI response: missing data array".into())
    })?;

    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                Error::ModelUnavailable("invalid OpenAI response: missing embedding".into())
            })?;
        out.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(out)
}

#[async_trait]
impl EmbeddingPort for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::ModelUnavailable("empty embedding response".into()))
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}
