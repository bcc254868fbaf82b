//! Text generation port and implementations.
//!
//! [`GenerationPort`] wraps an opaque `prompt -> text` capability. Every
//! call carries its own timeout; a timeout surfaces as
//! [`Error::GenerationTimeout`] so callers can distinguish "try once
//! more" from "the backend is gone". Instances are dependency-injected,
//! never global.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use termbridge_core::Error;

use crate::config::GenerationConfig;

/// An opaque `prompt -> text` capability.
#[async_trait]
pub trait GenerationPort: Send + Sync {
    /// Model identifier.
    fn model_name(&self) -> &str;
    /// Generate a completion for `prompt`, failing with
    /// [`Error::GenerationTimeout`] if no answer arrives in `timeout`.
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, Error>;
}

/// Build the configured generator.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn GenerationPort>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

/// No-op generator used when no backend is configured. Unlike the
/// embedding side there is no degraded mode for generation, so this
/// always fails hard.
pub struct DisabledGenerator;

#[async_trait]
impl GenerationPort for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str, _timeout: Duration) -> Result<String, Error> {
        Err(Error::GenerationUnavailable(
            "generation provider is disabled".to_string(),
        ))
    }
}

fn map_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::GenerationTimeout
    } else {
        Error::GenerationUnavailable(e.to_string())
    }
}

// ============ Ollama ============

/// Generator backed by a local Ollama instance's `/api/generate` endpoint.
pub struct OllamaGenerator {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::new();

        Ok(Self {
            model,
            url,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl GenerationPort for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, Error> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/generate", self.url))
                .timeout(timeout)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            Error::GenerationUnavailable(format!("invalid response: {e}"))
                        })?;
                        return json
                            .get("response")
                            .and_then(|r| r.as_str())
                            .map(str::to_string)
                            .ok_or_else(|| {
                                Error::GenerationUnavailable(
                                    "invalid Ollama response: missing response field".into(),
                                )
                            });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::GenerationUnavailable(format!(
                            "Ollama generate error {status}: {body_text}"
                        )));
                        continue;
                    }
                    return Err(Error::GenerationUnavailable(format!(
                        "Ollama generate error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    let mapped = map_request_error(e);
                    // Timeouts propagate immediately; the caller owns the
                    // retry-once policy for them.
                    if matches!(mapped, Error::GenerationTimeout) {
                        return Err(mapped);
                    }
                    last_err = Some(mapped);
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::GenerationUnavailable("generation failed after retries".into())))
    }
}

// ============ OpenAI ============

/// Generator backed by an OpenAI-compatible chat completions API.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiGenerator {
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::new();

        Ok(Self {
            model,
            url,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl GenerationPort for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, Error> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/v1/chat/completions", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .timeout(timeout)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            Error::GenerationUnavailable(format!("invalid response: {e}"))
                        })?;
                        return json
                            .pointer("/choices/0/message/content")
                            .and_then(|c| c.as_str())
                            .map(str::to_string)
                            .ok_or_else(|| {
                                Error::GenerationUnavailable(
                                    "invalid OpenAI response: missing message content".into(),
                                )
                            });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::GenerationUnavailable(format!(
                            "OpenAI generate error {status}: {body_text}"
                        )));
                        continue;
                    }
                    return Err(Error::GenerationUnavailable(format!(
                        "OpenAI generate error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    let mapped = map_request_error(e);
                    if matches!(mapped, Error::GenerationTimeout) {
                        return Err(mapped);
                    }
                    last_err = Some(mapped);
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::GenerationUnavailable("generation failed after retries".into())))
    }
}
