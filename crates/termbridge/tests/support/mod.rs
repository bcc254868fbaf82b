//! Deterministic stand-ins for the embedding and generation models.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use termbridge_core::Error;
use termbridge::{EmbeddingPort, GenerationPort};

/// Letter-frequency embedding: texts sharing words get similar vectors.
pub struct BagOfLetters;

#[async_trait]
impl EmbeddingPort for BagOfLetters {
    fn model_name(&self) -> &str {
        "bag-of-letters"
    }
    fn dims(&self) -> usize {
        26
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        let mut v = vec![0.0f32; 26];
        for c in text.chars().flat_map(|c| c.to_lowercase()) {
            if c.is_ascii_lowercase() {
                v[(c as u8 - b'a') as usize] += 1.0;
            }
        }
        Ok(v)
    }
}

/// Echoes back the text portion of the prompt (everything after the
/// final blank line), optionally transformed; counts its calls.
pub struct EchoGenerator {
    calls: AtomicUsize,
    transform: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl EchoGenerator {
    pub fn verbatim() -> Self {
        Self::transforming(|text| text.to_string())
    }

    pub fn transforming(transform: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            transform: Box::new(transform),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationPort for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn generate(&self, prompt: &str, _timeout: Duration) -> Result<String, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = prompt.rsplit("\n\n").next().unwrap_or(prompt);
        Ok((self.transform)(text))
    }
}
