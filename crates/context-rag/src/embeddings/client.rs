//! Embedding client with truncation, retry and zero-vector fallback

use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::providers::EmbeddingProvider;

/// Wraps an `EmbeddingProvider` with the ingestion-safe embedding contract.
///
/// `embed` never fails: blank input and exhausted retries both yield an
/// all-zero vector of the configured width, so one bad chunk cannot block the
/// rest of a document. Query embeddings go through the same path.
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    dimensions: usize,
    max_input_chars: usize,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    request_timeout: Duration,
}

impl EmbeddingClient {
    /// Create a new client around `provider`
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        if provider.dimensions() != config.dimensions {
            tracing::warn!(
                "Provider {} reports {} dimensions but {} are configured; mismatched vectors will be rejected",
                provider.name(),
                provider.dimensions(),
                config.dimensions
            );
        }

        Self {
            provider,
            dimensions: config.dimensions,
            max_input_chars: config.max_input_chars,
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Width of every vector this client returns
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Name of the wrapped provider
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Whether the provider is reachable
    pub async fn health_check(&self) -> Result<bool> {
        self.provider.health_check().await
    }

    /// All-zero vector of the configured width
    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.dimensions]
    }

    /// Embed `text`, substituting a zero vector when every attempt fails
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        match self.try_embed(text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!("{}; using zero vector", e);
                self.zero_vector()
            }
        }
    }

    /// Embed `text`, returning `EmbeddingUnavailable` once retries are exhausted
    pub async fn try_embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(self.zero_vector());
        }

        let input = truncate_chars(text, self.max_input_chars);
        if input.len() < text.len() {
            tracing::debug!(
                "Truncated embedding input from {} to {} bytes",
                text.len(),
                input.len()
            );
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.attempt(input).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        tracing::warn!(
                            "Embedding attempt {}/{} via {} failed: {} (retrying in {}ms)",
                            attempt,
                            self.max_attempts,
                            self.provider.name(),
                            e,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::EmbeddingUnavailable {
            attempts: self.max_attempts,
            message: last_error,
        })
    }

    async fn attempt(&self, input: &str) -> Result<Vec<f32>> {
        let embedding = tokio::time::timeout(self.request_timeout, self.provider.embed(input))
            .await
            .map_err(|_| {
                Error::embedding(format!(
                    "timed out after {}s",
                    self.request_timeout.as_secs()
                ))
            })??;

        if embedding.len() != self.dimensions {
            return Err(Error::embedding(format!(
                "{} returned {} dimensions, expected {}",
                self.provider.name(),
                embedding.len(),
                self.dimensions
            )));
        }
        Ok(embedding)
    }

    /// Delay after failed attempt `attempt` (1-based): base doubled each time, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Longest prefix of `text` with at most `max_chars` characters
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
