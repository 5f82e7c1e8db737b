//! Embedding provider trait for the remote embedding call

use async_trait::async_trait;
use crate::error::Result;

/// A single remote embedding call. Fallible and unretried; retry, truncation
/// and fallback live in `EmbeddingClient`.
///
/// Implementations:
/// - `OpenAiEmbedder`: OpenAI-compatible `/embeddings` (text-embedding-ada-002)
/// - `OllamaEmbedder`: Local Ollama server (nomic-embed-text)
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embedding width this provider produces
    fn dimensions(&self) -> usize;

    /// Check if the provider is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
