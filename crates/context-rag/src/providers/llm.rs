//! Answer generation collaborator

use async_trait::async_trait;
use crate::error::Result;
use crate::types::{HistoryMessage, ScoredChunk};

/// Produces an answer from ranked chunks
///
/// Implementations:
/// - `OpenAiChat`: OpenAI-compatible `/chat/completions`
/// - `OllamaChat`: Local Ollama `/api/chat`
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// Generate an answer to `query` grounded in `chunks` (best match first)
    async fn generate(
        &self,
        query: &str,
        chunks: &[ScoredChunk],
        history: &[HistoryMessage],
    ) -> Result<String>;

    /// Get provider name for logging
    fn name(&self) -> &str;

    /// Get the model being used
    fn model(&self) -> &str;
}
