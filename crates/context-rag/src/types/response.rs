//! Retrieval results, source labels and chat responses

use serde::{Deserialize, Serialize};
use std::fmt;

use super::document::DocumentChunk;

/// Reply used when no chunk supports an answer and there is no history to lean on
pub const INSUFFICIENT_INFORMATION: &str =
    "I don't have enough information to answer that question based on the available documents.";

/// A chunk returned by a nearest-neighbour search
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    /// Cosine distance to the query (0.0 identical, 2.0 opposite)
    pub distance: f32,
}

impl ScoredChunk {
    /// Cosine similarity, `1 - distance`
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Attribution for a chunk: `"{filename} - page {page}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLabel {
    pub filename: String,
    pub page: u32,
}

impl From<&DocumentChunk> for SourceLabel {
    fn from(chunk: &DocumentChunk) -> Self {
        Self {
            filename: chunk.filename.clone(),
            page: chunk.source_page,
        }
    }
}

impl fmt::Display for SourceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - page {}", self.filename, self.page)
    }
}

/// Outcome of a retrieval pass
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    /// Chunks in final ranked order with their deduplicated sources
    Ranked {
        chunks: Vec<ScoredChunk>,
        sources: Vec<SourceLabel>,
    },
    /// Nothing matched a fresh query; answer generation must be skipped
    InsufficientInformation,
}

impl RetrievalOutcome {
    /// Ranked chunks, empty for the sentinel
    pub fn chunks(&self) -> &[ScoredChunk] {
        match self {
            Self::Ranked { chunks, .. } => chunks,
            Self::InsufficientInformation => &[],
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, Self::InsufficientInformation)
    }
}

/// Answer returned to the chat caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub sources: Vec<String>,
}

impl ChatResponse {
    /// The "insufficient information" reply with no sources
    pub fn insufficient_information() -> Self {
        Self {
            response: INSUFFICIENT_INFORMATION.to_string(),
            sources: Vec::new(),
        }
    }
}
