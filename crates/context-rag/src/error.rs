//! Error types for the ingestion and retrieval pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Content type the extractor cannot read
    #[error("Unsupported MIME type: {0}")]
    UnsupportedFormat(String),

    /// A single remote embedding attempt failed
    #[error("Embedding request failed: {0}")]
    Embedding(String),

    /// Every embedding attempt failed; callers substitute a zero vector
    #[error("Embedding unavailable after {attempts} attempts: {message}")]
    EmbeddingUnavailable { attempts: u32, message: String },

    /// The broker rejected a publish
    #[error("Failed to enqueue message: {0}")]
    QueuePublish(String),

    /// Queue payload that cannot be decoded
    #[error("Malformed queue message: {0}")]
    MalformedMessage(String),

    /// Failure inside a coordinator pass
    #[error("Document processing failed: {0}")]
    Processing(String),

    /// Extraction produced no text to chunk
    #[error("No text extracted: {0}")]
    NoText(String),

    /// PDF could not be opened or decoded
    #[error("Failed to read PDF: {0}")]
    Pdf(String),

    /// Answer generation error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Context not found
    #[error("Context not found: {0}")]
    ContextNotFound(String),

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// Context has no documents to chat against
    #[error("Context {0} has no documents, upload one before starting a chat")]
    NoDocuments(String),

    /// Upload status value outside the four known states
    #[error("Invalid upload status: {0}")]
    InvalidStatus(String),

    /// SQLite error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create a processing error
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Create a malformed message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage(message.into())
    }

    /// Create an LLM error
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm(message.into())
    }

    /// Whether another delivery of the same work could succeed.
    ///
    /// Permanent failures are tied to the document itself: redelivering the
    /// message would fail the same way.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::MalformedMessage(_)
                | Self::DocumentNotFound(_)
                | Self::ContextNotFound(_)
                | Self::InvalidStatus(_)
                | Self::NoText(_)
                | Self::Pdf(_)
        )
    }
}
