//! Storage module for persistent data storage
//!
//! Provides the `DocumentStore` abstraction and its SQLite implementation.

mod database;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Context, Document, DocumentChunk, ScoredChunk, UploadStatus};

pub use database::{cosine_distance, decode_embedding, encode_embedding, SqliteStore};

/// Persistence for contexts, documents and their chunks
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new context
    async fn insert_context(&self, context: &Context) -> Result<()>;

    /// Get a context by id
    async fn get_context(&self, id: Uuid) -> Result<Option<Context>>;

    /// Delete a context with its documents and chunks
    async fn delete_context(&self, id: Uuid) -> Result<bool>;

    /// Insert a new document, raw bytes included
    async fn insert_document(&self, document: &Document) -> Result<()>;

    /// Get a document by id, raw bytes included
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    /// List a context's documents, oldest first. Raw bytes are not loaded.
    async fn list_documents(&self, context_id: Uuid) -> Result<Vec<Document>>;

    /// Delete a document with its chunks
    async fn delete_document(&self, id: Uuid) -> Result<bool>;

    /// Move `id` to `to` only if its current status is one of `from`.
    ///
    /// Returns false when the document is missing or in another state.
    async fn transition_status(&self, id: Uuid, from: &[UploadStatus], to: UploadStatus) -> Result<bool>;

    /// Replace the chunk set and flip `PROCESSING -> SUCCESS` atomically.
    ///
    /// Returns false, writing nothing, when the document is no longer `PROCESSING`.
    async fn commit_chunks(&self, document_id: Uuid, chunks: Vec<DocumentChunk>) -> Result<bool>;

    /// Chunks of a document in index order
    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>>;

    /// Number of chunks stored for a document
    async fn count_chunks(&self, document_id: Uuid) -> Result<usize>;

    /// Remove every chunk of a document
    async fn delete_chunks(&self, document_id: Uuid) -> Result<usize>;

    /// Nearest chunks to `query` by cosine distance, best first.
    ///
    /// Only chunks of `SUCCESS` documents among `document_ids` are candidates.
    /// Ties break on document id, then chunk index.
    async fn search_by_vector(
        &self,
        document_ids: &[Uuid],
        query: &[f32],
        limit: usize,
        max_distance: Option<f32>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Store name for logging
    fn name(&self) -> &str;
}
