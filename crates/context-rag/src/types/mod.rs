//! Core types for ingestion and retrieval

pub mod chat;
pub mod document;
pub mod response;

pub use chat::{ChatRole, HistoryMessage};
pub use document::{Context, ContentType, Document, DocumentChunk, UploadStatus};
pub use response::{ChatResponse, RetrievalOutcome, ScoredChunk, SourceLabel};
