//! context-rag: queue-driven document ingestion and context-scoped retrieval
//!
//! Documents are uploaded into a context, stored with their raw bytes and
//! processed asynchronously: a queue message carries the document id, a worker
//! extracts page-tracked text, chunks it, embeds every chunk and commits the
//! chunks together with the `SUCCESS` status. Chat requests embed the message
//! (folded with recent history), search the context's chunks by cosine
//! distance and ask an LLM for an answer with `"{filename} - page {n}"` sources.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod generation;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod retrieval;
pub mod service;
pub mod state;
pub mod storage;
pub mod types;

pub use config::RagConfig;
pub use error::{Error, Result};
pub use service::{ChatService, DocumentService};
pub use state::AppState;
pub use types::{
    ChatResponse, ContentType, Context, Document, DocumentChunk, HistoryMessage, RetrievalOutcome,
    UploadStatus,
};
