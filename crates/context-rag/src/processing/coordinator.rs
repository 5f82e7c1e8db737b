//! Single-document ingestion pass: extract, chunk, embed, persist

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::embeddings::EmbeddingClient;
use crate::error::{Error, Result};
use crate::ingestion::{self, PageChunker};
use crate::storage::DocumentStore;
use crate::types::{Document, DocumentChunk, UploadStatus};

/// Why a pass did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Document is already `SUCCESS`
    AlreadySucceeded,
    /// Another pass in this process holds the document
    InFlight,
    /// Current status does not allow a new pass
    NotProcessable(UploadStatus),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySucceeded => f.write_str("already processed"),
            Self::InFlight => f.write_str("already being processed by this worker"),
            Self::NotProcessable(status) => write!(f, "status is {}", status),
        }
    }
}

/// Result of a coordinator pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Chunks were written and the document is `SUCCESS`
    Processed { chunks: usize, zero_vectors: usize },
    /// Nothing was written
    Skipped(SkipReason),
}

/// A pass currently running in this process
#[derive(Debug, Clone)]
pub struct ActivePass {
    pub filename: String,
    pub started_at: DateTime<Utc>,
}

/// Runs ingestion passes for documents.
///
/// The only writer of `upload_status`. Entry into `PROCESSING` is a
/// compare-and-set in the store, so concurrent deliveries of one document
/// result in a single pass.
pub struct IngestionCoordinator {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<EmbeddingClient>,
    chunker: PageChunker,
    embedding_permits: Arc<Semaphore>,
    active: DashMap<Uuid, ActivePass>,
}

impl IngestionCoordinator {
    /// Create a new coordinator. `embedding_permits` bounds concurrent
    /// embedding calls and is meant to be shared by every coordinator.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<EmbeddingClient>,
        chunker: PageChunker,
        embedding_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            embedding_permits,
            active: DashMap::new(),
        }
    }

    /// Passes running in this process
    pub fn active_passes(&self) -> Vec<(Uuid, ActivePass)> {
        self.active
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Load a document by id and process it
    pub async fn process_id(&self, document_id: Uuid) -> Result<ProcessOutcome> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
        self.process(&document).await
    }

    /// Process one document.
    ///
    /// On failure after entering `PROCESSING` the document is moved to
    /// `FAILED_PROCESSING` and the error is returned to the caller.
    pub async fn process(&self, document: &Document) -> Result<ProcessOutcome> {
        if document.upload_status == UploadStatus::Success {
            tracing::debug!("[{}] Already processed, skipping", document.id);
            return Ok(ProcessOutcome::Skipped(SkipReason::AlreadySucceeded));
        }

        let _guard = match self.active.entry(document.id) {
            Entry::Occupied(_) => {
                tracing::info!("[{}] Pass already running in this worker, skipping", document.id);
                return Ok(ProcessOutcome::Skipped(SkipReason::InFlight));
            }
            Entry::Vacant(slot) => {
                slot.insert(ActivePass {
                    filename: document.filename.clone(),
                    started_at: Utc::now(),
                });
                ActiveGuard {
                    active: &self.active,
                    id: document.id,
                }
            }
        };

        let claimed = self
            .store
            .transition_status(document.id, &UploadStatus::PROCESSABLE, UploadStatus::Processing)
            .await?;
        if !claimed {
            let reason = match self.store.get_document(document.id).await? {
                None => return Err(Error::DocumentNotFound(document.id.to_string())),
                Some(current) if current.upload_status == UploadStatus::Success => {
                    SkipReason::AlreadySucceeded
                }
                Some(current) => SkipReason::NotProcessable(current.upload_status),
            };
            tracing::info!("[{}] Not claimed ({}), skipping", document.id, reason);
            return Ok(ProcessOutcome::Skipped(reason));
        }

        tracing::info!(
            "[{}] Processing '{}' ({}, {} bytes)",
            document.id,
            document.filename,
            document.content_type,
            document.data.len()
        );
        let started = std::time::Instant::now();

        match self.run_pass(document).await {
            Ok((chunks, zero_vectors)) => {
                tracing::info!(
                    "[{}] COMPLETE: {} chunks stored in {:.1}s",
                    document.id,
                    chunks,
                    started.elapsed().as_secs_f64()
                );
                Ok(ProcessOutcome::Processed { chunks, zero_vectors })
            }
            Err(e) => {
                tracing::error!("[{}] Processing failed: {}", document.id, e);
                match self
                    .store
                    .transition_status(document.id, &[UploadStatus::Processing], UploadStatus::FailedProcessing)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        "[{}] Document left PROCESSING before it could be marked failed",
                        document.id
                    ),
                    Err(mark_err) => tracing::error!(
                        "[{}] Could not mark document failed: {}",
                        document.id,
                        mark_err
                    ),
                }
                Err(e)
            }
        }
    }

    /// Extract, chunk, embed and commit. Returns (chunks, zero-vector chunks).
    async fn run_pass(&self, document: &Document) -> Result<(usize, usize)> {
        let data = document.data.clone();
        let content_type = document.content_type;
        let pages = tokio::task::spawn_blocking(move || ingestion::extract(&data, content_type))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))??;

        let page_chunks = self.chunker.chunk(&pages);
        if page_chunks.is_empty() {
            return Err(Error::NoText(format!(
                "{} page(s) of '{}'",
                pages.len(),
                document.filename
            )));
        }
        tracing::info!(
            "[{}] {} pages -> {} chunks, generating embeddings...",
            document.id,
            pages.len(),
            page_chunks.len()
        );

        let embeddings = join_all(page_chunks.iter().map(|chunk| async {
            let _permit = self
                .embedding_permits
                .acquire()
                .await
                .map_err(|_| Error::Internal("embedding pool closed".to_string()))?;
            Ok::<_, Error>(self.embedder.embed(&chunk.text).await)
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        let zero_vectors = embeddings
            .iter()
            .filter(|e| e.iter().all(|v| *v == 0.0))
            .count();
        if zero_vectors > 0 {
            tracing::warn!(
                "[{}] {} of {} chunks stored with fallback zero vectors",
                document.id,
                zero_vectors,
                embeddings.len()
            );
        }

        let chunks: Vec<DocumentChunk> = page_chunks
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (chunk, embedding))| {
                DocumentChunk::new(document, index as u32, chunk.text, embedding, chunk.page)
            })
            .collect();
        let count = chunks.len();

        if !self.store.commit_chunks(document.id, chunks).await? {
            return Err(Error::processing("document left PROCESSING before its chunks were committed"));
        }

        Ok((count, zero_vectors))
    }
}

struct ActiveGuard<'a> {
    active: &'a DashMap<Uuid, ActivePass>,
    id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}
