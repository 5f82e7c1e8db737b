//! Document and chat services on top of the pipeline

use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::generation::format_sources;
use crate::processing::{DocumentPublisher, IngestionCoordinator};
use crate::providers::AnswerGenerator;
use crate::retrieval::RetrievalEngine;
use crate::storage::DocumentStore;
use crate::types::{ChatResponse, ContentType, Context, Document, HistoryMessage, RetrievalOutcome, UploadStatus};

/// Context and document lifecycle
pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<IngestionCoordinator>,
    /// Set when documents are processed in the background
    publisher: Option<DocumentPublisher>,
}

impl DocumentService {
    /// Create a service that processes inline, or through `publisher` when given
    pub fn new(
        store: Arc<dyn DocumentStore>,
        coordinator: Arc<IngestionCoordinator>,
        publisher: Option<DocumentPublisher>,
    ) -> Self {
        Self {
            store,
            coordinator,
            publisher,
        }
    }

    /// Whether uploads are handed to the queue
    pub fn is_background(&self) -> bool {
        self.publisher.is_some()
    }

    pub async fn create_context(
        &self,
        owner_id: &str,
        name: &str,
        description: Option<String>,
    ) -> Result<Context> {
        let context = Context::new(owner_id, name, description);
        self.store.insert_context(&context).await?;
        tracing::info!("[{}] Created context '{}' for {}", context.id, context.name, owner_id);
        Ok(context)
    }

    async fn require_context(&self, context_id: Uuid) -> Result<Context> {
        self.store
            .get_context(context_id)
            .await?
            .ok_or_else(|| Error::ContextNotFound(context_id.to_string()))
    }

    /// Store a document and start its processing.
    ///
    /// The raw bytes are persisted as `IN_QUEUE` first. In background mode a
    /// failed enqueue is returned as `QueuePublish`. Inline, a failed pass is
    /// logged and shows up as `FAILED_PROCESSING` on the returned document.
    pub async fn upload(
        &self,
        context_id: Uuid,
        filename: &str,
        mime: &str,
        data: Vec<u8>,
    ) -> Result<Document> {
        let content_type = ContentType::from_mime(mime)?;
        self.require_context(context_id).await?;

        let document = Document::new(context_id, filename, content_type, data);
        self.store.insert_document(&document).await?;
        tracing::info!(
            "[{}] Stored '{}' ({}, {} bytes)",
            document.id,
            filename,
            content_type,
            document.data.len()
        );

        self.dispatch(&document).await?;
        self.reload(document.id).await
    }

    /// Run a `FAILED_PROCESSING` document through the pipeline again
    pub async fn reprocess(&self, document_id: Uuid) -> Result<Document> {
        let document = self.reload(document_id).await?;
        if document.upload_status != UploadStatus::FailedProcessing {
            return Err(Error::InvalidStatus(format!(
                "{} is {}, only FAILED_PROCESSING documents can be reprocessed",
                document_id, document.upload_status
            )));
        }

        tracing::info!("[{}] Reprocessing '{}'", document_id, document.filename);
        self.dispatch(&document).await?;
        self.reload(document_id).await
    }

    async fn dispatch(&self, document: &Document) -> Result<()> {
        match &self.publisher {
            Some(publisher) => publisher.enqueue(document.id).await,
            None => {
                if let Err(e) = self.coordinator.process(document).await {
                    tracing::error!("[{}] Inline processing failed: {}", document.id, e);
                }
                Ok(())
            }
        }
    }

    async fn reload(&self, document_id: Uuid) -> Result<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))
    }

    /// Current upload status
    pub async fn status(&self, document_id: Uuid) -> Result<UploadStatus> {
        Ok(self.reload(document_id).await?.upload_status)
    }

    /// Documents of a context, oldest first, without raw bytes
    pub async fn list_documents(&self, context_id: Uuid) -> Result<Vec<Document>> {
        self.require_context(context_id).await?;
        self.store.list_documents(context_id).await
    }

    pub async fn delete_document(&self, document_id: Uuid) -> Result<()> {
        if !self.store.delete_document(document_id).await? {
            return Err(Error::DocumentNotFound(document_id.to_string()));
        }
        tracing::info!("[{}] Deleted document", document_id);
        Ok(())
    }

    pub async fn delete_context(&self, context_id: Uuid) -> Result<()> {
        if !self.store.delete_context(context_id).await? {
            return Err(Error::ContextNotFound(context_id.to_string()));
        }
        tracing::info!("[{}] Deleted context", context_id);
        Ok(())
    }
}

/// Answers chat messages against a context
pub struct ChatService {
    store: Arc<dyn DocumentStore>,
    retrieval: RetrievalEngine,
    generator: Arc<dyn AnswerGenerator>,
}

impl ChatService {
    pub fn new(store: Arc<dyn DocumentStore>, retrieval: RetrievalEngine, generator: Arc<dyn AnswerGenerator>) -> Self {
        Self {
            store,
            retrieval,
            generator,
        }
    }

    /// Answer `message` using the context's documents and recent history
    pub async fn chat(
        &self,
        context_id: Uuid,
        message: &str,
        history: &[HistoryMessage],
    ) -> Result<ChatResponse> {
        if self.store.get_context(context_id).await?.is_none() {
            return Err(Error::ContextNotFound(context_id.to_string()));
        }
        if self.store.list_documents(context_id).await?.is_empty() {
            return Err(Error::NoDocuments(context_id.to_string()));
        }

        match self.retrieval.retrieve(context_id, message, history).await? {
            RetrievalOutcome::InsufficientInformation => Ok(ChatResponse::insufficient_information()),
            RetrievalOutcome::Ranked { chunks, sources } => {
                tracing::info!(
                    "[{}] Generating answer from {} chunks with {} ({})",
                    context_id,
                    chunks.len(),
                    self.generator.name(),
                    self.generator.model()
                );
                let response = self.generator.generate(message, &chunks, history).await?;
                Ok(ChatResponse {
                    response,
                    sources: format_sources(&sources),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, RetrievalConfig};
    use crate::embeddings::{test_config, EmbeddingClient, FlakyProvider};
    use crate::ingestion::PageChunker;
    use crate::processing::{QueuePublisher, SqliteQueue};
    use crate::storage::SqliteStore;
    use crate::types::response::INSUFFICIENT_INFORMATION;
    use crate::types::ScoredChunk;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    const DIMS: usize = 4;

    #[derive(Default)]
    pub(crate) struct CountingGenerator {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerGenerator for CountingGenerator {
        async fn generate(&self, query: &str, chunks: &[ScoredChunk], _history: &[HistoryMessage]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} chunks for '{}'", chunks.len(), query))
        }

        fn name(&self) -> &str {
            "counting"
        }

        fn model(&self) -> &str {
            "test"
        }
    }

    struct Services {
        store: Arc<SqliteStore>,
        documents: DocumentService,
        chat: ChatService,
        generator: Arc<CountingGenerator>,
    }

    fn services(publisher: Option<DocumentPublisher>, store: Arc<SqliteStore>) -> Services {
        let embedder = Arc::new(EmbeddingClient::new(Arc::new(FlakyProvider::new(0, DIMS)), &test_config(DIMS)));
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            embedder.clone(),
            PageChunker::from_config(&ChunkingConfig::default()),
            Arc::new(Semaphore::new(2)),
        ));
        let generator = Arc::new(CountingGenerator::default());
        let retrieval = RetrievalEngine::new(store.clone(), embedder, RetrievalConfig::default());

        Services {
            documents: DocumentService::new(store.clone(), coordinator, publisher),
            chat: ChatService::new(store.clone(), retrieval, generator.clone()),
            store,
            generator,
        }
    }

    fn inline() -> Services {
        services(None, Arc::new(SqliteStore::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_unsupported_upload_is_rejected_before_storage() {
        let s = inline();
        let context = s.documents.create_context("u1", "Docs", None).await.unwrap();

        let result = s.documents.upload(context.id, "sheet.xlsx", "application/vnd.ms-excel", vec![1, 2]).await;
        match result {
            Err(Error::UnsupportedFormat(mime)) => assert_eq!(mime, "application/vnd.ms-excel"),
            other => panic!("expected UnsupportedFormat, got {:?}", other.map(|d| d.id)),
        }
        assert!(s.documents.list_documents(context.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_context() {
        let s = inline();
        let result = s.documents.upload(Uuid::now_v7(), "a.txt", "text/plain", b"x".to_vec()).await;
        assert!(matches!(result, Err(Error::ContextNotFound(_))));
    }

    #[tokio::test]
    async fn test_inline_upload_processes_immediately() {
        let s = inline();
        let context = s.documents.create_context("u1", "Docs", None).await.unwrap();

        let document = s
            .documents
            .upload(context.id, "faq.md", "text/markdown; charset=utf-8", b"# FAQ\n\nWe ship worldwide.".to_vec())
            .await
            .unwrap();
        assert_eq!(document.upload_status, UploadStatus::Success);
        assert_eq!(document.data, b"# FAQ\n\nWe ship worldwide.");
        assert_eq!(s.store.count_chunks(document.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inline_failure_is_reported_through_status() {
        let s = inline();
        let context = s.documents.create_context("u1", "Docs", None).await.unwrap();

        let document = s.documents.upload(context.id, "blank.txt", "text/plain", b"   ".to_vec()).await.unwrap();
        assert_eq!(document.upload_status, UploadStatus::FailedProcessing);
        assert_eq!(s.documents.status(document.id).await.unwrap(), UploadStatus::FailedProcessing);

        // Retry is allowed from FAILED_PROCESSING only
        let retried = s.documents.reprocess(document.id).await.unwrap();
        assert_eq!(retried.upload_status, UploadStatus::FailedProcessing);

        let ok = s.documents.upload(context.id, "ok.txt", "text/plain", b"fine".to_vec()).await.unwrap();
        tokio_test::assert_err!(s.documents.reprocess(ok.id).await);
    }

    #[tokio::test]
    async fn test_background_upload_enqueues() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::new(store.connection(), &Default::default()).unwrap());
        let publisher = DocumentPublisher::new(queue.clone() as Arc<dyn QueuePublisher>, queue.topic());
        let s = services(Some(publisher), store);
        assert!(s.documents.is_background());

        let context = s.documents.create_context("u1", "Docs", None).await.unwrap();
        let document = s.documents.upload(context.id, "a.txt", "text/plain", b"hello".to_vec()).await.unwrap();

        assert_eq!(document.upload_status, UploadStatus::InQueue);
        assert_eq!(queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_document() {
        let s = inline();
        assert!(matches!(
            s.documents.delete_document(Uuid::now_v7()).await,
            Err(Error::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chat_errors_for_unknown_or_empty_context() {
        let s = inline();
        assert!(matches!(
            s.chat.chat(Uuid::now_v7(), "hi", &[]).await,
            Err(Error::ContextNotFound(_))
        ));

        let context = s.documents.create_context("u1", "Empty", None).await.unwrap();
        assert!(matches!(
            s.chat.chat(context.id, "hi", &[]).await,
            Err(Error::NoDocuments(_))
        ));
    }

    #[tokio::test]
    async fn test_chat_without_processed_documents_returns_sentinel() {
        let s = inline();
        let context = s.documents.create_context("u1", "Docs", None).await.unwrap();
        s.documents.upload(context.id, "blank.txt", "text/plain", b" ".to_vec()).await.unwrap();

        let response = s.chat.chat(context.id, "What is the refund policy?", &[]).await.unwrap();
        assert_eq!(response.response, INSUFFICIENT_INFORMATION);
        assert!(response.sources.is_empty());
        assert_eq!(s.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chat_answers_with_sources() {
        let s = inline();
        let context = s.documents.create_context("u1", "Docs", None).await.unwrap();
        s.documents
            .upload(context.id, "policy.txt", "text/plain", b"Refunds within 30 days.".to_vec())
            .await
            .unwrap();

        let response = s.chat.chat(context.id, "refunds?", &[]).await.unwrap();
        assert_eq!(response.response, "1 chunks for 'refunds?'");
        assert_eq!(response.sources, vec!["policy.txt - page 1".to_string()]);
        assert_eq!(s.generator.calls.load(Ordering::SeqCst), 1);
    }
}
