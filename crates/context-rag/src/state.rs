//! Application state: wires storage, providers, the coordinator and the queue

use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{ProviderKind, RagConfig};
use crate::embeddings::EmbeddingClient;
use crate::error::{Error, Result};
use crate::ingestion::PageChunker;
use crate::processing::{
    DocumentPublisher, IngestionCoordinator, NsqdPublisher, NsqdSubscriber, QueueConsumer, QueuePublisher,
    QueueSubscriber, SqliteQueue,
};
use crate::providers::{
    AnswerGenerator, EmbeddingProvider, OllamaChat, OllamaEmbedder, OpenAiChat, OpenAiEmbedder,
};
use crate::retrieval::RetrievalEngine;
use crate::service::{ChatService, DocumentService};
use crate::storage::{DocumentStore, SqliteStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: RagConfig,
    /// Documents, chunks and the local queue share one database
    store: Arc<SqliteStore>,
    queue: Arc<SqliteQueue>,
    embedder: Arc<EmbeddingClient>,
    generator: Arc<dyn AnswerGenerator>,
    coordinator: Arc<IngestionCoordinator>,
    documents: DocumentService,
    chat: ChatService,
}

impl AppState {
    /// Build state from configuration, connecting to the configured providers
    pub async fn new(config: RagConfig) -> Result<Self> {
        tracing::info!("Initializing application state...");

        let store = Arc::new(SqliteStore::new(&config.database.path)?);
        tracing::info!("Database opened at {}", config.database.path.display());

        let embedding_provider: Arc<dyn EmbeddingProvider> = match config.embeddings.provider {
            ProviderKind::OpenAi => Arc::new(OpenAiEmbedder::new(&config.embeddings)?),
            ProviderKind::Ollama => Arc::new(OllamaEmbedder::new(&config.embeddings)?),
        };
        let generator: Arc<dyn AnswerGenerator> = match config.llm.provider {
            ProviderKind::OpenAi => Arc::new(OpenAiChat::new(&config.llm)?),
            ProviderKind::Ollama => Arc::new(OllamaChat::new(&config.llm)?),
        };
        tracing::info!(
            "Providers: embeddings {} ({}), answers {} ({})",
            embedding_provider.name(),
            config.embeddings.model,
            generator.name(),
            generator.model()
        );

        Self::with_components(config, store, embedding_provider, generator)
    }

    /// Build state around an existing store and providers
    pub fn with_components(
        config: RagConfig,
        store: Arc<SqliteStore>,
        embedding_provider: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Result<Self> {
        let embedder = Arc::new(EmbeddingClient::new(embedding_provider, &config.embeddings));

        // One pool of embedding permits for every document in the process
        let permits = Arc::new(Semaphore::new(config.processing.parallel_embeddings));
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            embedder.clone(),
            PageChunker::from_config(&config.chunking),
            permits,
        ));

        let queue = Arc::new(SqliteQueue::new(store.connection(), &config.queue)?);
        let publisher = if config.processing.background {
            let backend: Arc<dyn QueuePublisher> = match &config.queue.nsqd_address {
                Some(address) => Arc::new(NsqdPublisher::new(address)?),
                None => queue.clone() as Arc<dyn QueuePublisher>,
            };
            tracing::info!(
                "Background processing via {} (topic '{}')",
                backend.name(),
                config.queue.topic
            );
            Some(DocumentPublisher::new(backend, config.queue.topic.clone()))
        } else {
            tracing::info!("Inline processing enabled");
            None
        };

        let documents = DocumentService::new(store.clone(), coordinator.clone(), publisher);
        let retrieval = RetrievalEngine::new(store.clone(), embedder.clone(), config.retrieval.clone());
        let chat = ChatService::new(store.clone(), retrieval, generator.clone());

        tracing::info!("Application state ready");

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                queue,
                embedder,
                generator,
                coordinator,
                documents,
                chat,
            }),
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.inner.store.clone()
    }

    pub fn queue(&self) -> &Arc<SqliteQueue> {
        &self.inner.queue
    }

    pub fn embedder(&self) -> &Arc<EmbeddingClient> {
        &self.inner.embedder
    }

    pub fn generator(&self) -> &Arc<dyn AnswerGenerator> {
        &self.inner.generator
    }

    pub fn coordinator(&self) -> &Arc<IngestionCoordinator> {
        &self.inner.coordinator
    }

    pub fn documents(&self) -> &DocumentService {
        &self.inner.documents
    }

    pub fn chat(&self) -> &ChatService {
        &self.inner.chat
    }

    /// Start `queue.workers` consumer loops on nsqd when a consumer source is
    /// configured, otherwise on the local queue
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let config = &self.inner.config.queue;
        let subscriber: Arc<dyn QueueSubscriber> = if config.uses_nsqd() {
            Arc::new(NsqdSubscriber::connect(config)?)
        } else if config.nsqd_address.is_some() {
            return Err(Error::Config(
                "uploads publish to nsqd but no nsqlookupd_address or nsqd_tcp_address is set to consume from".into(),
            ));
        } else {
            self.inner.queue.clone() as Arc<dyn QueueSubscriber>
        };

        tracing::info!(
            "Starting {} queue consumer(s) on '{}' (channel '{}')",
            config.workers.max(1),
            config.topic,
            config.channel
        );
        Ok(QueueConsumer::spawn_pool(
            config.workers,
            self.store(),
            self.inner.coordinator.clone(),
            subscriber,
            config,
            shutdown,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::FlakyProvider;
    use crate::service::tests::CountingGenerator;
    use crate::types::UploadStatus;
    use std::time::Duration;

    fn state(background: bool) -> AppState {
        let mut config = RagConfig::default();
        config.embeddings.dimensions = 4;
        config.processing.background = background;
        config.queue.poll_interval_ms = 5;
        AppState::with_components(
            config,
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(FlakyProvider::new(0, 4)),
            Arc::new(CountingGenerator::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_background_upload_is_processed_by_workers() {
        let state = state(true);
        let context = state.documents().create_context("u1", "Docs", None).await.unwrap();
        let document = state
            .documents()
            .upload(context.id, "notes.txt", "text/plain", b"The office opens at nine.".to_vec())
            .await
            .unwrap();
        assert_eq!(document.upload_status, UploadStatus::InQueue);
        assert_eq!(state.queue().pending().await.unwrap(), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = state.spawn_workers(shutdown_rx).unwrap();

        // The delivery is acknowledged just after the status flips
        let mut drained = false;
        for _ in 0..200 {
            if state.queue().pending().await.unwrap() == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained);
        assert_eq!(state.documents().status(document.id).await.unwrap(), UploadStatus::Success);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio_test::assert_ok!(handle.await);
        }
    }

    #[tokio::test]
    async fn test_workers_refuse_nsqd_publishing_without_consumer_source() {
        let mut config = RagConfig::default();
        config.embeddings.dimensions = 4;
        config.processing.background = true;
        config.queue.nsqd_address = Some("127.0.0.1:4151".to_string());
        let state = AppState::with_components(
            config,
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(FlakyProvider::new(0, 4)),
            Arc::new(CountingGenerator::default()),
        )
        .unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(matches!(state.spawn_workers(shutdown_rx), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_inline_state_has_no_publisher() {
        let state = state(false);
        assert!(!state.documents().is_background());
        assert_eq!(state.embedder().dimensions(), 4);
    }
}
