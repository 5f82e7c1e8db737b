//! Context-scoped similarity search with adaptive result counts

use std::sync::Arc;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embeddings::EmbeddingClient;
use crate::error::Result;
use crate::generation::source_labels;
use crate::storage::DocumentStore;
use crate::types::chat::recent_turns;
use crate::types::{HistoryMessage, RetrievalOutcome, ScoredChunk, UploadStatus};

use super::reformulate::reformulate;

/// Retrieves ranked chunks for a chat message
pub struct RetrievalEngine {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<EmbeddingClient>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    /// Create a new retrieval engine
    pub fn new(store: Arc<dyn DocumentStore>, embedder: Arc<EmbeddingClient>, config: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Result count for a message: one per `words_per_result` words, clamped
    pub fn dynamic_top_k(&self, message: &str) -> usize {
        let words = message.split_whitespace().count();
        (words / self.config.words_per_result.max(1)).clamp(self.config.min_top_k, self.config.max_top_k)
    }

    /// Rank chunks of the context's `SUCCESS` documents against `query`.
    ///
    /// A fresh query (no valid history turns) that finds fewer than
    /// `min_results_before_fallback` chunks is retried once with the relaxed
    /// threshold; if it still finds nothing the outcome is
    /// `InsufficientInformation`. With history an empty result is returned as
    /// is, since the conversation itself may carry the answer.
    pub async fn retrieve(
        &self,
        context_id: Uuid,
        query: &str,
        history: &[HistoryMessage],
    ) -> Result<RetrievalOutcome> {
        let document_ids: Vec<Uuid> = self
            .store
            .list_documents(context_id)
            .await?
            .into_iter()
            .filter(|d| d.upload_status == UploadStatus::Success)
            .map(|d| d.id)
            .collect();

        let has_history = !recent_turns(history, self.config.history_limit).is_empty();
        let top_k = self.dynamic_top_k(query);

        let chunks = if document_ids.is_empty() {
            tracing::info!("[{}] No processed documents to search", context_id);
            Vec::new()
        } else {
            let search_text = reformulate(history, query, self.config.history_limit);
            let embedding = self.embedder.embed(&search_text).await;

            let mut chunks = self
                .search(&document_ids, &embedding, top_k, self.config.similarity_threshold)
                .await?;

            if !has_history && chunks.len() < self.config.min_results_before_fallback {
                tracing::info!(
                    "[{}] {} results above similarity {}, retrying at {}",
                    context_id,
                    chunks.len(),
                    self.config.similarity_threshold,
                    self.config.relaxed_similarity_threshold
                );
                chunks = self
                    .search(&document_ids, &embedding, top_k, self.config.relaxed_similarity_threshold)
                    .await?;
            }
            chunks
        };

        if chunks.is_empty() && !has_history {
            tracing::info!("[{}] Nothing relevant found for a fresh query", context_id);
            return Ok(RetrievalOutcome::InsufficientInformation);
        }

        tracing::debug!(
            "[{}] Retrieved {} chunks (top_k {}, {} documents)",
            context_id,
            chunks.len(),
            top_k,
            document_ids.len()
        );
        let sources = source_labels(&chunks);
        Ok(RetrievalOutcome::Ranked { chunks, sources })
    }

    /// Top `top_k` chunks with similarity at least `min_similarity`
    pub async fn search(
        &self,
        document_ids: &[Uuid],
        embedding: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<ScoredChunk>> {
        self.store
            .search_by_vector(document_ids, embedding, top_k, Some(1.0 - min_similarity))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::providers::EmbeddingProvider;
    use crate::storage::SqliteStore;
    use crate::types::{ContentType, Context, Document, DocumentChunk};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const KEYWORDS: [&str; 3] = ["refund", "shipping", "warranty"];

    /// Keyword-count vectors, so similarity is predictable
    fn keyword_vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        KEYWORDS.iter().map(|k| lower.matches(k).count() as f32).collect()
    }

    #[derive(Default)]
    struct KeywordProvider {
        inputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.inputs.lock().push(text.to_string());
            Ok(keyword_vector(text))
        }

        fn dimensions(&self) -> usize {
            KEYWORDS.len()
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "keywords"
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        provider: Arc<KeywordProvider>,
        engine: RetrievalEngine,
        context: Context,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let provider = Arc::new(KeywordProvider::default());
        let config = EmbeddingConfig {
            dimensions: KEYWORDS.len(),
            ..EmbeddingConfig::default()
        };
        let embedder = Arc::new(EmbeddingClient::new(provider.clone(), &config));
        let engine = RetrievalEngine::new(store.clone(), embedder, RetrievalConfig::default());
        let context = Context::new("owner", "Support", None);
        store.insert_context(&context).await.unwrap();
        Fixture {
            store,
            provider,
            engine,
            context,
        }
    }

    /// Store a document with one chunk per text, already `SUCCESS`
    async fn seed(fixture: &Fixture, filename: &str, texts: &[(&str, u32)]) -> Document {
        let store = &fixture.store;
        let document = Document::new(fixture.context.id, filename, ContentType::PlainText, b"raw".to_vec());
        store.insert_document(&document).await.unwrap();
        store
            .transition_status(document.id, &[UploadStatus::InQueue], UploadStatus::Processing)
            .await
            .unwrap();
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, (text, page))| {
                DocumentChunk::new(&document, i as u32, text.to_string(), keyword_vector(text), *page)
            })
            .collect();
        store.commit_chunks(document.id, chunks).await.unwrap();
        document
    }

    fn contents(outcome: &RetrievalOutcome) -> Vec<&str> {
        outcome.chunks().iter().map(|c| c.chunk.content.as_str()).collect()
    }

    #[test]
    fn test_dynamic_top_k_scales_with_message_length() {
        let engine = RetrievalEngine::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(EmbeddingClient::new(Arc::new(KeywordProvider::default()), &EmbeddingConfig {
                dimensions: KEYWORDS.len(),
                ..EmbeddingConfig::default()
            })),
            RetrievalConfig::default(),
        );
        assert_eq!(engine.dynamic_top_k(""), 3);
        assert_eq!(engine.dynamic_top_k(&"word ".repeat(29)), 3);
        assert_eq!(engine.dynamic_top_k(&"word ".repeat(45)), 4);
        assert_eq!(engine.dynamic_top_k(&"word ".repeat(70)), 7);
        assert_eq!(engine.dynamic_top_k(&"word ".repeat(500)), 8);
    }

    #[tokio::test]
    async fn test_no_successful_documents_is_insufficient() {
        let fixture = fixture().await;
        let pending = Document::new(fixture.context.id, "queued.txt", ContentType::PlainText, b"refund".to_vec());
        fixture.store.insert_document(&pending).await.unwrap();

        let outcome = fixture.engine.retrieve(fixture.context.id, "refund?", &[]).await.unwrap();
        assert_eq!(outcome, RetrievalOutcome::InsufficientInformation);
        assert!(fixture.provider.inputs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_best_match_first_with_deduplicated_sources() {
        let fixture = fixture().await;
        seed(
            &fixture,
            "policy.pdf",
            &[
                ("Refund requests are accepted for 30 days", 2),
                ("A refund is paid to the original card, refund fees waived", 2),
                ("Shipping takes five days", 4),
            ],
        )
        .await;

        let outcome = fixture.engine.retrieve(fixture.context.id, "refund", &[]).await.unwrap();
        assert_eq!(
            contents(&outcome),
            vec![
                "Refund requests are accepted for 30 days",
                "A refund is paid to the original card, refund fees waived",
            ]
        );
        match outcome {
            RetrievalOutcome::Ranked { sources, .. } => {
                assert_eq!(sources.iter().map(|s| s.to_string()).collect::<Vec<_>>(), vec!["policy.pdf - page 2"]);
            }
            other => panic!("expected ranked chunks, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_weak_matches_use_relaxed_threshold() {
        let fixture = fixture().await;
        let document = seed(&fixture, "faq.md", &[("refund shipping shipping shipping", 1)]).await;

        // Similarity ~0.32 is below the strict threshold
        let strict = fixture
            .engine
            .search(&[document.id], &keyword_vector("refund"), 3, 0.5)
            .await
            .unwrap();
        assert!(strict.is_empty());

        let outcome = fixture.engine.retrieve(fixture.context.id, "refund", &[]).await.unwrap();
        assert_eq!(contents(&outcome), vec!["refund shipping shipping shipping"]);
    }

    #[tokio::test]
    async fn test_history_suppresses_sentinel_and_fallback() {
        let fixture = fixture().await;
        seed(&fixture, "faq.md", &[("refund shipping shipping shipping", 1)]).await;
        let history = vec![
            HistoryMessage::new("user", "Hello there"),
            HistoryMessage::new("assistant", "Hi! How can I help?"),
        ];

        let outcome = fixture.engine.retrieve(fixture.context.id, "thanks", &history).await.unwrap();
        assert_eq!(
            outcome,
            RetrievalOutcome::Ranked {
                chunks: Vec::new(),
                sources: Vec::new()
            }
        );

        let inputs = fixture.provider.inputs.lock();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0], "User: Hello there\nAssistant: Hi! How can I help?\nUser: thanks");
    }

    #[tokio::test]
    async fn test_larger_top_k_keeps_smaller_results() {
        let fixture = fixture().await;
        let document = seed(
            &fixture,
            "mixed.txt",
            &[
                ("refund", 1),
                ("refund warranty", 1),
                ("refund shipping", 2),
                ("refund refund warranty", 2),
                ("warranty refund shipping", 3),
                ("refund refund refund shipping", 3),
            ],
        )
        .await;
        let query = keyword_vector("refund");

        let mut previous: Vec<Uuid> = Vec::new();
        for top_k in 1..=6 {
            let ids: Vec<Uuid> = fixture
                .engine
                .search(&[document.id], &query, top_k, -1.0)
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.chunk.id)
                .collect();
            assert_eq!(ids.len(), top_k);
            assert_eq!(&ids[..previous.len()], &previous[..]);
            previous = ids;
        }
    }
}
