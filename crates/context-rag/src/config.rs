//! Configuration for the ingestion and retrieval pipeline
//!
//! Values come from `RagConfig::default()`, an optional TOML file, and finally
//! environment variables, in that order of precedence.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Chunking configuration
    pub chunking: ChunkingConfig,
    /// Embedding configuration
    pub embeddings: EmbeddingConfig,
    /// Processing configuration
    pub processing: ProcessingConfig,
    /// Queue configuration
    pub queue: QueueConfig,
    /// Retrieval configuration
    pub retrieval: RetrievalConfig,
    /// Answer generation configuration
    pub llm: LlmConfig,
}

impl RagConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Failed to parse config {}: {}", path.display(), e)))?;
        config.finish()
    }

    /// Load configuration from defaults and the environment only
    pub fn from_env() -> Result<Self> {
        Self::default().finish()
    }

    /// Load from `path` when given, otherwise from the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides()?;
        self.validate()?;
        Ok(self)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(path) = env_string("DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(size) = env_parse("CHUNK_SIZE")? {
            self.chunking.chunk_size = size;
        }
        if let Some(overlap) = env_parse("CHUNK_OVERLAP")? {
            self.chunking.chunk_overlap = overlap;
        }
        if let Some(provider) = env_parse("EMBEDDING_PROVIDER")? {
            self.embeddings.provider = provider;
        }
        if let Some(model) = env_string("EMBEDDING_MODEL") {
            self.embeddings.model = model;
        }
        if let Some(dimensions) = env_parse("EMBEDDING_DIMENSIONS")? {
            self.embeddings.dimensions = dimensions;
        }
        if let Some(key) = env_string("OPENAI_API_KEY") {
            self.embeddings.api_key = Some(key.clone());
            self.llm.api_key = Some(key);
        }
        if let Some(url) = env_string("OPENAI_BASE_URL") {
            self.embeddings.openai_base_url = url.clone();
            self.llm.openai_base_url = url;
        }
        if let Some(url) = env_string("OLLAMA_BASE_URL") {
            self.embeddings.ollama_base_url = url.clone();
            self.llm.ollama_base_url = url;
        }
        if let Some(provider) = env_parse("LLM_PROVIDER")? {
            self.llm.provider = provider;
        }
        if let Some(model) = env_string("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(address) = env_string("NSQD_ADDRESS") {
            self.queue.nsqd_address = Some(address);
        }
        if let Some(address) = env_string("NSQD_TCP_ADDRESS") {
            self.queue.nsqd_tcp_address = Some(address);
        }
        if let Some(address) = env_string("NSQLOOKUPD_HTTP_ADDRESS") {
            self.queue.nsqlookupd_address = Some(match env_string("NSQLOOKUPD_HTTP_PORT") {
                Some(port) => format!("{}:{}", address.trim_end_matches('/'), port.trim()),
                None => address,
            });
        }
        if let Some(max_in_flight) = env_parse("NSQ_MAX_IN_FLIGHT")? {
            self.queue.max_in_flight = max_in_flight;
        }
        if let Some(topic) = env_string("NSQ_TOPIC") {
            self.queue.topic = topic;
        }
        if let Some(channel) = env_string("NSQ_CHANNEL") {
            self.queue.channel = channel;
        }
        if let Some(background) = env_parse("BACKGROUND_PROCESSING")? {
            self.processing.background = background;
        }
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(Error::Config("chunking.chunk_size must be greater than 0".into()));
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            return Err(Error::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunking.chunk_overlap, chunking.chunk_size
            )));
        }

        let embeddings = &self.embeddings;
        if embeddings.dimensions == 0 {
            return Err(Error::Config("embeddings.dimensions must be greater than 0".into()));
        }
        if embeddings.max_attempts == 0 {
            return Err(Error::Config("embeddings.max_attempts must be at least 1".into()));
        }
        if embeddings.max_input_chars == 0 {
            return Err(Error::Config("embeddings.max_input_chars must be greater than 0".into()));
        }

        if self.processing.parallel_embeddings == 0 {
            return Err(Error::Config("processing.parallel_embeddings must be at least 1".into()));
        }
        let queue = &self.queue;
        if queue.max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".into()));
        }
        if queue.nsqd_address.is_some() && !queue.uses_nsqd() {
            return Err(Error::Config(
                "queue.nsqd_address needs queue.nsqlookupd_address or queue.nsqd_tcp_address to consume from".into(),
            ));
        }
        if queue.uses_nsqd() && queue.nsqd_address.is_none() {
            return Err(Error::Config(
                "workers consume from nsqd but queue.nsqd_address is not set for uploads to publish to".into(),
            ));
        }
        if queue.uses_nsqd() && queue.max_in_flight == 0 {
            return Err(Error::Config("queue.max_in_flight must be at least 1".into()));
        }

        let retrieval = &self.retrieval;
        if retrieval.min_top_k == 0 || retrieval.min_top_k > retrieval.max_top_k {
            return Err(Error::Config(format!(
                "retrieval top_k bounds are invalid: min {} max {}",
                retrieval.min_top_k, retrieval.max_top_k
            )));
        }
        if retrieval.words_per_result == 0 {
            return Err(Error::Config("retrieval.words_per_result must be at least 1".into()));
        }
        for (name, value) in [
            ("similarity_threshold", retrieval.similarity_threshold),
            ("relaxed_similarity_threshold", retrieval.relaxed_similarity_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "retrieval.{} must be within [-1, 1], got {}",
                    name, value
                )));
            }
        }
        if retrieval.relaxed_similarity_threshold > retrieval.similarity_threshold {
            return Err(Error::Config(
                "retrieval.relaxed_similarity_threshold must not exceed similarity_threshold".into(),
            ));
        }

        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid value for {}: {} ({})", key, raw, e))),
        None => Ok(None),
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file (documents, chunks and the durable queue)
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("context-rag.db"),
        }
    }
}

/// Text chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters
    pub chunk_size: usize,
    /// Characters repeated between consecutive chunks of the same page
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Remote provider selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP API
    #[default]
    OpenAi,
    /// Local Ollama server
    Ollama,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding backend
    pub provider: ProviderKind,
    /// Model name passed to the provider
    pub model: String,
    /// Width of every stored vector
    pub dimensions: usize,
    /// Inputs longer than this many characters are truncated before the call
    pub max_input_chars: usize,
    /// Total attempts per text, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry
    pub base_delay_ms: u64,
    /// Ceiling for a single backoff delay
    pub max_delay_ms: u64,
    /// Timeout for one remote call
    pub request_timeout_secs: u64,
    /// OpenAI-compatible base URL
    pub openai_base_url: String,
    /// Ollama base URL
    pub ollama_base_url: String,
    /// API key for the OpenAI-compatible endpoint
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "text-embedding-ada-002".to_string(),
            dimensions: 1536,
            max_input_chars: 8000,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            request_timeout_secs: 30,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            api_key: None,
        }
    }
}

/// Processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Concurrent embedding calls, shared by every document in the process
    pub parallel_embeddings: usize,
    /// Enqueue uploads for the background worker instead of processing inline
    pub background: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            parallel_embeddings: 4,
            background: true,
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Topic document messages are published to
    pub topic: String,
    /// Consumer channel name
    pub channel: String,
    /// Number of consumer loops per worker process
    pub workers: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval_ms: u64,
    /// Seconds before an unacknowledged delivery becomes visible again
    pub visibility_timeout_secs: u64,
    /// Deliveries per message before it is parked as dead
    pub max_attempts: u32,
    /// Delay before a requeued message is visible again
    pub requeue_delay_ms: u64,
    /// nsqd HTTP address; when set, uploads publish there instead of the local queue
    pub nsqd_address: Option<String>,
    /// nsqlookupd HTTP address workers discover nsqd producers through
    pub nsqlookupd_address: Option<String>,
    /// nsqd TCP address workers connect to directly when no lookupd is set
    pub nsqd_tcp_address: Option<String>,
    /// Messages an nsqd consumer may hold unacknowledged
    pub max_in_flight: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic: "messages".to_string(),
            channel: "processor".to_string(),
            workers: 1,
            poll_interval_ms: 500,
            visibility_timeout_secs: 600,
            max_attempts: 5,
            requeue_delay_ms: 1000,
            nsqd_address: None,
            nsqlookupd_address: None,
            nsqd_tcp_address: None,
            max_in_flight: 10,
        }
    }
}

impl QueueConfig {
    /// Whether workers consume from nsqd instead of the local queue
    pub fn uses_nsqd(&self) -> bool {
        self.nsqlookupd_address.is_some() || self.nsqd_tcp_address.is_some()
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// User/assistant exchanges folded into the search query
    pub history_limit: usize,
    /// Lower bound for the dynamic result count
    pub min_top_k: usize,
    /// Upper bound for the dynamic result count
    pub max_top_k: usize,
    /// Query words per additional result
    pub words_per_result: usize,
    /// Minimum cosine similarity for the first fetch
    pub similarity_threshold: f32,
    /// Minimum cosine similarity for the fallback fetch
    pub relaxed_similarity_threshold: f32,
    /// Fewer results than this on a fresh query triggers the fallback fetch
    pub min_results_before_fallback: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            history_limit: 5,
            min_top_k: 3,
            max_top_k: 8,
            words_per_result: 10,
            similarity_threshold: 0.5,
            relaxed_similarity_threshold: 0.0,
            min_results_before_fallback: 2,
        }
    }
}

/// Answer generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Chat backend
    pub provider: ProviderKind,
    /// Generation model name
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens in the answer
    pub max_tokens: u32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// OpenAI-compatible base URL
    pub openai_base_url: String,
    /// Ollama base URL
    pub ollama_base_url: String,
    /// API key for the OpenAI-compatible endpoint
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "gpt-4".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout_secs: 120,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            api_key: None,
        }
    }
}
