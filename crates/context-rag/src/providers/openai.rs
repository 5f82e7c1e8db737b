//! OpenAI-compatible providers for embeddings and chat completions

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::error::{Error, Result};
use crate::generation::{ChatMessage, PromptBuilder};
use crate::types::{HistoryMessage, ScoredChunk};

use super::embedding::EmbeddingProvider;
use super::llm::AnswerGenerator;

/// Thin JSON client for an OpenAI-compatible API
#[derive(Clone)]
struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// POST `body` to `path`; a non-2xx status becomes `Err(status, body)`
    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> std::result::Result<R, String> {
        let mut request = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{} {}", status, body));
        }

        response
            .json()
            .await
            .map_err(|e| format!("failed to parse response: {}", e))
    }

    async fn get_ok(&self, path: &str) -> bool {
        let mut request = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        matches!(request.send().await, Ok(resp) if resp.status().is_success())
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// OpenAI embedding provider (`/embeddings`)
pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if config.api_key.is_none() {
            tracing::warn!("No OpenAI API key configured; embedding requests will be unauthenticated");
        }
        Ok(Self {
            client: OpenAiClient::new(
                &config.openai_base_url,
                config.api_key.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )?,
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            model: &self.model,
            input: text,
        };

        let response: EmbedResponse = self
            .client
            .post("/embeddings", &request)
            .await
            .map_err(|e| Error::embedding(format!("OpenAI embedding {}", e)))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::embedding("No embedding in OpenAI response"))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.client.get_ok("/models").await)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

/// OpenAI chat completion answer generator
pub struct OpenAiChat {
    client: OpenAiClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChat {
    /// Create a new OpenAI chat provider
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::new(
                &config.openai_base_url,
                config.api_key.clone(),
                Duration::from_secs(config.timeout_secs),
            )?,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiChat {
    async fn generate(
        &self,
        query: &str,
        chunks: &[ScoredChunk],
        history: &[HistoryMessage],
    ) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages: PromptBuilder::build_messages(query, chunks, history),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response: CompletionResponse = self
            .client
            .post("/chat/completions", &request)
            .await
            .map_err(|e| Error::llm(format!("OpenAI chat completion {}", e)))?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::llm("No choices in OpenAI response"))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
