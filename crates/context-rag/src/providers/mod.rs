//! Remote collaborators: embedding and answer generation
//!
//! Both sit behind traits so the pipeline can be built with OpenAI, Ollama,
//! or test doubles.

pub mod embedding;
pub mod llm;
pub mod ollama;
pub mod openai;

pub use embedding::EmbeddingProvider;
pub use llm::AnswerGenerator;
pub use ollama::{OllamaChat, OllamaEmbedder};
pub use openai::{OpenAiChat, OpenAiEmbedder};
