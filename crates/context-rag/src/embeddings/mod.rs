//! Embedding generation with retry and fallback

mod client;

pub use client::EmbeddingClient;

#[cfg(test)]
pub(crate) use client::tests::{test_config, FlakyProvider};
