//! Prompt construction and source attribution for answer generation

pub mod citation;
pub mod prompt;

pub use citation::{format_sources, source_labels};
pub use prompt::{ChatMessage, PromptBuilder};
