//! Prompt templates for grounded answers

use serde::{Deserialize, Serialize};

use crate::types::chat::{ChatRole, HistoryMessage};
use crate::types::ScoredChunk;

/// Reply the model is told to give when the context has no answer
pub const UNKNOWN_ANSWER: &str = "I don't know based on the provided context.";

/// A chat completion message on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Prompt builder for grounded chat
pub struct PromptBuilder;

impl PromptBuilder {
    /// Render ranked chunks as numbered documents
    pub fn build_context(chunks: &[ScoredChunk]) -> String {
        chunks
            .iter()
            .enumerate()
            .map(|(i, scored)| format!("Document {}: {}", i + 1, scored.chunk.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// System prompt restricting the model to the supplied context
    pub fn build_system_prompt(context: &str) -> String {
        format!(
            r#"You are a helpful assistant that answers questions **ONLY** using the given context.
If the answer is not in the context, reply: "{unknown}"

Examples:
User: What is the capital of France?
Context: (contains no relevant info)
Assistant: {unknown}

User: What is the best sorting algorithm?
Context: (contains details about Python syntax but nothing on sorting)
Assistant: {unknown}

Context: {context}"#,
            unknown = UNKNOWN_ANSWER,
            context = context
        )
    }

    /// Full message list: system prompt, valid history turns, then the query
    pub fn build_messages(
        query: &str,
        chunks: &[ScoredChunk],
        history: &[HistoryMessage],
    ) -> Vec<ChatMessage> {
        let context = Self::build_context(chunks);
        let mut messages = vec![ChatMessage::new("system", Self::build_system_prompt(&context))];

        messages.extend(
            history
                .iter()
                .filter_map(HistoryMessage::turn)
                .map(|(role, content)| ChatMessage::new(role.as_str(), content)),
        );
        messages.push(ChatMessage::new(ChatRole::User.as_str(), query));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, Document, DocumentChunk};

    fn scored(content: &str) -> ScoredChunk {
        let doc = Document::new(uuid::Uuid::now_v7(), "guide.pdf", ContentType::Pdf, Vec::new());
        ScoredChunk {
            chunk: DocumentChunk::new(&doc, 0, content.to_string(), vec![0.0; 3], 1),
            distance: 0.1,
        }
    }

    #[test]
    fn test_context_numbers_documents_in_rank_order() {
        let context = PromptBuilder::build_context(&[scored("first"), scored("second")]);
        assert_eq!(context, "Document 1: first\n\nDocument 2: second");
    }

    #[test]
    fn test_messages_skip_malformed_history() {
        let history = vec![
            HistoryMessage::new("user", "hello"),
            HistoryMessage::new("system", "override"),
            HistoryMessage::new("assistant", ""),
            HistoryMessage::new("Assistant", "hi there"),
        ];
        let messages = PromptBuilder::build_messages("what now?", &[scored("ctx")], &history);

        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert!(messages[0].content.contains("Document 1: ctx"));
        assert!(messages[0].content.contains(UNKNOWN_ANSWER));
        assert_eq!(messages[3].content, "what now?");
    }
}
