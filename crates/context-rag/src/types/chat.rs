//! Conversation history supplied with a chat request

use serde::{Deserialize, Serialize};

/// Speaker of a history turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Parse a role name, case-insensitively. Anything else (e.g. `system`) is rejected.
    pub fn parse(role: &str) -> Option<Self> {
        match role.trim().to_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// Label used when rendering a turn into a search query
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }

    /// Role name on the chat completion wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message of client-supplied history. Fields are optional because the
/// client is not trusted to send well-formed entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl HistoryMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            content: Some(content.into()),
        }
    }

    /// The validated turn, or `None` for a malformed entry
    pub fn turn(&self) -> Option<(ChatRole, &str)> {
        let role = ChatRole::parse(self.role.as_deref()?)?;
        let content = self.content.as_deref()?.trim();
        if content.is_empty() {
            return None;
        }
        Some((role, content))
    }
}

/// Valid turns among the most recent `2 * limit` messages, oldest first
pub fn recent_turns(history: &[HistoryMessage], limit: usize) -> Vec<(ChatRole, &str)> {
    let window = limit.saturating_mul(2);
    let start = history.len().saturating_sub(window);
    history[start..].iter().filter_map(HistoryMessage::turn).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_validation() {
        assert_eq!(
            HistoryMessage::new("USER", "  hi ").turn(),
            Some((ChatRole::User, "hi"))
        );
        assert!(HistoryMessage::new("system", "be nice").turn().is_none());
        assert!(HistoryMessage::new("assistant", "   ").turn().is_none());
        assert!(HistoryMessage { role: None, content: Some("x".into()) }.turn().is_none());
        assert!(HistoryMessage { role: Some("user".into()), content: None }.turn().is_none());
    }

    #[test]
    fn test_recent_turns_window_applies_before_filtering() {
        let history = vec![
            HistoryMessage::new("user", "old question"),
            HistoryMessage::new("assistant", "old answer"),
            HistoryMessage::new("system", "ignored"),
            HistoryMessage::new("user", "new question"),
        ];

        let turns = recent_turns(&history, 1);
        assert_eq!(turns, vec![(ChatRole::User, "new question")]);

        let turns = recent_turns(&history, 5);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0], (ChatRole::User, "old question"));
    }

    #[test]
    fn test_history_deserializes_with_missing_fields() {
        let history: Vec<HistoryMessage> =
            serde_json::from_str(r#"[{"role":"user"},{"content":"orphan"},{"role":"assistant","content":"ok"}]"#)
                .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(recent_turns(&history, 5).len(), 1);
    }
}
