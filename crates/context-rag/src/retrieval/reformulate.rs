//! Folds recent chat turns into the retrieval query

use crate::types::chat::recent_turns;
use crate::types::HistoryMessage;

/// Build the search string for `query`.
///
/// Up to `limit` recent exchanges are rendered as `"<Role>: <content>"` lines,
/// oldest first, followed by `"User: <query>"`.
pub fn reformulate(history: &[HistoryMessage], query: &str, limit: usize) -> String {
    let mut lines: Vec<String> = recent_turns(history, limit)
        .into_iter()
        .map(|(role, content)| format!("{}: {}", role.label(), content))
        .collect();
    lines.push(format!("User: {}", query));
    lines.join("\n")
}
