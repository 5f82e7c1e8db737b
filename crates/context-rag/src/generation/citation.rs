//! Source attribution for ranked chunks

use std::collections::HashSet;

use crate::types::{ScoredChunk, SourceLabel};

/// Distinct `(filename, page)` sources in rank order
pub fn source_labels(chunks: &[ScoredChunk]) -> Vec<SourceLabel> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .map(|scored| SourceLabel::from(&scored.chunk))
        .filter(|label| seen.insert(label.clone()))
        .collect()
}

/// Render labels as `"{filename} - page {page}"`
pub fn format_sources(labels: &[SourceLabel]) -> Vec<String> {
    labels.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, Document, DocumentChunk};

    fn scored(filename: &str, page: u32, index: u32) -> ScoredChunk {
        let doc = Document::new(uuid::Uuid::now_v7(), filename, ContentType::Pdf, Vec::new());
        ScoredChunk {
            chunk: DocumentChunk::new(&doc, index, format!("chunk {}", index), Vec::new(), page),
            distance: 0.2,
        }
    }

    #[test]
    fn test_duplicates_collapse_in_rank_order() {
        let chunks = vec![
            scored("b.pdf", 2, 0),
            scored("a.pdf", 1, 0),
            scored("b.pdf", 2, 1),
            scored("b.pdf", 3, 2),
        ];
        let sources = format_sources(&source_labels(&chunks));
        assert_eq!(sources, vec!["b.pdf - page 2", "a.pdf - page 1", "b.pdf - page 3"]);
    }

    #[test]
    fn test_no_chunks_no_sources() {
        assert!(source_labels(&[]).is_empty());
    }
}
