//! Text chunking with page tracking

use unicode_segmentation::UnicodeSegmentation;

use crate::config::ChunkingConfig;
use super::extractor::PageMap;

/// A chunk of page text, in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChunk {
    /// Page the text came from
    pub page: u32,
    /// Trimmed, never empty
    pub text: String,
}

/// Splits pages into overlapping chunks of bounded size.
///
/// Sizes are measured in characters. Splits prefer paragraph breaks, then
/// sentence bounds, then word bounds, and only cut inside a word when a single
/// word is longer than `chunk_size`. Overlap never crosses a page boundary.
#[derive(Debug, Clone)]
pub struct PageChunker {
    /// Maximum chunk size in characters
    chunk_size: usize,
    /// Characters of trailing context repeated at the start of the next chunk
    overlap: usize,
}

impl PageChunker {
    /// Create a new chunker. `overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunk every page in increasing page order
    pub fn chunk(&self, pages: &PageMap) -> Vec<PageChunk> {
        let mut chunks = Vec::new();
        for (page, text) in pages {
            for text in self.chunk_text(text) {
                chunks.push(PageChunk { page: *page, text });
            }
        }
        chunks
    }

    /// Chunk a single page of text
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut units = Vec::new();
        self.split_units(text, 0, &mut units);

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;
        // `current` holds text beyond the overlap carried from the last chunk
        let mut fresh = false;
        // Whitespace was dropped at a boundary and is owed before the next word
        let mut pending_gap = false;

        for unit in units {
            let unit_len = char_len(unit);

            if unit.trim().is_empty() {
                if current_len + unit_len <= self.chunk_size {
                    current.push_str(unit);
                    current_len += unit_len;
                } else {
                    pending_gap = true;
                }
                continue;
            }

            let gap = usize::from(pending_gap);
            if current_len + gap + unit_len > self.chunk_size {
                if fresh {
                    push_trimmed(&mut chunks, &current);
                }
                current = self.overlap_tail(&current, self.chunk_size.saturating_sub(unit_len + gap));
                current_len = char_len(&current);
                fresh = false;
            }

            if pending_gap && !current.is_empty() && !current.ends_with(char::is_whitespace) {
                current.push(' ');
                current_len += 1;
            }
            pending_gap = false;

            current.push_str(unit);
            current_len += unit_len;
            fresh = true;
        }

        if fresh {
            push_trimmed(&mut chunks, &current);
        }
        chunks
    }

    /// Break text into units no longer than `chunk_size`, coarsest boundary first
    fn split_units<'a>(&self, text: &'a str, level: usize, out: &mut Vec<&'a str>) {
        if char_len(text) <= self.chunk_size {
            out.push(text);
            return;
        }

        let parts: Vec<&str> = match level {
            0 => text.split_inclusive("\n\n").collect(),
            1 => text.split_sentence_bounds().collect(),
            2 => text.split_word_bounds().collect(),
            _ => {
                hard_cut(text, self.chunk_size, out);
                return;
            }
        };

        for part in parts {
            self.split_units(part, level + 1, out);
        }
    }

    /// Trailing context of `text`, at most `max_chars` long, starting on a word
    fn overlap_tail(&self, text: &str, max_chars: usize) -> String {
        let budget = self.overlap.min(max_chars);
        if budget == 0 {
            return String::new();
        }

        // Trailing whitespace is kept: the tail is followed by the unit that came after it
        let total = char_len(text);
        if total <= budget {
            return text.trim_start().to_string();
        }

        let start = text
            .char_indices()
            .nth(total - budget)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let tail = &text[start..];

        // Don't start in the middle of a word
        let starts_clean = text[..start]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        if starts_clean {
            return tail.trim_start().to_string();
        }

        if let Some(pos) = tail.find(". ") {
            return tail[pos + 2..].trim_start().to_string();
        }
        if let Some(pos) = tail.find(char::is_whitespace) {
            return tail[pos..].trim_start().to_string();
        }

        // Only a word fragment fits; carry nothing
        String::new()
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn hard_cut<'a>(text: &'a str, size: usize, out: &mut Vec<&'a str>) {
    let mut start = 0;
    let mut count = 0;
    for (i, _) in text.char_indices() {
        if count == size {
            out.push(&text[start..i]);
            start = i;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
}
