//! Document ingestion: page-tracked extraction and chunking

mod chunker;
mod extractor;

pub use chunker::{PageChunk, PageChunker};
pub use extractor::{extract, extract_mime, PageMap};

#[cfg(test)]
pub(crate) use extractor::build_test_pdf;
