//! Page-tracked text extraction from raw document bytes

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::ContentType;

/// Page number (1-based) to page text, iterated in page order
pub type PageMap = BTreeMap<u32, String>;

/// Extract page text from a stored payload.
///
/// PDFs yield one entry per page in document order, including pages without
/// text. Every text type yields a single page 1. Pure and deterministic.
pub fn extract(data: &[u8], content_type: ContentType) -> Result<PageMap> {
    match content_type {
        ContentType::Pdf => extract_pdf(data),
        ContentType::PlainText | ContentType::Markdown | ContentType::ScrapedText => {
            Ok(extract_text(data))
        }
    }
}

/// Extract using a declared MIME string, rejecting unknown types
pub fn extract_mime(data: &[u8], mime: &str) -> Result<PageMap> {
    extract(data, ContentType::from_mime(mime)?)
}

fn extract_text(data: &[u8]) -> PageMap {
    let text = String::from_utf8_lossy(data);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let mut pages = PageMap::new();
    pages.insert(1, text.to_string());
    pages
}

fn extract_pdf(data: &[u8]) -> Result<PageMap> {
    let doc = lopdf::Document::load_mem(data)
        .map_err(|e| Error::Pdf(format!("Failed to load PDF: {}", e)))?;

    let page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    if page_numbers.is_empty() {
        return Err(Error::Pdf("PDF has no pages".to_string()));
    }

    let mut pages = PageMap::new();
    let mut failed = Vec::new();

    for page_number in &page_numbers {
        match doc.extract_text(&[*page_number]) {
            Ok(text) => {
                pages.insert(*page_number, clean_page_text(&text));
            }
            Err(e) => {
                tracing::debug!("lopdf could not extract page {}: {}", page_number, e);
                failed.push(*page_number);
            }
        }
    }

    if !failed.is_empty() {
        tracing::warn!(
            "lopdf failed on {} of {} pages, retrying with pdf-extract",
            failed.len(),
            page_numbers.len()
        );
        let fallback = pdf_extract::extract_text_from_mem_by_pages(data)
            .map_err(|e| Error::Pdf(format!("pdf-extract failed: {}", e)))?;

        // pdf-extract returns pages in document order, aligned with lopdf's numbering
        for (page_number, text) in page_numbers.iter().zip(fallback) {
            if failed.contains(page_number) {
                pages.insert(*page_number, clean_page_text(&text));
            }
        }
        for page_number in failed {
            pages.entry(page_number).or_default();
        }
    }

    Ok(pages)
}

fn clean_page_text(text: &str) -> String {
    let text = text.replace('\0', "");
    let mut cleaned = text.trim_end().to_string();
    if !cleaned.is_empty() {
        cleaned.push('\n');
    }
    cleaned
}

/// Build a minimal PDF with one text line per page (empty strings give blank pages)
#[cfg(test)]
pub(crate) fn build_test_pdf(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};

    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let operations = if text.is_empty() {
            Vec::new()
        } else {
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ]
        };
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_types_are_single_page() {
        for content_type in [
            ContentType::PlainText,
            ContentType::Markdown,
            ContentType::ScrapedText,
        ] {
            let pages = extract("# Title\n\nBody text".as_bytes(), content_type).unwrap();
            assert_eq!(pages.len(), 1);
            assert_eq!(pages[&1], "# Title\n\nBody text");
        }
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let pages = extract("\u{feff}hello".as_bytes(), ContentType::PlainText).unwrap();
        assert_eq!(pages[&1], "hello");
    }

    #[test]
    fn test_unsupported_mime_is_rejected() {
        match extract_mime(b"PK\x03\x04", "application/zip") {
            Err(Error::UnsupportedFormat(mime)) => assert_eq!(mime, "application/zip"),
            other => panic!("expected UnsupportedFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_pdf_yields_one_entry_per_page() {
        let pdf = build_test_pdf(&["First page text", "", "Third page text"]);
        let pages = extract(&pdf, ContentType::Pdf).unwrap();

        assert_eq!(pages.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(pages[&1].contains("First page text"));
        assert!(pages[&2].trim().is_empty());
        assert!(pages[&3].contains("Third page text"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let pdf = build_test_pdf(&["alpha", "beta"]);
        assert_eq!(
            extract(&pdf, ContentType::Pdf).unwrap(),
            extract(&pdf, ContentType::Pdf).unwrap()
        );
    }

    #[test]
    fn test_garbage_pdf_fails() {
        assert!(matches!(
            extract(b"not a pdf", ContentType::Pdf),
            Err(Error::Pdf(_))
        ));
    }
}
