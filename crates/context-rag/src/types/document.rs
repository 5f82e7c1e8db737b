//! Context, document and chunk types with upload lifecycle tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// MIME pseudo-type for text produced by the web scraper
pub const SCRAPED_TEXT_MIME: &str = "text/url-scrape";

/// A named collection of documents owned by one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Context {
    pub id: Uuid,
    pub owner_id: String,
    /// Unique per owner
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    /// Create a new context
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id: owner_id.into(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Content types accepted for ingestion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// application/pdf
    Pdf,
    /// text/plain
    PlainText,
    /// text/markdown
    Markdown,
    /// Text extracted from a web page
    ScrapedText,
}

impl ContentType {
    /// Parse a declared MIME type. Parameters such as `; charset=utf-8` are ignored.
    pub fn from_mime(mime: &str) -> Result<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();

        match essence.as_str() {
            "application/pdf" => Ok(Self::Pdf),
            "text/plain" => Ok(Self::PlainText),
            "text/markdown" => Ok(Self::Markdown),
            SCRAPED_TEXT_MIME => Ok(Self::ScrapedText),
            _ => Err(Error::UnsupportedFormat(mime.to_string())),
        }
    }

    /// Canonical MIME string
    pub fn as_mime(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::PlainText => "text/plain",
            Self::Markdown => "text/markdown",
            Self::ScrapedText => SCRAPED_TEXT_MIME,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// Ingestion lifecycle of a document
///
/// `IN_QUEUE -> PROCESSING -> SUCCESS | FAILED_PROCESSING`. A failed document
/// may re-enter `PROCESSING` when a retry is explicitly requested or the queue
/// redelivers its message. `SUCCESS` is final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    InQueue,
    Processing,
    Success,
    FailedProcessing,
}

impl UploadStatus {
    /// Stored string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InQueue => "IN_QUEUE",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::FailedProcessing => "FAILED_PROCESSING",
        }
    }

    /// States a coordinator pass may start from
    pub const PROCESSABLE: [UploadStatus; 2] = [Self::InQueue, Self::FailedProcessing];

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (Self::InQueue, Self::Processing)
                | (Self::FailedProcessing, Self::Processing)
                | (Self::Processing, Self::Success)
                | (Self::Processing, Self::FailedProcessing)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IN_QUEUE" => Ok(Self::InQueue),
            "PROCESSING" => Ok(Self::Processing),
            "SUCCESS" => Ok(Self::Success),
            "FAILED_PROCESSING" => Ok(Self::FailedProcessing),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// An uploaded document. Raw bytes are stored at upload time and never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Time-sortable id (UUIDv7)
    pub id: Uuid,
    pub context_id: Uuid,
    pub filename: String,
    pub content_type: ContentType,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub upload_status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a new document in `IN_QUEUE`
    pub fn new(
        context_id: Uuid,
        filename: impl Into<String>,
        content_type: ContentType,
        data: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            context_id,
            filename: filename.into(),
            content_type,
            data,
            upload_status: UploadStatus::InQueue,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A span of document text with its embedding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// 0-based, contiguous in emission order
    pub chunk_index: u32,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    /// Page the text came from (1-based)
    pub source_page: u32,
    /// Denormalized from the document for citations
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

impl DocumentChunk {
    /// Create a new chunk
    pub fn new(
        document: &Document,
        chunk_index: u32,
        content: String,
        embedding: Vec<f32>,
        source_page: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            document_id: document.id,
            chunk_index,
            content,
            embedding,
            source_page,
            filename: document.filename.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_from_mime() {
        assert_eq!(ContentType::from_mime("application/pdf").unwrap(), ContentType::Pdf);
        assert_eq!(
            ContentType::from_mime("text/plain; charset=utf-8").unwrap(),
            ContentType::PlainText
        );
        assert_eq!(ContentType::from_mime("Text/Markdown").unwrap(), ContentType::Markdown);
        assert_eq!(
            ContentType::from_mime(SCRAPED_TEXT_MIME).unwrap(),
            ContentType::ScrapedText
        );

        match ContentType::from_mime("image/png") {
            Err(Error::UnsupportedFormat(mime)) => assert_eq!(mime, "image/png"),
            other => panic!("expected UnsupportedFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_status_round_trip_and_rejection() {
        for status in [
            UploadStatus::InQueue,
            UploadStatus::Processing,
            UploadStatus::Success,
            UploadStatus::FailedProcessing,
        ] {
            assert_eq!(status.as_str().parse::<UploadStatus>().unwrap(), status);
        }
        assert!(matches!("FAILED".parse::<UploadStatus>(), Err(Error::InvalidStatus(_))));
        assert!("IN QUEUE".parse::<UploadStatus>().is_err());
    }

    #[test]
    fn test_transitions() {
        use UploadStatus::*;
        assert!(InQueue.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(FailedProcessing));
        assert!(FailedProcessing.can_transition_to(Processing));

        assert!(!InQueue.can_transition_to(Success));
        assert!(!Success.can_transition_to(Processing));
        assert!(!Success.can_transition_to(FailedProcessing));
        assert!(!Processing.can_transition_to(InQueue));
    }

    #[test]
    fn test_new_document_is_queued_with_v7_id() {
        let context = Context::new("owner", "notes", None);
        let doc = Document::new(context.id, "a.txt", ContentType::PlainText, b"a".to_vec());
        assert_eq!(doc.upload_status, UploadStatus::InQueue);
        assert_eq!(doc.id.get_version_num(), 7);
        assert_eq!(doc.context_id, context.id);
    }
}
