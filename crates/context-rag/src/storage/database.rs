//! SQLite database for contexts, documents and embedded chunks
//!
//! Ranking happens inside SQLite through the `cosine_distance` scalar function
//! registered on every connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::DocumentStore;
use crate::error::{Error, Result};
use crate::types::{ContentType, Context, Document, DocumentChunk, ScoredChunk, UploadStatus};

const DOCUMENT_COLUMNS: &str =
    "id, context_id, filename, content_type, upload_status, created_at, updated_at";

const CHUNK_COLUMNS: &str =
    "c.id, c.document_id, c.chunk_index, c.content, c.embedding, c.source_page, c.filename, c.created_at";

/// SQLite-backed document store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open database {}: {}", path.display(), e)))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory database: {}", e)))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        register_functions(&conn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Shared connection, for components that keep their tables in the same file
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            PRAGMA foreign_keys=ON;
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contexts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, name)
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                context_id TEXT NOT NULL REFERENCES contexts(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                data BLOB NOT NULL,
                upload_status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_context ON documents(context_id);
            CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(upload_status);

            CREATE TABLE IF NOT EXISTS document_chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                source_page INTEGER NOT NULL,
                filename TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(document_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id);
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_context(&self, context: &Context) -> Result<()> {
        let context = context.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO contexts (id, owner_id, name, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    context.id.to_string(),
                    context.owner_id,
                    context.name,
                    context.description,
                    context.created_at,
                    context.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_context(&self, id: Uuid) -> Result<Option<Context>> {
        self.with_conn(move |conn| {
            let context = conn
                .query_row(
                    "SELECT owner_id, name, description, created_at, updated_at
                     FROM contexts WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok(Context {
                            id,
                            owner_id: row.get(0)?,
                            name: row.get(1)?,
                            description: row.get(2)?,
                            created_at: row.get(3)?,
                            updated_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(context)
        })
        .await
    }

    async fn delete_context(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM contexts WHERE id = ?1", params![id.to_string()])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn insert_document(&self, document: &Document) -> Result<()> {
        let document = document.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (id, context_id, filename, content_type, data, upload_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    document.id.to_string(),
                    document.context_id.to_string(),
                    document.filename,
                    document.content_type.as_mime(),
                    document.data,
                    document.upload_status.as_str(),
                    document.created_at,
                    document.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {}, data FROM documents WHERE id = ?1", DOCUMENT_COLUMNS);
            let row = conn
                .query_row(&sql, params![id.to_string()], |row| {
                    let raw = RawDocument::from_row(row)?;
                    let data: Vec<u8> = row.get(7)?;
                    Ok((raw, data))
                })
                .optional()?;

            row.map(|(raw, data)| {
                let mut document = raw.into_document()?;
                document.data = data;
                Ok(document)
            })
            .transpose()
        })
        .await
    }

    async fn list_documents(&self, context_id: Uuid) -> Result<Vec<Document>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM documents WHERE context_id = ?1 ORDER BY created_at, id",
                DOCUMENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![context_id.to_string()], RawDocument::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(RawDocument::into_document).collect()
        })
        .await
    }

    async fn delete_document(&self, id: Uuid) -> Result<bool> {
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn transition_status(&self, id: Uuid, from: &[UploadStatus], to: UploadStatus) -> Result<bool> {
        if let Some(bad) = from.iter().find(|s| !s.can_transition_to(to)) {
            return Err(Error::InvalidStatus(format!("{} -> {}", bad, to)));
        }
        if from.is_empty() {
            return Ok(false);
        }

        let from: Vec<UploadStatus> = from.to_vec();
        self.with_conn(move |conn| {
            let placeholders = placeholders(3, from.len());
            let sql = format!(
                "UPDATE documents SET upload_status = ?1, updated_at = ?2
                 WHERE id = ?3 AND upload_status IN ({})",
                placeholders
            );

            let mut values: Vec<Box<dyn ToSql>> = vec![
                Box::new(to.as_str()),
                Box::new(Utc::now()),
                Box::new(id.to_string()),
            ];
            values.extend(from.iter().map(|s| Box::new(s.as_str()) as Box<dyn ToSql>));

            let updated = conn.execute(&sql, params_from_iter(values.iter()))?;
            Ok(updated == 1)
        })
        .await
    }

    async fn commit_chunks(&self, document_id: Uuid, chunks: Vec<DocumentChunk>) -> Result<bool> {
        if chunks.is_empty() {
            return Err(Error::processing(format!(
                "[{}] refusing to mark a document with no chunks as SUCCESS",
                document_id
            )));
        }
        if let Some(stray) = chunks.iter().find(|c| c.document_id != document_id) {
            return Err(Error::Internal(format!(
                "chunk {} belongs to document {}, not {}",
                stray.id, stray.document_id, document_id
            )));
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let flipped = tx.execute(
                "UPDATE documents SET upload_status = ?1, updated_at = ?2
                 WHERE id = ?3 AND upload_status = ?4",
                params![
                    UploadStatus::Success.as_str(),
                    Utc::now(),
                    document_id.to_string(),
                    UploadStatus::Processing.as_str(),
                ],
            )?;
            if flipped == 0 {
                // Dropping the transaction rolls it back
                return Ok(false);
            }

            tx.execute(
                "DELETE FROM document_chunks WHERE document_id = ?1",
                params![document_id.to_string()],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO document_chunks
                     (id, document_id, chunk_index, content, embedding, source_page, filename, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for chunk in &chunks {
                    stmt.execute(params![
                        chunk.id.to_string(),
                        chunk.document_id.to_string(),
                        chunk.chunk_index,
                        chunk.content,
                        encode_embedding(&chunk.embedding),
                        chunk.source_page,
                        chunk.filename,
                        chunk.created_at,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get_chunks(&self, document_id: Uuid) -> Result<Vec<DocumentChunk>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM document_chunks c WHERE c.document_id = ?1 ORDER BY c.chunk_index",
                CHUNK_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![document_id.to_string()], RawChunk::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(RawChunk::into_chunk).collect()
        })
        .await
    }

    async fn count_chunks(&self, document_id: Uuid) -> Result<usize> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM document_chunks WHERE document_id = ?1",
                params![document_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn delete_chunks(&self, document_id: Uuid) -> Result<usize> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM document_chunks WHERE document_id = ?1",
                params![document_id.to_string()],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn search_by_vector(
        &self,
        document_ids: &[Uuid],
        query: &[f32],
        limit: usize,
        max_distance: Option<f32>,
    ) -> Result<Vec<ScoredChunk>> {
        if document_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = document_ids.iter().map(Uuid::to_string).collect();
        let query = encode_embedding(query);

        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT * FROM (
                    SELECT {}, cosine_distance(c.embedding, ?1) AS distance
                    FROM document_chunks c
                    JOIN documents d ON d.id = c.document_id
                    WHERE d.upload_status = ?2 AND c.document_id IN ({})
                 )
                 WHERE distance <= ?3
                 ORDER BY distance ASC, document_id ASC, chunk_index ASC
                 LIMIT ?4",
                CHUNK_COLUMNS,
                placeholders(5, ids.len())
            );

            let mut values: Vec<Value> = vec![
                Value::Blob(query),
                Value::Text(UploadStatus::Success.as_str().to_string()),
                Value::Real(max_distance.map_or(f64::MAX, f64::from)),
                Value::Integer(limit as i64),
            ];
            values.extend(ids.into_iter().map(Value::Text));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), |row| {
                    let raw = RawChunk::from_row(row)?;
                    let distance: f64 = row.get(8)?;
                    Ok((raw, distance))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(raw, distance)| {
                    Ok(ScoredChunk {
                        chunk: raw.into_chunk()?,
                        distance: distance as f32,
                    })
                })
                .collect()
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

/// Document columns as stored, before enum and id validation
struct RawDocument {
    id: String,
    context_id: String,
    filename: String,
    content_type: String,
    upload_status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawDocument {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            context_id: row.get(1)?,
            filename: row.get(2)?,
            content_type: row.get(3)?,
            upload_status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        Ok(Document {
            id: parse_uuid(&self.id)?,
            context_id: parse_uuid(&self.context_id)?,
            filename: self.filename,
            content_type: ContentType::from_mime(&self.content_type)?,
            data: Vec::new(),
            upload_status: UploadStatus::from_str(&self.upload_status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RawChunk {
    id: String,
    document_id: String,
    chunk_index: u32,
    content: String,
    embedding: Vec<u8>,
    source_page: u32,
    filename: String,
    created_at: DateTime<Utc>,
}

impl RawChunk {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: row.get(2)?,
            content: row.get(3)?,
            embedding: row.get(4)?,
            source_page: row.get(5)?,
            filename: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_chunk(self) -> Result<DocumentChunk> {
        Ok(DocumentChunk {
            id: parse_uuid(&self.id)?,
            document_id: parse_uuid(&self.document_id)?,
            chunk_index: self.chunk_index,
            content: self.content,
            embedding: decode_embedding(&self.embedding),
            source_page: self.source_page,
            filename: self.filename,
            created_at: self.created_at,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Internal(format!("Invalid id '{}' in database: {}", raw, e)))
}

/// `?start, ?start+1, ...` for `count` parameters
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "cosine_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = ctx
                .get_raw(0)
                .as_blob()
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            let b = ctx
                .get_raw(1)
                .as_blob()
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(blob_cosine_distance(a, b))
        },
    )
    .map_err(|e| Error::Internal(format!("Failed to register cosine_distance: {}", e)))
}

/// Little-endian `f32` blob
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of `encode_embedding`; a trailing partial value is ignored
pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(le_f32)
        .collect()
}

/// `1 - cosine similarity`, or 1.0 when either vector has zero norm or widths differ
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 1.0;
    }
    distance_from_pairs(a.iter().copied().zip(b.iter().copied())) as f32
}

fn blob_cosine_distance(a: &[u8], b: &[u8]) -> f64 {
    if a.len() != b.len() || a.len() % 4 != 0 {
        return 1.0;
    }
    distance_from_pairs(
        a.chunks_exact(4)
            .zip(b.chunks_exact(4))
            .map(|(x, y)| (le_f32(x), le_f32(y))),
    )
}

fn le_f32(bytes: &[u8]) -> f32 {
    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn distance_from_pairs(pairs: impl Iterator<Item = (f32, f32)>) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in pairs {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (SqliteStore, Context) {
        let store = SqliteStore::in_memory().unwrap();
        let context = Context::new("user-1", "Handbook", None);
        store.insert_context(&context).await.unwrap();
        (store, context)
    }

    async fn processing_document(store: &SqliteStore, context: &Context, filename: &str) -> Document {
        let document = Document::new(context.id, filename, ContentType::PlainText, b"body".to_vec());
        store.insert_document(&document).await.unwrap();
        assert!(store
            .transition_status(document.id, &[UploadStatus::InQueue], UploadStatus::Processing)
            .await
            .unwrap());
        document
    }

    fn chunk(document: &Document, index: u32, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk::new(document, index, format!("chunk {}", index), embedding, 1)
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rag.db");

        let context = Context::new("user-1", "Handbook", None);
        {
            let store = SqliteStore::new(&path).unwrap();
            store.insert_context(&context).await.unwrap();
            let document = processing_document(&store, &context, "a.txt").await;
            tokio_test::assert_ok!(store.commit_chunks(document.id, vec![chunk(&document, 0, vec![1.0, 0.0])]).await);
        }

        let reopened = SqliteStore::new(&path).unwrap();
        let documents = reopened.list_documents(context.id).await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].upload_status, UploadStatus::Success);
        assert_eq!(reopened.count_chunks(documents[0].id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_document_round_trip_keeps_raw_bytes() {
        let (store, context) = seeded().await;
        let document = Document::new(context.id, "notes.md", ContentType::Markdown, b"# Notes".to_vec());
        store.insert_document(&document).await.unwrap();

        let loaded = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(loaded.data, b"# Notes");
        assert_eq!(loaded.content_type, ContentType::Markdown);
        assert_eq!(loaded.upload_status, UploadStatus::InQueue);

        let listed = store.list_documents(context.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "a.txt").await;

        // Second writer loses
        assert!(!store
            .transition_status(document.id, &[UploadStatus::InQueue], UploadStatus::Processing)
            .await
            .unwrap());
        assert!(store
            .transition_status(document.id, &[UploadStatus::Processing], UploadStatus::FailedProcessing)
            .await
            .unwrap());
        assert!(store
            .transition_status(document.id, &UploadStatus::PROCESSABLE, UploadStatus::Processing)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_transition_stamps_updated_at_like_inserts() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "a.txt").await;

        let conn = store.connection();
        let (created, updated, same_shape, ordered): (DateTime<Utc>, DateTime<Utc>, bool, bool) = conn
            .lock()
            .query_row(
                "SELECT created_at, updated_at,
                        substr(created_at, 11, 1) = substr(updated_at, 11, 1)
                            AND substr(created_at, -6) = substr(updated_at, -6),
                        updated_at >= created_at
                 FROM documents WHERE id = ?1",
                params![document.id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();

        assert!(same_shape);
        assert!(ordered);
        assert!(updated >= created);

        let reloaded = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(reloaded.updated_at, updated);
        assert_eq!(reloaded.upload_status, UploadStatus::Processing);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "a.txt").await;

        let result = store
            .transition_status(document.id, &[UploadStatus::Success], UploadStatus::Processing)
            .await;
        assert!(matches!(result, Err(Error::InvalidStatus(_))));
    }

    #[tokio::test]
    async fn test_commit_chunks_requires_processing() {
        let (store, context) = seeded().await;
        let document = Document::new(context.id, "a.txt", ContentType::PlainText, b"x".to_vec());
        store.insert_document(&document).await.unwrap();

        let committed = store
            .commit_chunks(document.id, vec![chunk(&document, 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        assert!(!committed);
        assert_eq!(store.count_chunks(document.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_chunks_marks_success_and_replaces_chunks() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "a.txt").await;

        let chunks = vec![chunk(&document, 0, vec![1.0, 0.0]), chunk(&document, 1, vec![0.0, 1.0])];
        assert!(store.commit_chunks(document.id, chunks).await.unwrap());

        let loaded = store.get_document(document.id).await.unwrap().unwrap();
        assert_eq!(loaded.upload_status, UploadStatus::Success);

        let stored = store.get_chunks(document.id).await.unwrap();
        assert_eq!(stored.iter().map(|c| c.chunk_index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(stored[1].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_empty_commit_is_an_error() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "a.txt").await;
        assert!(store.commit_chunks(document.id, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_status_fails_on_read() {
        let (store, context) = seeded().await;
        let document = Document::new(context.id, "a.txt", ContentType::PlainText, b"x".to_vec());
        store.insert_document(&document).await.unwrap();

        store
            .connection()
            .lock()
            .execute(
                "UPDATE documents SET upload_status = 'FAILED' WHERE id = ?1",
                params![document.id.to_string()],
            )
            .unwrap();

        match store.get_document(document.id).await {
            Err(Error::InvalidStatus(value)) => assert_eq!(value, "FAILED"),
            other => panic!("expected InvalidStatus, got {:?}", other.map(|d| d.map(|d| d.id))),
        }
    }

    #[tokio::test]
    async fn test_search_ranks_by_distance_and_skips_unfinished_documents() {
        let (store, context) = seeded().await;
        let done = processing_document(&store, &context, "done.txt").await;
        store
            .commit_chunks(
                done.id,
                vec![
                    chunk(&done, 0, vec![0.0, 1.0]),
                    chunk(&done, 1, vec![1.0, 0.1]),
                    chunk(&done, 2, vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let pending = processing_document(&store, &context, "pending.txt").await;

        let results = store
            .search_by_vector(&[done.id, pending.id], &[1.0, 0.0], 10, None)
            .await
            .unwrap();
        let order: Vec<u32> = results.iter().map(|r| r.chunk.chunk_index).collect();
        assert_eq!(order, vec![2, 1, 0]);
        assert!(results.iter().all(|r| r.chunk.document_id == done.id));
        assert!(results[0].distance.abs() < 1e-6);

        let strict = store
            .search_by_vector(&[done.id], &[1.0, 0.0], 10, Some(0.5))
            .await
            .unwrap();
        assert_eq!(strict.len(), 2);

        let limited = store.search_by_vector(&[done.id], &[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].chunk.chunk_index, 2);
    }

    #[tokio::test]
    async fn test_equal_distances_break_ties_on_chunk_index() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "ties.txt").await;
        let chunks = (0..4).map(|i| chunk(&document, i, vec![0.0, 0.0])).collect();
        store.commit_chunks(document.id, chunks).await.unwrap();

        let results = store.search_by_vector(&[document.id], &[1.0, 0.0], 3, None).await.unwrap();
        assert_eq!(results.iter().map(|r| r.chunk.chunk_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(results.iter().all(|r| (r.distance - 1.0).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_deleting_context_cascades() {
        let (store, context) = seeded().await;
        let document = processing_document(&store, &context, "a.txt").await;
        store
            .commit_chunks(document.id, vec![chunk(&document, 0, vec![1.0])])
            .await
            .unwrap();

        assert!(store.delete_context(context.id).await.unwrap());
        assert!(store.get_document(document.id).await.unwrap().is_none());
        assert_eq!(store.count_chunks(document.id).await.unwrap(), 0);
    }

    #[test]
    fn test_cosine_distance_edge_cases() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_embedding_blob_layout() {
        let blob = encode_embedding(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&blob), vec![1.0, -2.5]);
    }
}
