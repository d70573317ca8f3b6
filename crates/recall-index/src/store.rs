//! SQLite persistence for embedding records.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};
use ulid::Ulid;

use recall_core::{EmbeddingRecord, RecallError, Result};

use crate::schema::SCHEMA;

/// SQLite-backed store for embedding records.
///
/// Uses a blocking Mutex for thread-safe access; statements are short
/// single-row operations, so the critical sections stay small.
pub struct EmbeddingStore {
    /// Connection wrapped in blocking Mutex.
    conn: Arc<Mutex<Connection>>,
}

// Connection is protected by the Mutex.
unsafe impl Send for EmbeddingStore {}
unsafe impl Sync for EmbeddingStore {}

impl EmbeddingStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, busy_timeout_ms: u32) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RecallError::storage(format!("Failed to open database: {}", e)))?;

        Self::init(conn, busy_timeout_ms, path)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RecallError::storage(format!("Failed to open in-memory database: {}", e)))?;

        Self::init(conn, 30000, Path::new(":memory:"))
    }

    fn init(conn: Connection, busy_timeout_ms: u32, path: &Path) -> Result<Self> {
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = {};
            PRAGMA temp_store = MEMORY;
            "#,
            busy_timeout_ms
        ))
        .map_err(|e| RecallError::storage(format!("Failed to configure connection: {}", e)))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| RecallError::storage(format!("Failed to initialize schema: {}", e)))?;

        info!("Embedding store opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RecallError::storage(e.to_string()))?;
        f(&conn)
    }

    /// Insert or replace the record for a document.
    ///
    /// The version guard on the upsert makes the write idempotent and keeps
    /// a slow writer with an older content_version from clobbering a newer
    /// row.
    pub fn upsert(&self, record: &EmbeddingRecord) -> Result<()> {
        let vector_bytes = vec_to_bytes(&record.vector);

        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO embedding_records
                    (document_id, collection_id, vector, dimension, content_version, excerpt, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(document_id) DO UPDATE SET
                    collection_id = excluded.collection_id,
                    vector = excluded.vector,
                    dimension = excluded.dimension,
                    content_version = excluded.content_version,
                    excerpt = excluded.excerpt,
                    updated_at = excluded.updated_at
                WHERE excluded.content_version >= embedding_records.content_version
                "#,
                params![
                    record.document_id.to_string(),
                    record.collection_id.to_string(),
                    vector_bytes,
                    record.vector.len() as i64,
                    record.content_version as i64,
                    record.excerpt,
                    record.updated_at as i64,
                ],
            )
            .map_err(|e| RecallError::storage(format!("Failed to upsert record: {}", e)))?;

            debug!("Persisted record for document {}", record.document_id);
            Ok(())
        })
    }

    /// Delete a document's record. Idempotent.
    pub fn delete(&self, document_id: Ulid) -> Result<()> {
        self.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM embedding_records WHERE document_id = ?1",
                    params![document_id.to_string()],
                )
                .map_err(|e| RecallError::storage(e.to_string()))?;

            if deleted > 0 {
                debug!("Deleted record for document {}", document_id);
            }
            Ok(())
        })
    }

    /// Fetch one record.
    pub fn get(&self, document_id: Ulid) -> Result<Option<EmbeddingRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT document_id, collection_id, vector, content_version, excerpt, updated_at
                    FROM embedding_records WHERE document_id = ?1
                    "#,
                )
                .map_err(|e| RecallError::storage(e.to_string()))?;

            let result = stmt
                .query_row(params![document_id.to_string()], row_to_record)
                .optional()
                .map_err(|e| RecallError::storage(e.to_string()))?;

            Ok(result)
        })
    }

    /// Load every persisted record, for rebuilding the in-memory index at
    /// startup.
    pub fn load_all(&self) -> Result<Vec<EmbeddingRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT document_id, collection_id, vector, content_version, excerpt, updated_at
                    FROM embedding_records
                    "#,
                )
                .map_err(|e| RecallError::storage(e.to_string()))?;

            let records = stmt
                .query_map([], row_to_record)
                .map_err(|e| RecallError::storage(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RecallError::storage(e.to_string()))?;

            Ok(records)
        })
    }

    /// Number of persisted records.
    pub fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM embedding_records", [], |row| {
                row.get(0)
            })
            .map_err(|e| RecallError::storage(e.to_string()))
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let id_str: String = row.get(0)?;
    let collection_str: String = row.get(1)?;
    let vector_bytes: Vec<u8> = row.get(2)?;

    Ok(EmbeddingRecord {
        document_id: Ulid::from_string(&id_str).unwrap_or_else(|_| Ulid::nil()),
        collection_id: Ulid::from_string(&collection_str).unwrap_or_else(|_| Ulid::nil()),
        vector: bytes_to_vec(&vector_bytes),
        content_version: row.get::<_, i64>(3)? as u64,
        excerpt: row.get(4)?,
        updated_at: row.get::<_, i64>(5)? as u64,
    })
}

/// Convert f32 vector to bytes (little-endian).
fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert bytes back to an f32 vector.
fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
