//! Database schema definitions.

/// Schema SQL for the embedding-record store.
///
/// One row per document; rows are replaced wholesale, never partially
/// updated. The store is a derived index: it can be rebuilt in full from
/// the document store plus the embedder.
pub const SCHEMA: &str = r#"
-- Embedding records, one per document
CREATE TABLE IF NOT EXISTS embedding_records (
    document_id TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL,
    vector BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    content_version INTEGER NOT NULL,
    excerpt TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embedding_records_collection
    ON embedding_records(collection_id);
"#;

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;
