//! Core traits defining the seams between components.
//!
//! Both the embedding backend and the vector index are black boxes to the
//! retrieval coordinator; concrete implementations (in-process, ONNX,
//! external service) are swappable behind these traits.

use async_trait::async_trait;
use ulid::Ulid;

use crate::error::Result;
use crate::types::{DocumentRef, EmbeddingRecord};

/// A raw text-to-vector model.
///
/// Implementations must be pure with respect to (text, model version):
/// identical input yields identical output within floating-point tolerance.
/// Returned vectors are L2-normalized and have exactly `dimension()` entries.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a batch of texts. One vector per input, same order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Fixed embedding dimension, constant for the process lifetime.
    fn dimension(&self) -> usize;

    /// Upper bound on input length per chunk, in characters.
    fn max_chunk_chars(&self) -> usize;
}

/// A hit from a scoped index query, before snippet assembly.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    /// Matched document.
    pub document_id: Ulid,

    /// Cosine similarity in [0, 1].
    pub similarity: f32,

    /// Excerpt cached on the embedding record.
    pub excerpt: String,

    /// Record write time, used as the recency tie-break.
    pub updated_at: u64,
}

/// Result of a scoped query.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Matches at or above the threshold, descending similarity.
    pub matches: Vec<ScoredDocument>,

    /// Documents whose vectors were excluded as stale. The caller should
    /// schedule re-embedding for these.
    pub stale: Vec<Ulid>,
}

/// Scoped approximate-nearest-neighbor index over embedding records.
///
/// Queries are restricted entirely to one collection; there is no
/// cross-collection search path. Writes for the same document are serialized
/// by a compare-and-swap on `content_version`; writes to different documents
/// may be applied in any order relative to each other. Within a session, a
/// query issued strictly after an upsert/remove/track for a document
/// reflects that write.
#[async_trait]
pub trait ApproxNearestNeighborIndex: Send + Sync {
    /// Register or update the projection of a document. The recorded
    /// `content_version` is what queries compare records against: tracking
    /// version n+1 makes a version-n vector invisible immediately, before
    /// any re-embed completes.
    async fn track(&self, doc: DocumentRef) -> Result<()>;

    /// Insert or replace the record for a document. Idempotent; a record
    /// carrying a lower `content_version` than the stored one is ignored,
    /// so a slow embed can never clobber a newer vector.
    async fn upsert(&self, record: EmbeddingRecord) -> Result<()>;

    /// Remove a document's record and projection. Subsequent queries never
    /// match it.
    async fn remove(&self, document_id: Ulid) -> Result<()>;

    /// Top-k cosine-similarity query scoped to `collection_id`. Returns at
    /// most `k` matches, all with similarity >= `threshold`, descending.
    async fn query(
        &self,
        collection_id: Ulid,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<QueryOutcome>;

    /// Current vector and collection of a document, if it has a non-stale
    /// record. Backs the related-notes query path.
    async fn vector_of(&self, document_id: Ulid) -> Result<Option<(Ulid, Vec<f32>)>>;

    /// Whether any document is tracked under this collection.
    async fn contains_collection(&self, collection_id: Ulid) -> bool;

    /// Number of records currently held for a collection.
    async fn collection_len(&self, collection_id: Ulid) -> usize;
}
