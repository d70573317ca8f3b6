//! Durable vector index: in-memory ANN backed by the SQLite record store.

use async_trait::async_trait;
use tracing::{debug, info};
use ulid::Ulid;

use recall_core::{
    ApproxNearestNeighborIndex, DocumentRef, EmbeddingRecord, QueryOutcome, RecallConfig, Result,
};

use crate::memory::MemoryVectorIndex;
use crate::store::EmbeddingStore;

/// Vector index whose records survive restarts.
///
/// Every upsert/remove is persisted to the [`EmbeddingStore`] before it is
/// applied in memory, so a query can never observe a write the store has
/// not accepted. On open, the ANN side is rebuilt from the persisted
/// records; projections are re-registered at each record's own version and
/// refreshed by the document store's lifecycle events afterwards.
pub struct DurableVectorIndex {
    store: EmbeddingStore,
    memory: MemoryVectorIndex,
}

impl DurableVectorIndex {
    /// Open the store at the configured path and rebuild the in-memory
    /// index from it.
    pub async fn open(config: &RecallConfig) -> Result<Self> {
        let store = EmbeddingStore::open(&config.storage.path, config.storage.busy_timeout_ms)?;
        Self::rebuild(store, config).await
    }

    /// In-memory store variant (for tests and ephemeral deployments).
    pub async fn open_memory(config: &RecallConfig) -> Result<Self> {
        let store = EmbeddingStore::open_memory()?;
        Self::rebuild(store, config).await
    }

    async fn rebuild(store: EmbeddingStore, config: &RecallConfig) -> Result<Self> {
        let memory = MemoryVectorIndex::new(config.embedding.dimension, config.index.clone());
        let records = store.load_all()?;
        let count = records.len();

        for record in records {
            memory
                .track(DocumentRef {
                    id: record.document_id,
                    collection_id: record.collection_id,
                    content_version: record.content_version,
                    content_hash: None,
                })
                .await?;
            memory.upsert(record).await?;
        }

        info!("Vector index rebuilt from store: {} records", count);
        Ok(Self { store, memory })
    }

    /// Number of persisted records.
    pub fn persisted_count(&self) -> Result<u64> {
        self.store.count()
    }

    /// Clone of a document's stored record, stale or not.
    pub async fn record_of(&self, document_id: Ulid) -> Option<EmbeddingRecord> {
        self.memory.record_of(document_id).await
    }

    /// Current content version of a tracked document.
    pub async fn tracked_version(&self, document_id: Ulid) -> Option<u64> {
        self.memory.tracked_version(document_id).await
    }

    /// Hash of the text behind the currently tracked version.
    pub async fn tracked_hash(&self, document_id: Ulid) -> Option<[u8; 32]> {
        self.memory.tracked_hash(document_id).await
    }

    /// Number of tracked documents in a collection, embedded or not.
    pub async fn collection_tracked(&self, collection_id: Ulid) -> usize {
        self.memory.collection_tracked(collection_id).await
    }
}

#[async_trait]
impl ApproxNearestNeighborIndex for DurableVectorIndex {
    async fn track(&self, doc: DocumentRef) -> Result<()> {
        // Projections are derived from the document store and rebuilt from
        // it; only vectors are persisted here.
        self.memory.track(doc).await
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        if self
            .memory
            .tracked_version(record.document_id)
            .await
            .is_none()
        {
            debug!(
                "Ignoring upsert for untracked document {}",
                record.document_id
            );
            return Ok(());
        }

        self.store.upsert(&record)?;
        self.memory.upsert(record).await
    }

    async fn remove(&self, document_id: Ulid) -> Result<()> {
        self.store.delete(document_id)?;
        self.memory.remove(document_id).await
    }

    async fn query(
        &self,
        collection_id: Ulid,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<QueryOutcome> {
        self.memory.query(collection_id, vector, k, threshold).await
    }

    async fn vector_of(&self, document_id: Ulid) -> Result<Option<(Ulid, Vec<f32>)>> {
        self.memory.vector_of(document_id).await
    }

    async fn contains_collection(&self, collection_id: Ulid) -> bool {
        self.memory.contains_collection(collection_id).await
    }

    async fn collection_len(&self, collection_id: Ulid) -> usize {
        self.memory.collection_len(collection_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let norm = (x * x + y * y).sqrt();
        vec![x / norm, y / norm]
    }

    fn config() -> RecallConfig {
        let mut config = RecallConfig::default();
        config.embedding.dimension = 2;
        config
    }

    #[tokio::test]
    async fn test_upsert_persists() {
        let index = DurableVectorIndex::open_memory(&config()).await.unwrap();
        let collection = Ulid::new();
        let id = Ulid::new();

        index
            .track(DocumentRef::at_version(id, collection, 1, "text"))
            .await
            .unwrap();
        index
            .upsert(EmbeddingRecord::new(id, collection, unit(1.0, 0.0), 1))
            .await
            .unwrap();

        assert_eq!(index.persisted_count().unwrap(), 1);

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 1, 0.9)
            .await
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
    }

    #[tokio::test]
    async fn test_untracked_upsert_not_persisted() {
        let index = DurableVectorIndex::open_memory(&config()).await.unwrap();
        let record = EmbeddingRecord::new(Ulid::new(), Ulid::new(), unit(1.0, 0.0), 1);

        index.upsert(record).await.unwrap();
        assert_eq!(index.persisted_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_clears_persistence() {
        let index = DurableVectorIndex::open_memory(&config()).await.unwrap();
        let collection = Ulid::new();
        let id = Ulid::new();

        index
            .track(DocumentRef::at_version(id, collection, 1, "text"))
            .await
            .unwrap();
        index
            .upsert(EmbeddingRecord::new(id, collection, unit(1.0, 0.0), 1))
            .await
            .unwrap();
        index.remove(id).await.unwrap();

        assert_eq!(index.persisted_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.storage.path = dir.path().join("embeddings.db");

        let collection = Ulid::new();
        let id = Ulid::new();

        {
            let index = DurableVectorIndex::open(&config).await.unwrap();
            index
                .track(DocumentRef::at_version(id, collection, 1, "text"))
                .await
                .unwrap();
            index
                .upsert(EmbeddingRecord::new(id, collection, unit(1.0, 0.0), 1))
                .await
                .unwrap();
        }

        let index = DurableVectorIndex::open(&config).await.unwrap();
        let outcome = index
            .query(collection, &unit(1.0, 0.0), 1, 0.9)
            .await
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].document_id, id);
    }
}
