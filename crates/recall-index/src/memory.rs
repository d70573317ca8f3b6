//! In-memory scoped vector index.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use ulid::Ulid;

use recall_core::{
    ApproxNearestNeighborIndex, DocumentRef, EmbeddingRecord, IndexConfig, QueryOutcome,
    RecallError, Result, ScoredDocument,
};

use crate::ann::{dot, HnswGraph};

/// Current projection of a tracked document.
#[derive(Debug, Clone, Copy)]
struct Tracked {
    collection_id: Ulid,
    content_version: u64,
    content_hash: Option<[u8; 32]>,
}

/// One collection's records and (above the size threshold) its graph.
struct Partition {
    records: HashMap<Ulid, EmbeddingRecord>,
    graph: Option<HnswGraph>,
}

impl Partition {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            graph: None,
        }
    }

    fn insert(&mut self, record: EmbeddingRecord, config: &IndexConfig) {
        if let Some(graph) = &mut self.graph {
            graph.insert(record.document_id, record.vector.clone());
        }
        self.records.insert(record.document_id, record);

        // Promote to a graph once the collection outgrows brute force.
        if self.graph.is_none() && self.records.len() >= config.ann_graph_threshold {
            let mut graph = HnswGraph::new(
                config.hnsw_m,
                config.hnsw_ef_construction,
                config.hnsw_ef_search,
            );
            for record in self.records.values() {
                graph.insert(record.document_id, record.vector.clone());
            }
            self.graph = Some(graph);
        }
    }

    fn remove(&mut self, document_id: Ulid) {
        self.records.remove(&document_id);
        if let Some(graph) = &mut self.graph {
            graph.remove(document_id);
        }
    }

    /// Raw candidates (unfiltered), as (id, similarity) pairs.
    fn candidates(&self, vector: &[f32], fetch_k: usize) -> Vec<(Ulid, f32)> {
        match &self.graph {
            Some(graph) => graph.search(vector, fetch_k),
            None => self
                .records
                .values()
                .map(|r| (r.document_id, dot(vector, &r.vector)))
                .collect(),
        }
    }
}

/// Scoped in-memory ANN index.
///
/// Collections are isolated partitions; a query touches exactly one.
/// Partitions below `ann_graph_threshold` records are scanned brute-force,
/// larger ones through an HNSW graph. Per-document write ordering is
/// enforced by a compare-and-swap on `content_version`, so writes to
/// different documents can land in any order without lost updates.
pub struct MemoryVectorIndex {
    dimension: usize,
    config: IndexConfig,
    partitions: RwLock<HashMap<Ulid, Arc<RwLock<Partition>>>>,
    tracked: RwLock<HashMap<Ulid, Tracked>>,
}

impl MemoryVectorIndex {
    /// Create an empty index for vectors of the given dimension.
    pub fn new(dimension: usize, config: IndexConfig) -> Self {
        Self {
            dimension,
            config,
            partitions: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashMap::new()),
        }
    }

    /// Current content version of a tracked document.
    pub async fn tracked_version(&self, document_id: Ulid) -> Option<u64> {
        self.tracked
            .read()
            .await
            .get(&document_id)
            .map(|t| t.content_version)
    }

    /// Hash of the text behind the currently tracked version.
    pub async fn tracked_hash(&self, document_id: Ulid) -> Option<[u8; 32]> {
        self.tracked
            .read()
            .await
            .get(&document_id)
            .and_then(|t| t.content_hash)
    }

    /// Clone of a document's stored record, stale or not.
    pub async fn record_of(&self, document_id: Ulid) -> Option<EmbeddingRecord> {
        let tracked = {
            let map = self.tracked.read().await;
            map.get(&document_id).copied()
        };
        let partition = self.partition(tracked?.collection_id).await?;
        let partition = partition.read().await;
        partition.records.get(&document_id).cloned()
    }

    /// Number of tracked documents in a collection, embedded or not.
    pub async fn collection_tracked(&self, collection_id: Ulid) -> usize {
        self.tracked
            .read()
            .await
            .values()
            .filter(|t| t.collection_id == collection_id)
            .count()
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RecallError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }

    async fn partition(&self, collection_id: Ulid) -> Option<Arc<RwLock<Partition>>> {
        self.partitions.read().await.get(&collection_id).cloned()
    }

    async fn partition_or_create(&self, collection_id: Ulid) -> Arc<RwLock<Partition>> {
        if let Some(partition) = self.partition(collection_id).await {
            return partition;
        }
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(collection_id)
            .or_insert_with(|| Arc::new(RwLock::new(Partition::new())))
            .clone()
    }
}

#[async_trait]
impl ApproxNearestNeighborIndex for MemoryVectorIndex {
    async fn track(&self, doc: DocumentRef) -> Result<()> {
        let mut tracked = self.tracked.write().await;
        let entry = tracked.entry(doc.id).or_insert(Tracked {
            collection_id: doc.collection_id,
            content_version: doc.content_version,
            content_hash: doc.content_hash,
        });

        // Versions are monotonic; a late replay of an older projection
        // must not roll the document back.
        if doc.content_version >= entry.content_version {
            entry.content_version = doc.content_version;
            entry.collection_id = doc.collection_id;
            entry.content_hash = doc.content_hash;
        }
        Ok(())
    }

    async fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        self.check_dimension(&record.vector)?;

        let tracked = {
            let map = self.tracked.read().await;
            map.get(&record.document_id).copied()
        };

        // A record landing after its document was deleted must not
        // resurrect it.
        if tracked.is_none() {
            debug!(
                "Ignoring upsert for untracked document {}",
                record.document_id
            );
            return Ok(());
        }

        let partition = self.partition_or_create(record.collection_id).await;
        let mut partition = partition.write().await;

        if let Some(existing) = partition.records.get(&record.document_id) {
            if existing.content_version > record.content_version {
                debug!(
                    "Ignoring stale upsert for document {} (v{} < v{})",
                    record.document_id, record.content_version, existing.content_version
                );
                return Ok(());
            }
        }

        partition.insert(record, &self.config);
        Ok(())
    }

    async fn remove(&self, document_id: Ulid) -> Result<()> {
        let removed = {
            let mut tracked = self.tracked.write().await;
            tracked.remove(&document_id)
        };

        if let Some(t) = removed {
            if let Some(partition) = self.partition(t.collection_id).await {
                partition.write().await.remove(document_id);
            }
            debug!("Removed document {}", document_id);
        }
        Ok(())
    }

    async fn query(
        &self,
        collection_id: Ulid,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<QueryOutcome> {
        self.check_dimension(vector)?;

        let Some(partition) = self.partition(collection_id).await else {
            return Ok(QueryOutcome::default());
        };

        // Fetch extra from the graph so stale and sub-threshold entries
        // can be filtered without under-filling k.
        let fetch_k = (k * 2).max(20);

        let raw: Vec<(Ulid, f32, u64, String, u64)> = {
            let partition = partition.read().await;
            partition
                .candidates(vector, fetch_k)
                .into_iter()
                .filter_map(|(id, sim)| {
                    partition
                        .records
                        .get(&id)
                        .map(|r| (id, sim, r.content_version, r.excerpt.clone(), r.updated_at))
                })
                .collect()
        };

        let tracked = self.tracked.read().await;

        let mut matches = Vec::new();
        let mut stale = Vec::new();

        for (id, sim, record_version, excerpt, updated_at) in raw {
            let Some(current) = tracked.get(&id) else {
                continue;
            };
            if current.content_version != record_version {
                stale.push(id);
                continue;
            }

            // Scores are reported in [0, 1]; negative cosine means
            // "unrelated" and never clears a threshold.
            let similarity = sim.max(0.0);
            if similarity >= threshold {
                matches.push(ScoredDocument {
                    document_id: id,
                    similarity,
                    excerpt,
                    updated_at,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        matches.truncate(k);

        Ok(QueryOutcome { matches, stale })
    }

    async fn vector_of(&self, document_id: Ulid) -> Result<Option<(Ulid, Vec<f32>)>> {
        let tracked = {
            let map = self.tracked.read().await;
            map.get(&document_id).copied()
        };
        let Some(t) = tracked else {
            return Ok(None);
        };

        let Some(partition) = self.partition(t.collection_id).await else {
            return Ok(None);
        };
        let partition = partition.read().await;

        Ok(partition
            .records
            .get(&document_id)
            .filter(|r| r.content_version == t.content_version)
            .map(|r| (t.collection_id, r.vector.clone())))
    }

    async fn contains_collection(&self, collection_id: Ulid) -> bool {
        self.tracked
            .read()
            .await
            .values()
            .any(|t| t.collection_id == collection_id)
    }

    async fn collection_len(&self, collection_id: Ulid) -> usize {
        match self.partition(collection_id).await {
            Some(partition) => partition.read().await.records.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(x: f32, y: f32) -> Vec<f32> {
        let norm = (x * x + y * y).sqrt();
        vec![x / norm, y / norm]
    }

    fn index() -> MemoryVectorIndex {
        MemoryVectorIndex::new(2, IndexConfig::default())
    }

    async fn seed(index: &MemoryVectorIndex, collection: Ulid, vector: Vec<f32>) -> Ulid {
        let id = Ulid::new();
        index
            .track(DocumentRef::at_version(id, collection, 1, "text"))
            .await
            .unwrap();
        index
            .upsert(EmbeddingRecord::new(id, collection, vector, 1))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let index = index();
        let collection = Ulid::new();
        let id = seed(&index, collection, unit(1.0, 0.0)).await;

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 3, 0.5)
            .await
            .unwrap();

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].document_id, id);
        assert!((outcome.matches[0].similarity - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_collection_isolation() {
        let index = index();
        let collection_a = Ulid::new();
        let collection_b = Ulid::new();

        // Identical vectors in two collections.
        let id_a = seed(&index, collection_a, unit(1.0, 0.0)).await;
        let id_b = seed(&index, collection_b, unit(1.0, 0.0)).await;

        let outcome_a = index
            .query(collection_a, &unit(1.0, 0.0), 10, 0.0)
            .await
            .unwrap();
        assert_eq!(outcome_a.matches.len(), 1);
        assert_eq!(outcome_a.matches[0].document_id, id_a);

        let outcome_b = index
            .query(collection_b, &unit(1.0, 0.0), 10, 0.0)
            .await
            .unwrap();
        assert_eq!(outcome_b.matches.len(), 1);
        assert_eq!(outcome_b.matches[0].document_id, id_b);
    }

    #[tokio::test]
    async fn test_threshold_enforced() {
        let index = index();
        let collection = Ulid::new();
        seed(&index, collection, unit(1.0, 0.0)).await;
        seed(&index, collection, unit(0.0, 1.0)).await;

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 10, 0.5)
            .await
            .unwrap();

        assert_eq!(outcome.matches.len(), 1);
        for m in &outcome.matches {
            assert!(m.similarity >= 0.5);
        }
    }

    #[tokio::test]
    async fn test_stale_record_excluded_and_reported() {
        let index = index();
        let collection = Ulid::new();
        let id = seed(&index, collection, unit(1.0, 0.0)).await;

        // Document store moved to version 2; no re-embed yet.
        index
            .track(DocumentRef::at_version(id, collection, 2, "new text"))
            .await
            .unwrap();

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 10, 0.0)
            .await
            .unwrap();

        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.stale, vec![id]);

        // Re-embed at the current version makes it visible again.
        index
            .upsert(EmbeddingRecord::new(id, collection, unit(0.0, 1.0), 2))
            .await
            .unwrap();
        let outcome = index
            .query(collection, &unit(0.0, 1.0), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert!(outcome.stale.is_empty());
    }

    #[tokio::test]
    async fn test_older_version_upsert_ignored() {
        let index = index();
        let collection = Ulid::new();
        let id = Ulid::new();

        index
            .track(DocumentRef::at_version(id, collection, 2, "v2"))
            .await
            .unwrap();
        index
            .upsert(EmbeddingRecord::new(id, collection, unit(0.0, 1.0), 2))
            .await
            .unwrap();

        // A slow worker finishing an old embed must not clobber v2.
        index
            .upsert(EmbeddingRecord::new(id, collection, unit(1.0, 0.0), 1))
            .await
            .unwrap();

        let outcome = index
            .query(collection, &unit(0.0, 1.0), 1, 0.9)
            .await
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_for_untracked_document_ignored() {
        let index = index();
        let collection = Ulid::new();
        let id = Ulid::new();

        index
            .upsert(EmbeddingRecord::new(id, collection, unit(1.0, 0.0), 1))
            .await
            .unwrap();

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 10, 0.0)
            .await
            .unwrap();
        assert!(outcome.matches.is_empty());
    }

    #[tokio::test]
    async fn test_remove_then_query_never_matches() {
        let index = index();
        let collection = Ulid::new();
        let id = seed(&index, collection, unit(1.0, 0.0)).await;

        index.remove(id).await.unwrap();

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 10, 0.0)
            .await
            .unwrap();
        assert!(outcome.matches.is_empty());
        assert_eq!(index.collection_len(collection).await, 0);

        // Removal is idempotent.
        index.remove(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_recency_breaks_score_ties() {
        let index = index();
        let collection = Ulid::new();

        let older = Ulid::new();
        index
            .track(DocumentRef::at_version(older, collection, 1, "a"))
            .await
            .unwrap();
        let mut record = EmbeddingRecord::new(older, collection, unit(1.0, 0.0), 1);
        record.updated_at = 1000;
        index.upsert(record).await.unwrap();

        let newer = Ulid::new();
        index
            .track(DocumentRef::at_version(newer, collection, 1, "b"))
            .await
            .unwrap();
        let mut record = EmbeddingRecord::new(newer, collection, unit(1.0, 0.0), 1);
        record.updated_at = 2000;
        index.upsert(record).await.unwrap();

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 2, 0.5)
            .await
            .unwrap();
        assert_eq!(outcome.matches[0].document_id, newer);
        assert_eq!(outcome.matches[1].document_id, older);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = index();
        let collection = Ulid::new();

        let result = index.query(collection, &[1.0, 0.0, 0.0], 1, 0.0).await;
        assert!(matches!(
            result,
            Err(RecallError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_graph_path_above_threshold() {
        let config = IndexConfig {
            ann_graph_threshold: 4,
            ..Default::default()
        };
        let index = MemoryVectorIndex::new(2, config);
        let collection = Ulid::new();

        let mut target = None;
        for i in 0..12 {
            let angle = i as f32 * 0.1;
            let id = seed(&index, collection, unit(angle.cos(), angle.sin())).await;
            if i == 0 {
                target = Some(id);
            }
        }

        let outcome = index
            .query(collection, &unit(1.0, 0.0), 3, 0.5)
            .await
            .unwrap();
        assert_eq!(outcome.matches[0].document_id, target.unwrap());
        assert!((outcome.matches[0].similarity - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_empty_not_error() {
        let index = index();
        let outcome = index
            .query(Ulid::new(), &unit(1.0, 0.0), 5, 0.0)
            .await
            .unwrap();
        assert!(outcome.matches.is_empty());
        assert!(!index.contains_collection(Ulid::new()).await);
    }

    #[tokio::test]
    async fn test_vector_of_stale_is_none() {
        let index = index();
        let collection = Ulid::new();
        let id = seed(&index, collection, unit(1.0, 0.0)).await;

        assert!(index.vector_of(id).await.unwrap().is_some());

        index
            .track(DocumentRef::at_version(id, collection, 2, "changed"))
            .await
            .unwrap();
        assert!(index.vector_of(id).await.unwrap().is_none());
    }
}
