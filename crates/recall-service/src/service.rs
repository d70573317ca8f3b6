//! Owned retrieval service facade.
//!
//! One `RetrievalService` replaces the ambient module-level singletons of
//! a typical web backend: the embedding model, the vector index, and the
//! worker pool are initialized once at startup, passed by handle into
//! request handling, and torn down by an explicit shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ulid::Ulid;

use recall_core::{
    ApproxNearestNeighborIndex, ContextBlob, ContextBundle, DocumentRef, EmbeddingModel,
    EmbeddingRecord, EmbeddingState, RecallConfig, RecallError, Result, RetrievalResult,
};
use recall_embed::{Embedder, OnnxEmbeddingModel};
use recall_index::DurableVectorIndex;
use recall_query::{GenerationAugmenter, RetrievalCoordinator};

use crate::worker::{IndexingPool, StateMap};

/// One document in a bulk reindex request.
#[derive(Debug, Clone)]
pub struct ReindexItem {
    /// Document identifier.
    pub id: Ulid,

    /// Collection (course) scope.
    pub collection_id: Ulid,

    /// Current content version.
    pub content_version: u64,

    /// Text to embed.
    pub text: String,
}

/// Per-item outcome of a bulk reindex. Successful items are committed
/// individually; failed ones are listed for independent retry.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Documents indexed successfully.
    pub succeeded: Vec<Ulid>,

    /// Documents that failed, with their errors.
    pub failed: Vec<(Ulid, RecallError)>,
}

impl BatchReport {
    /// Whether every item committed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-collection indexing counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    /// Tracked documents.
    pub documents: usize,

    /// Documents with a stored vector.
    pub embedded: usize,

    /// Documents still waiting for a vector.
    pub pending: usize,
}

/// The retrieval core's service facade.
pub struct RetrievalService {
    config: RecallConfig,
    embedder: Arc<Embedder>,
    index: Arc<DurableVectorIndex>,
    coordinator: RetrievalCoordinator<DurableVectorIndex>,
    augmenter: GenerationAugmenter,
    pool: Arc<IndexingPool<DurableVectorIndex>>,
    states: StateMap,
    stale_task: Mutex<Option<JoinHandle<()>>>,
}

impl RetrievalService {
    /// Open the service with the ONNX embedding model from the config.
    pub async fn open(config: RecallConfig) -> Result<Self> {
        let model = Arc::new(OnnxEmbeddingModel::open(&config.embedding)?);
        Self::with_model(config, model).await
    }

    /// Open the service with an explicit embedding model backend.
    pub async fn with_model(
        config: RecallConfig,
        model: Arc<dyn EmbeddingModel>,
    ) -> Result<Self> {
        let index = DurableVectorIndex::open(&config).await?;
        Self::assemble(config, model, index)
    }

    /// Fully in-memory service (tests and ephemeral deployments).
    pub async fn ephemeral(config: RecallConfig, model: Arc<dyn EmbeddingModel>) -> Result<Self> {
        let index = DurableVectorIndex::open_memory(&config).await?;
        Self::assemble(config, model, index)
    }

    fn assemble(
        config: RecallConfig,
        model: Arc<dyn EmbeddingModel>,
        index: DurableVectorIndex,
    ) -> Result<Self> {
        let embedder = Arc::new(Embedder::new(model, config.embedding.batch_size));
        let index = Arc::new(index);
        let states: StateMap = Arc::new(RwLock::new(HashMap::new()));

        let pool = Arc::new(IndexingPool::start(
            config.indexing.clone(),
            embedder.clone(),
            index.clone(),
            states.clone(),
            config.retrieval.snippet_chars,
        ));

        // Stale hits observed at query time flow back into the pool as
        // re-embed requests.
        let (stale_tx, mut stale_rx) = mpsc::unbounded_channel();
        let coordinator =
            RetrievalCoordinator::new(index.clone(), embedder.clone(), config.retrieval.clone())
                .with_stale_notifier(stale_tx);

        let stale_pool = pool.clone();
        let stale_task = tokio::spawn(async move {
            while let Some(document_id) = stale_rx.recv().await {
                if let Err(e) = stale_pool.request_reembed(document_id).await {
                    warn!("Re-embed request for {} failed: {}", document_id, e);
                }
            }
        });

        let augmenter = GenerationAugmenter::new(config.retrieval.max_prompt_chars);

        info!("Retrieval service started");

        Ok(Self {
            config,
            embedder,
            index,
            coordinator,
            augmenter,
            pool,
            states,
            stale_task: Mutex::new(Some(stale_task)),
        })
    }

    /// Stop the workers and background tasks. In-flight work is cancelled
    /// at the next await point; nothing keeps running after this returns.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        if let Some(task) = self.stale_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("Retrieval service stopped");
    }

    // Document lifecycle boundary (called by the external CRUD layer)

    /// A document was created: track it and queue its first embedding.
    pub async fn on_document_created(
        &self,
        id: Ulid,
        collection_id: Ulid,
        text: &str,
    ) -> Result<()> {
        let doc = DocumentRef::new(id, collection_id, text);
        self.index.track(doc.clone()).await?;
        self.states
            .write()
            .await
            .insert(id, EmbeddingState::Unembedded);
        self.pool.enqueue(doc, text.to_string()).await
    }

    /// A document's content moved to a new version.
    ///
    /// The new version is tracked immediately, which makes the old vector
    /// invisible to queries before any re-embedding happens. If the text
    /// itself is unchanged (version bump only), the existing vector is
    /// re-stamped at the new version instead of being recomputed.
    pub async fn on_document_updated(
        &self,
        id: Ulid,
        collection_id: Ulid,
        text: &str,
        new_content_version: u64,
    ) -> Result<()> {
        let previous_version = self.index.tracked_version(id).await;
        let previous_hash = self.index.tracked_hash(id).await;

        let doc = DocumentRef::at_version(id, collection_id, new_content_version, text);
        let unchanged = previous_hash.is_some() && previous_hash == doc.content_hash;

        self.index.track(doc.clone()).await?;

        if unchanged {
            if let Some(mut record) = self.index.record_of(id).await {
                // Only a vector that was current for the previous version
                // may be carried forward.
                if Some(record.content_version) == previous_version {
                    record.content_version = new_content_version;
                    record.updated_at = recall_core::now_millis();
                    self.index.upsert(record).await?;

                    let mut states = self.states.write().await;
                    let state = states.get(&id).copied().unwrap_or(EmbeddingState::Unembedded);
                    states.insert(id, state.embedded(new_content_version));
                    return Ok(());
                }
            }
        }

        {
            let mut states = self.states.write().await;
            let state = states.get(&id).copied().unwrap_or(EmbeddingState::Unembedded);
            states.insert(id, state.content_changed(new_content_version));
        }

        self.pool.enqueue(doc, text.to_string()).await
    }

    /// A document was deleted: its vector is removed immediately and
    /// never returned again.
    pub async fn on_document_deleted(&self, id: Ulid) -> Result<()> {
        self.pool.forget(id).await;
        self.index.remove(id).await?;
        self.states.write().await.insert(id, EmbeddingState::Deleted);
        Ok(())
    }

    // Query boundary

    /// Retrieve prior-note context for a new note. Never fails the caller
    /// for retrieval-side problems; those come back as a skipped bundle.
    pub async fn get_context_for_note(
        &self,
        text: &str,
        collection_id: Ulid,
    ) -> Result<ContextBundle> {
        self.coordinator.get_context(text, collection_id).await
    }

    /// Assemble the bounded prompt context for the generation step.
    pub fn build_prompt_context(&self, new_text: &str, bundle: &ContextBundle) -> ContextBlob {
        self.augmenter.build_prompt_context(new_text, bundle)
    }

    /// Related notes for an existing document.
    pub async fn get_related(&self, document_id: Ulid, k: usize) -> Result<Vec<RetrievalResult>> {
        self.coordinator.get_related(document_id, k).await
    }

    // Maintenance boundary

    /// Bulk (re)index documents, committing each item individually. One
    /// failure never aborts the batch; failed items are reported for
    /// independent retry.
    pub async fn reindex(&self, items: Vec<ReindexItem>) -> BatchReport {
        let mut report = BatchReport::default();

        for item in items {
            match self.reindex_one(&item).await {
                Ok(()) => report.succeeded.push(item.id),
                Err(e) => {
                    warn!("Reindex failed for document {}: {}", item.id, e);
                    report.failed.push((item.id, e));
                }
            }
        }

        info!(
            "Reindex complete: {} succeeded, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }

    async fn reindex_one(&self, item: &ReindexItem) -> Result<()> {
        let doc = DocumentRef::at_version(item.id, item.collection_id, item.content_version, &item.text);
        self.index.track(doc).await?;

        let vector = self.embedder.embed_document(&item.text).await?;
        let record = EmbeddingRecord::new(item.id, item.collection_id, vector, item.content_version)
            .with_excerpt(&item.text, self.config.retrieval.snippet_chars);
        self.index.upsert(record).await?;

        let mut states = self.states.write().await;
        let state = states
            .get(&item.id)
            .copied()
            .unwrap_or(EmbeddingState::Unembedded);
        states.insert(item.id, state.embedded(item.content_version));
        Ok(())
    }

    /// Indexing counts for one collection.
    pub async fn stats(&self, collection_id: Ulid) -> CollectionStats {
        let documents = self.index.collection_tracked(collection_id).await;
        let embedded = self.index.collection_len(collection_id).await;
        CollectionStats {
            documents,
            embedded,
            pending: documents.saturating_sub(embedded),
        }
    }

    /// Lifecycle state of one document, if it has been seen.
    pub async fn embedding_state(&self, document_id: Ulid) -> Option<EmbeddingState> {
        self.states.read().await.get(&document_id).copied()
    }

    /// The service configuration.
    pub fn config(&self) -> &RecallConfig {
        &self.config
    }
}
