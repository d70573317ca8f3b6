//! Bounded worker pool for embedding jobs.
//!
//! Embedding is CPU-bound and stateless per call, so it runs on its own
//! pool of workers pulling from a bounded queue; index reads and writes
//! stay on the caller's tasks. Failed jobs are retried with exponential
//! backoff while the error class is transient; a job that exhausts its
//! retries leaves the document's state unchanged (Unembedded or Stale) and
//! its text parked for a later re-embed request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use recall_core::{
    ApproxNearestNeighborIndex, DocumentRef, EmbeddingRecord, EmbeddingState, IndexingConfig,
    RecallError, Result,
};
use recall_embed::Embedder;

/// One embedding job.
#[derive(Debug, Clone)]
struct EmbedJob {
    doc: DocumentRef,
    text: String,
    attempt: u32,
}

/// Shared per-document lifecycle states.
pub type StateMap = Arc<RwLock<HashMap<Ulid, EmbeddingState>>>;

/// Worker pool turning lifecycle events into embedding records.
pub struct IndexingPool<I> {
    tx: mpsc::Sender<EmbedJob>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,

    /// Latest un-embedded text per document, kept so a stale hit at query
    /// time can trigger a re-embed without a round-trip to the document
    /// store.
    pending: Arc<RwLock<HashMap<Ulid, EmbedJob>>>,

    index: Arc<I>,
}

impl<I> IndexingPool<I>
where
    I: ApproxNearestNeighborIndex + 'static,
{
    /// Spawn the workers.
    pub fn start(
        config: IndexingConfig,
        embedder: Arc<Embedder>,
        index: Arc<I>,
        states: StateMap,
        excerpt_chars: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<EmbedJob>(config.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));
        let pending: Arc<RwLock<HashMap<Ulid, EmbedJob>>> = Arc::new(RwLock::new(HashMap::new()));

        let mut handles = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            let ctx = WorkerContext {
                rx: rx.clone(),
                tx: tx.clone(),
                shutdown_rx: shutdown_tx.subscribe(),
                embedder: embedder.clone(),
                index: index.clone(),
                states: states.clone(),
                pending: pending.clone(),
                config: config.clone(),
                excerpt_chars,
            };
            handles.push(tokio::spawn(async move {
                ctx.run(worker_id).await;
            }));
        }

        info!("Indexing pool started with {} workers", config.workers.max(1));

        Self {
            tx,
            shutdown_tx,
            handles: Mutex::new(handles),
            pending,
            index,
        }
    }

    /// Queue an embed for a document's current text.
    pub async fn enqueue(&self, doc: DocumentRef, text: String) -> Result<()> {
        let job = EmbedJob {
            doc,
            text,
            attempt: 0,
        };

        self.pending.write().await.insert(job.doc.id, job.clone());

        self.tx
            .send(job)
            .await
            .map_err(|_| RecallError::index("indexing pool is shut down"))
    }

    /// Re-queue the parked text for a document whose vector was observed
    /// stale. No-op when nothing is parked; the next document-store update
    /// will carry fresh text.
    pub async fn request_reembed(&self, document_id: Ulid) -> Result<()> {
        let job = {
            let pending = self.pending.read().await;
            pending.get(&document_id).cloned()
        };

        match job {
            Some(mut job) => {
                job.attempt = 0;
                debug!("Re-queueing stale document {}", document_id);
                self.tx
                    .send(job)
                    .await
                    .map_err(|_| RecallError::index("indexing pool is shut down"))
            }
            None => {
                debug!("No parked text for stale document {}", document_id);
                Ok(())
            }
        }
    }

    /// Drop any parked work for a deleted document.
    pub async fn forget(&self, document_id: Ulid) {
        self.pending.write().await.remove(&document_id);
    }

    /// Number of documents with parked, not-yet-committed text.
    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Signal the workers and wait for them to stop. In-flight jobs are
    /// cancelled at their next await point; nothing keeps running after
    /// this returns.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("Indexing pool stopped");
    }

    /// The index this pool writes to.
    pub fn index(&self) -> &Arc<I> {
        &self.index
    }
}

struct WorkerContext<I> {
    rx: Arc<Mutex<mpsc::Receiver<EmbedJob>>>,
    tx: mpsc::Sender<EmbedJob>,
    shutdown_rx: watch::Receiver<bool>,
    embedder: Arc<Embedder>,
    index: Arc<I>,
    states: StateMap,
    pending: Arc<RwLock<HashMap<Ulid, EmbedJob>>>,
    config: IndexingConfig,
    excerpt_chars: usize,
}

impl<I> WorkerContext<I>
where
    I: ApproxNearestNeighborIndex + 'static,
{
    async fn run(self, worker_id: usize) {
        debug!("Indexing worker {} started", worker_id);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let job = tokio::select! {
                _ = shutdown_rx.changed() => break,
                job = Self::next_job(&self.rx) => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // In-flight work is cancelled at its next await point when the
            // shutdown signal fires.
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = self.process(job) => {}
            }
        }

        debug!("Indexing worker {} stopped", worker_id);
    }

    async fn next_job(rx: &Arc<Mutex<mpsc::Receiver<EmbedJob>>>) -> Option<EmbedJob> {
        rx.lock().await.recv().await
    }

    async fn process(&self, job: EmbedJob) {
        let doc_id = job.doc.id;
        let version = job.doc.content_version;

        // Remember where the document was so a failure can put it back;
        // failure never transitions to Embedded.
        let prior = {
            let mut states = self.states.write().await;
            let prior = states
                .get(&doc_id)
                .copied()
                .unwrap_or(EmbeddingState::Unembedded);
            if prior == EmbeddingState::Deleted {
                debug!("Skipping embed for deleted document {}", doc_id);
                return;
            }
            states.insert(doc_id, EmbeddingState::Embedding);
            prior
        };

        let result = self.embed_and_commit(&job).await;

        match result {
            Ok(()) => {
                let mut states = self.states.write().await;
                let current = states
                    .get(&doc_id)
                    .copied()
                    .unwrap_or(EmbeddingState::Embedding);
                states.insert(doc_id, current.embedded(version));
                drop(states);

                // Clear the parked text unless a newer version arrived
                // while this job was in flight.
                let mut pending = self.pending.write().await;
                if let Some(parked) = pending.get(&doc_id) {
                    if parked.doc.content_version <= version {
                        pending.remove(&doc_id);
                    }
                }

                debug!("Embedded document {} at v{}", doc_id, version);
            }
            Err(e) => {
                {
                    let mut states = self.states.write().await;
                    // A delete that landed mid-flight wins.
                    if states.get(&doc_id) != Some(&EmbeddingState::Deleted) {
                        states.insert(doc_id, prior);
                    }
                }
                self.handle_failure(job, e).await;
            }
        }
    }

    async fn embed_and_commit(&self, job: &EmbedJob) -> Result<()> {
        let vector = self.embedder.embed_document(&job.text).await?;
        let record = EmbeddingRecord::new(
            job.doc.id,
            job.doc.collection_id,
            vector,
            job.doc.content_version,
        )
        .with_excerpt(&job.text, self.excerpt_chars);

        self.index.upsert(record).await
    }

    async fn handle_failure(&self, mut job: EmbedJob, error: RecallError) {
        if error.is_retryable() && job.attempt < self.config.max_retries {
            let backoff =
                Duration::from_millis(self.config.retry_backoff_ms << job.attempt.min(16));
            job.attempt += 1;

            warn!(
                "Embed failed for document {} (attempt {}), retrying in {:?}: {}",
                job.doc.id, job.attempt, backoff, error
            );

            // Park the retry on its own task so the worker slot frees up.
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = tx.send(job).await;
            });
        } else {
            error!(
                "Giving up embedding document {} after {} attempts: {}",
                job.doc.id,
                job.attempt + 1,
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use recall_core::{EmbeddingModel, IndexConfig};
    use recall_embed::HashedTokenModel;
    use recall_index::MemoryVectorIndex;

    fn states() -> StateMap {
        Arc::new(RwLock::new(HashMap::new()))
    }

    fn pool_config() -> IndexingConfig {
        IndexingConfig {
            workers: 2,
            max_retries: 3,
            retry_backoff_ms: 10,
            queue_capacity: 64,
        }
    }

    async fn wait_for_state(states: &StateMap, id: Ulid, expected: EmbeddingState) {
        for _ in 0..200 {
            if states.read().await.get(&id) == Some(&expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document {} never reached {:?}", id, expected);
    }

    #[tokio::test]
    async fn test_enqueue_embeds_and_updates_state() {
        let index = Arc::new(MemoryVectorIndex::new(384, IndexConfig::default()));
        let embedder = Arc::new(Embedder::new(Arc::new(HashedTokenModel::new(384)), 16));
        let states = states();
        let pool = IndexingPool::start(pool_config(), embedder.clone(), index.clone(), states.clone(), 500);

        let collection = Ulid::new();
        let doc = DocumentRef::new(Ulid::new(), collection, "krebs cycle steps");
        let doc_id = doc.id;
        index.track(doc.clone()).await.unwrap();
        states
            .write()
            .await
            .insert(doc_id, EmbeddingState::Unembedded);

        pool.enqueue(doc, "krebs cycle steps".to_string())
            .await
            .unwrap();

        wait_for_state(
            &states,
            doc_id,
            EmbeddingState::Embedded { content_version: 1 },
        )
        .await;

        assert_eq!(index.collection_len(collection).await, 1);
        assert_eq!(pool.pending_len().await, 0);

        pool.shutdown().await;
    }

    /// Fails a fixed number of times, then succeeds.
    struct FlakyModel {
        inner: HashedTokenModel,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingModel for FlakyModel {
        async fn embed_batch(&self, texts: &[&str]) -> recall_core::Result<Vec<Vec<f32>>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RecallError::embedding("transient failure"));
            }
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            384
        }

        fn max_chunk_chars(&self) -> usize {
            2000
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried_with_backoff() {
        let index = Arc::new(MemoryVectorIndex::new(384, IndexConfig::default()));
        let model = Arc::new(FlakyModel {
            inner: HashedTokenModel::new(384),
            failures_left: AtomicU32::new(2),
        });
        let embedder = Arc::new(Embedder::new(model, 16));
        let states = states();
        let pool = IndexingPool::start(pool_config(), embedder, index.clone(), states.clone(), 500);

        let doc = DocumentRef::new(Ulid::new(), Ulid::new(), "glycolysis");
        let doc_id = doc.id;
        index.track(doc.clone()).await.unwrap();
        states
            .write()
            .await
            .insert(doc_id, EmbeddingState::Unembedded);

        pool.enqueue(doc, "glycolysis".to_string()).await.unwrap();

        wait_for_state(
            &states,
            doc_id,
            EmbeddingState::Embedded { content_version: 1 },
        )
        .await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_state_unchanged() {
        let index = Arc::new(MemoryVectorIndex::new(384, IndexConfig::default()));
        let model = Arc::new(FlakyModel {
            inner: HashedTokenModel::new(384),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let embedder = Arc::new(Embedder::new(model, 16));
        let states = states();
        let config = IndexingConfig {
            max_retries: 1,
            ..pool_config()
        };
        let pool = IndexingPool::start(config, embedder, index.clone(), states.clone(), 500);

        let doc = DocumentRef::new(Ulid::new(), Ulid::new(), "electron transport");
        let doc_id = doc.id;
        let collection = doc.collection_id;
        index.track(doc.clone()).await.unwrap();
        states
            .write()
            .await
            .insert(doc_id, EmbeddingState::Unembedded);

        pool.enqueue(doc, "electron transport".to_string())
            .await
            .unwrap();

        // All attempts fail; the document must settle back to Unembedded,
        // never Embedded.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            states.read().await.get(&doc_id),
            Some(&EmbeddingState::Unembedded)
        );
        assert_eq!(index.collection_len(collection).await, 0);

        // Text stays parked for a later re-embed request.
        assert_eq!(pool.pending_len().await, 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_reembed_request_uses_parked_text() {
        let index = Arc::new(MemoryVectorIndex::new(384, IndexConfig::default()));
        let model = Arc::new(FlakyModel {
            inner: HashedTokenModel::new(384),
            failures_left: AtomicU32::new(2),
        });
        let embedder = Arc::new(Embedder::new(model, 16));
        let states = states();
        let config = IndexingConfig {
            // First job fails outright (one attempt, one failure left over).
            max_retries: 0,
            ..pool_config()
        };
        let pool = IndexingPool::start(config, embedder, index.clone(), states.clone(), 500);

        let doc = DocumentRef::new(Ulid::new(), Ulid::new(), "oxidative phosphorylation");
        let doc_id = doc.id;
        index.track(doc.clone()).await.unwrap();
        states
            .write()
            .await
            .insert(doc_id, EmbeddingState::Unembedded);

        pool.enqueue(doc, "oxidative phosphorylation".to_string())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.pending_len().await, 1);

        // Two requests: first burns the remaining injected failure, second
        // succeeds from the parked text.
        pool.request_reembed(doc_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.request_reembed(doc_id).await.unwrap();

        wait_for_state(
            &states,
            doc_id,
            EmbeddingState::Embedded { content_version: 1 },
        )
        .await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let index = Arc::new(MemoryVectorIndex::new(384, IndexConfig::default()));
        let embedder = Arc::new(Embedder::new(Arc::new(HashedTokenModel::new(384)), 16));
        let pool = IndexingPool::start(pool_config(), embedder, index, states(), 500);

        pool.shutdown().await;

        let doc = DocumentRef::new(Ulid::new(), Ulid::new(), "text");
        let result = pool.enqueue(doc, "text".to_string()).await;
        assert!(result.is_err());
    }
}
