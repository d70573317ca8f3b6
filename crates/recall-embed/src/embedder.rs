//! Document-level embedder.
//!
//! Wraps an [`EmbeddingModel`] with input validation, section chunking, and
//! chunk-vector pooling. The pooling strategy is mean pooling, applied
//! uniformly to every call: chunk vectors are averaged component-wise and
//! the pooled vector is L2-normalized. Queries and documents go through the
//! same pipeline (the model is symmetric), so a document queried with its
//! own text scores ~1.0.

use std::sync::Arc;

use tracing::debug;

use recall_core::{EmbeddingModel, RecallError, Result};

use crate::chunk::SectionChunker;

/// Embeds whole notes and query text into single document vectors.
pub struct Embedder {
    model: Arc<dyn EmbeddingModel>,
    chunker: SectionChunker,
    batch_size: usize,
}

impl Embedder {
    /// Create an embedder over a model backend.
    pub fn new(model: Arc<dyn EmbeddingModel>, batch_size: usize) -> Self {
        let chunker = SectionChunker::new(model.max_chunk_chars());
        Self {
            model,
            chunker,
            batch_size: batch_size.max(1),
        }
    }

    /// Embedding dimension of the underlying model.
    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    /// Embed one document's text into a single vector.
    ///
    /// Long inputs are split at section boundaries and the chunk vectors
    /// are mean-pooled. Fails with `InvalidInput` on empty text; never
    /// returns a zero vector.
    pub async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(RecallError::invalid_input("cannot embed empty text"));
        }

        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Err(RecallError::invalid_input("cannot embed empty text"));
        }

        debug!(chunks = chunks.len(), "embedding document");

        let mut chunk_vectors = Vec::with_capacity(chunks.len());

        // One batch per await: dropping the future cancels cleanly at a
        // batch boundary, and no partial result escapes.
        for batch in chunks.chunks(self.batch_size) {
            let refs: Vec<&str> = batch.iter().map(|s| s.as_str()).collect();
            let vectors = self.model.embed_batch(&refs).await?;
            self.check_dimensions(&vectors)?;
            chunk_vectors.extend(vectors);
        }

        if chunk_vectors.len() == 1 {
            return Ok(chunk_vectors.into_iter().next().unwrap());
        }

        Ok(mean_pool(&chunk_vectors))
    }

    /// Embed several documents. Results are in input order; the first
    /// failure aborts the call (callers needing per-item outcomes embed
    /// individually).
    pub async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_document(text).await?);
        }
        Ok(out)
    }

    /// Embed free query text. Same pipeline as documents.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_document(text).await
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<()> {
        let expected = self.model.dimension();
        for v in vectors {
            if v.len() != expected {
                return Err(RecallError::DimensionMismatch {
                    expected,
                    got: v.len(),
                });
            }
        }
        Ok(())
    }
}

/// Component-wise mean of chunk vectors, re-normalized to unit length.
fn mean_pool(vectors: &[Vec<f32>]) -> Vec<f32> {
    let dim = vectors[0].len();
    let mut pooled = vec![0.0f32; dim];

    for vector in vectors {
        for (p, x) in pooled.iter_mut().zip(vector) {
            *p += x;
        }
    }

    let n = vectors.len() as f32;
    for p in &mut pooled {
        *p /= n;
    }

    let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for p in &mut pooled {
            *p /= norm;
        }
    }

    pooled
}
