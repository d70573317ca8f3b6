//! Deterministic lexical embedding model.
//!
//! Feature-hashes lowercase tokens into a fixed-dimension term-frequency
//! vector and L2-normalizes it. No model files, no inference runtime; used
//! by tests and as the CLI's default backend. Similarity degrades to token
//! overlap, which is enough to exercise every ranking, isolation, and
//! consistency property of the index and coordinator.

use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use recall_core::{EmbeddingModel, RecallError, Result};

/// Token-hashing embedding model.
pub struct HashedTokenModel {
    dimension: usize,
    max_chunk_chars: usize,
}

impl HashedTokenModel {
    /// Create a model with the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            max_chunk_chars: 2000,
        }
    }

    /// Override the per-chunk character cap.
    pub fn with_max_chunk_chars(mut self, max_chunk_chars: usize) -> Self {
        self.max_chunk_chars = max_chunk_chars;
        self
    }

    fn bucket(&self, token: &str) -> usize {
        // DefaultHasher with default keys is stable across processes.
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() % self.dimension as u64) as usize
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        let mut token_count = 0usize;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            vector[self.bucket(&token)] += 1.0;
            token_count += 1;
        }

        if token_count == 0 {
            return Err(RecallError::invalid_input(
                "text contains no embeddable tokens",
            ));
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut vector {
            *x /= norm;
        }

        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingModel for HashedTokenModel {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_deterministic() {
        let model = HashedTokenModel::new(384);
        let a = model.embed_batch(&["gradient descent"]).await.unwrap();
        let b = model.embed_batch(&["gradient descent"]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_normalized_output() {
        let model = HashedTokenModel::new(384);
        let vectors = model
            .embed_batch(&["neural networks learn representations"])
            .await
            .unwrap();
        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_self_similarity_is_one() {
        let model = HashedTokenModel::new(384);
        let vectors = model
            .embed_batch(&["supervised learning", "supervised learning"])
            .await
            .unwrap();
        assert!((cosine(&vectors[0], &vectors[1]) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_case_insensitive() {
        let model = HashedTokenModel::new(384);
        let vectors = model
            .embed_batch(&["Neural Networks", "neural networks"])
            .await
            .unwrap();
        assert!((cosine(&vectors[0], &vectors[1]) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_overlap_scores_between_disjoint_and_identical() {
        let model = HashedTokenModel::new(384);
        let vectors = model
            .embed_batch(&[
                "neural networks",
                "deep neural networks",
                "organic chemistry reactions",
            ])
            .await
            .unwrap();

        let related = cosine(&vectors[0], &vectors[1]);
        let unrelated = cosine(&vectors[0], &vectors[2]);
        assert!(related > 0.5);
        assert!(unrelated < related);
    }

    #[tokio::test]
    async fn test_rejects_tokenless_input() {
        let model = HashedTokenModel::new(384);
        let result = model.embed_batch(&["..."]).await;
        assert!(matches!(result, Err(RecallError::InvalidInput { .. })));
    }
}
