//! Configuration types for the retrieval system.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the retrieval core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Embedding-record storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding model configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration.
    #[serde(default)]
    pub index: IndexConfig,

    /// Retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Indexing worker configuration.
    #[serde(default)]
    pub indexing: IndexingConfig,
}

/// Embedding-record storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file holding embedding records.
    pub path: PathBuf,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: 30000,
        }
    }
}

/// Embedding model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Path to the ONNX model directory (model.onnx + tokenizer.json).
    pub model_path: PathBuf,

    /// Embedding dimension of the model.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Batch size for chunk embedding.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Hard character cap per chunk when no structural boundary applies.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// Number of threads for CPU inference.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            dimension: 384,
            batch_size: 16,
            max_chunk_chars: 2000,
            num_threads: 4,
        }
    }
}

/// Vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Collection size above which a graph index is built; below it,
    /// brute-force scan is used.
    #[serde(default = "default_ann_graph_threshold")]
    pub ann_graph_threshold: usize,

    /// Max graph neighbors per node per layer.
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,

    /// Search beam width during graph construction.
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,

    /// Search beam width during queries.
    #[serde(default = "default_hnsw_ef_search")]
    pub hnsw_ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ann_graph_threshold: 256,
            hnsw_m: 16,
            hnsw_ef_construction: 100,
            hnsw_ef_search: 64,
        }
    }
}

/// Retrieval configuration.
///
/// Context retrieval and the related-notes display use independently
/// configured thresholds; the context path is stricter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of prior notes retrieved as generation context.
    #[serde(default = "default_context_top_k")]
    pub context_top_k: usize,

    /// Minimum similarity for generation context.
    #[serde(default = "default_context_threshold")]
    pub context_similarity_threshold: f32,

    /// Number of related notes returned for display.
    #[serde(default = "default_related_top_k")]
    pub related_top_k: usize,

    /// Minimum similarity for the related-notes display.
    #[serde(default = "default_related_threshold")]
    pub related_similarity_threshold: f32,

    /// Hard cap on total retrieved snippet characters per request.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Per-item snippet cap in characters.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,

    /// Total size limit of the assembled prompt context handed to the
    /// generation step.
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,

    /// Deadline for a whole retrieval call, in milliseconds. On timeout
    /// the caller receives an empty bundle, not an error.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            context_top_k: 3,
            context_similarity_threshold: 0.4,
            related_top_k: 5,
            related_similarity_threshold: 0.3,
            max_context_chars: 4000,
            snippet_chars: 500,
            max_prompt_chars: 8000,
            timeout_ms: 5000,
        }
    }
}

/// Indexing worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Number of embedding workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum retry attempts for a failed embed job.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries in milliseconds; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Capacity of the embed job queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 3,
            retry_backoff_ms: 250,
            queue_capacity: 1024,
        }
    }
}

// Default value functions

fn default_busy_timeout() -> u32 {
    30000
}

fn default_dimension() -> usize {
    384
}

fn default_batch_size() -> usize {
    16
}

fn default_max_chunk_chars() -> usize {
    2000
}

fn default_num_threads() -> usize {
    4
}

fn default_ann_graph_threshold() -> usize {
    256
}

fn default_hnsw_m() -> usize {
    16
}

fn default_hnsw_ef_construction() -> usize {
    100
}

fn default_hnsw_ef_search() -> usize {
    64
}

fn default_context_top_k() -> usize {
    3
}

fn default_context_threshold() -> f32 {
    0.4
}

fn default_related_top_k() -> usize {
    5
}

fn default_related_threshold() -> f32 {
    0.3
}

fn default_max_context_chars() -> usize {
    4000
}

fn default_snippet_chars() -> usize {
    500
}

fn default_max_prompt_chars() -> usize {
    8000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("recall")
        .join("embeddings.db")
}

fn default_model_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("recall")
        .join("models")
        .join("paraphrase-multilingual-MiniLM-L12-v2")
}

impl RecallConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            crate::error::RecallError::config(format!("Failed to parse config: {}", e))
        })?;
        Ok(config)
    }

    /// Load configuration from default paths, falling back to defaults.
    pub fn load_default() -> crate::error::Result<Self> {
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("recall").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        let local_config = PathBuf::from("recall.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RecallConfig::default();
        assert_eq!(config.retrieval.context_top_k, 3);
        assert_eq!(config.embedding.dimension, 384);
        assert!(
            config.retrieval.context_similarity_threshold
                > config.retrieval.related_similarity_threshold
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RecallConfig = toml::from_str(
            r#"
            [retrieval]
            context_top_k = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.context_top_k, 5);
        assert_eq!(config.retrieval.max_context_chars, 4000);
        assert_eq!(config.index.hnsw_m, 16);
    }
}
