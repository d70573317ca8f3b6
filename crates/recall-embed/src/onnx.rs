//! ONNX-based embedding model implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayViewD;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use recall_core::{EmbeddingConfig, EmbeddingModel, RecallError, Result};

/// Maximum tokens per input for MiniLM-class sentence encoders.
const MAX_TOKENS: usize = 512;

/// ONNX embedder for paraphrase-multilingual-MiniLM-L12-v2 or a compatible
/// symmetric sentence-embedding model (no query/document prefixes).
pub struct OnnxEmbeddingModel {
    /// ONNX inference session (Mutex for interior mutability).
    session: Mutex<Session>,

    /// Tokenizer for the model.
    tokenizer: Arc<Tokenizer>,

    /// Embedding dimension.
    dimension: usize,

    /// Hard character cap per chunk handed to this model.
    max_chunk_chars: usize,
}

impl OnnxEmbeddingModel {
    /// Load the model and tokenizer from a model directory containing
    /// `model.onnx` and `tokenizer.json`.
    pub fn open(config: &EmbeddingConfig) -> Result<Self> {
        let model_path = config.model_path.join("model.onnx");
        let tokenizer_path = config.model_path.join("tokenizer.json");
        Self::from_files(&model_path, &tokenizer_path, config)
    }

    /// Load from explicit file paths.
    pub fn from_files(
        model_path: impl AsRef<Path>,
        tokenizer_path: impl AsRef<Path>,
        config: &EmbeddingConfig,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let tokenizer_path = tokenizer_path.as_ref();

        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()
            .map_err(|e| RecallError::embedding(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| RecallError::embedding(format!("Failed to set optimization level: {}", e)))?
            .with_intra_threads(config.num_threads)
            .map_err(|e| RecallError::embedding(format!("Failed to set thread count: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| RecallError::embedding(format!("Failed to load model: {}", e)))?;

        info!("Loading tokenizer from {:?}", tokenizer_path);

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| RecallError::embedding(format!("Failed to load tokenizer: {}", e)))?;

        info!(
            "Embedding model initialized: dim={}, max_tokens={}",
            config.dimension, MAX_TOKENS
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer: Arc::new(tokenizer),
            dimension: config.dimension,
            max_chunk_chars: config.max_chunk_chars,
        })
    }

    /// Embed a batch of texts.
    fn run_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(RecallError::invalid_input("cannot embed empty text"));
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| RecallError::embedding(format!("Tokenization failed: {}", e)))?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .min(MAX_TOKENS);

        let batch_size = encodings.len();

        debug!("Embedding batch: size={}, max_len={}", batch_size, max_len);

        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];

        for (i, encoding) in encodings.iter().enumerate() {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let len = ids.len().min(max_len);

            for j in 0..len {
                input_ids[i * max_len + j] = ids[j] as i64;
                attention_mask[i * max_len + j] = mask[j] as i64;
            }
        }

        let input_ids_tensor = Tensor::from_array((vec![batch_size, max_len], input_ids))
            .map_err(|e| RecallError::embedding(format!("Failed to create input tensor: {}", e)))?;

        let attention_mask_tensor = Tensor::from_array((vec![batch_size, max_len], attention_mask))
            .map_err(|e| RecallError::embedding(format!("Failed to create mask tensor: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RecallError::embedding(format!("Failed to lock session: {}", e)))?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor
            ])
            .map_err(|e| RecallError::embedding(format!("Inference failed: {}", e)))?;

        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| RecallError::embedding("No output tensor found"))?;

        let view = output
            .try_extract_array::<f32>()
            .map_err(|e| RecallError::embedding(format!("Failed to extract tensor: {}", e)))?;

        let shape_dims: Vec<usize> = view.shape().to_vec();
        debug!("Output shape: {:?}", shape_dims);

        let embeddings = if shape_dims.len() == 3 {
            // (batch, seq, hidden): mean pool over the sequence dimension.
            self.mean_pool_tokens(&view, &encodings, max_len)?
        } else if shape_dims.len() == 2 {
            // (batch, hidden): already pooled by the exported model.
            let hidden_dim = shape_dims[1];
            (0..batch_size)
                .map(|i| {
                    let embedding: Vec<f32> = (0..hidden_dim).map(|j| view[[i, j]]).collect();
                    l2_normalize(embedding)
                })
                .collect()
        } else {
            return Err(RecallError::embedding(format!(
                "Unexpected output shape: {:?}",
                shape_dims
            )));
        };

        for embedding in &embeddings {
            if embedding.len() != self.dimension {
                return Err(RecallError::DimensionMismatch {
                    expected: self.dimension,
                    got: embedding.len(),
                });
            }
        }

        Ok(embeddings)
    }

    /// Mean pooling over valid (attention-masked) token positions.
    fn mean_pool_tokens(
        &self,
        tensor: &ArrayViewD<'_, f32>,
        encodings: &[tokenizers::Encoding],
        max_len: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let shape = tensor.shape();
        let seq_len = shape[1];
        let hidden_dim = shape[2];

        let mut embeddings = Vec::with_capacity(encodings.len());

        for (i, encoding) in encodings.iter().enumerate() {
            let attention_mask = encoding.get_attention_mask();
            let valid_len = attention_mask
                .iter()
                .take(max_len)
                .filter(|&&m| m == 1)
                .count();

            if valid_len == 0 {
                return Err(RecallError::invalid_input(
                    "input produced no valid tokens",
                ));
            }

            let mut sum = vec![0.0f32; hidden_dim];
            for j in 0..valid_len.min(max_len).min(seq_len) {
                if j < attention_mask.len() && attention_mask[j] == 1 {
                    for k in 0..hidden_dim {
                        sum[k] += tensor[[i, j, k]];
                    }
                }
            }

            let embedding: Vec<f32> = sum.iter().map(|s| s / valid_len as f32).collect();
            embeddings.push(l2_normalize(embedding));
        }

        Ok(embeddings)
    }
}

/// L2 normalize a vector.
fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl EmbeddingModel for OnnxEmbeddingModel {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        // Inference runs synchronously; the Session is not Send, and calls
        // are serialized by the session Mutex.
        self.run_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }
}
