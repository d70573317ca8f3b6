//! recall-embed - Embedding models and document embedder
//!
//! Turns note text into fixed-dimension vectors:
//!
//! - [`OnnxEmbeddingModel`]: ONNX Runtime inference for MiniLM-class
//!   sentence encoders, mean pooling with attention mask, L2 normalization.
//! - [`HashedTokenModel`]: deterministic lexical model for tests and
//!   model-free deployments.
//! - [`Embedder`]: document-level wrapper adding validation, section
//!   chunking, and mean pooling of chunk vectors.

mod chunk;
mod embedder;
mod hashed;
mod onnx;

pub use chunk::SectionChunker;
pub use embedder::Embedder;
pub use hashed::HashedTokenModel;
pub use onnx::OnnxEmbeddingModel;

// Re-export the model trait for convenience
pub use recall_core::EmbeddingModel;
