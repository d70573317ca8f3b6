//! recall-index - Scoped vector index over embedding records
//!
//! Stores one embedding record per document and answers collection-scoped
//! top-k cosine-similarity queries. Small collections are scanned
//! brute-force; collections past a size threshold get a per-collection
//! HNSW graph. [`DurableVectorIndex`] persists records to SQLite and
//! rebuilds the in-memory side at startup.

mod ann;
mod durable;
mod memory;
mod schema;
mod store;

pub use ann::HnswGraph;
pub use durable::DurableVectorIndex;
pub use memory::MemoryVectorIndex;
pub use store::EmbeddingStore;

// Re-export schema for testing/migrations
pub use schema::SCHEMA;
