//! recall-service - Owned retrieval service facade
//!
//! Ties the embedder, the durable vector index, the retrieval coordinator,
//! and the indexing worker pool into one explicitly-owned service with a
//! startup/shutdown lifecycle. The external document-CRUD layer drives it
//! through three lifecycle calls (`on_document_created`,
//! `on_document_updated`, `on_document_deleted`) and reads back through
//! `get_context_for_note` / `get_related`.

mod service;
mod worker;

pub use service::{BatchReport, CollectionStats, ReindexItem, RetrievalService};
pub use worker::IndexingPool;
