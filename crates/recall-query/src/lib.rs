//! recall-query - Retrieval coordinator and generation augmenter
//!
//! The query side of the retrieval core:
//!
//! - [`RetrievalCoordinator`]: embed -> scoped query -> threshold filter ->
//!   budget truncation, bounded by a deadline, degrading to an empty bundle
//!   whenever retrieval cannot complete.
//! - [`GenerationAugmenter`]: folds a bundle and the new note text into a
//!   size-bounded [`ContextBlob`](recall_core::ContextBlob) for the external
//!   generation step.

mod augment;
mod coordinator;

pub use augment::GenerationAugmenter;
pub use coordinator::{ContextParams, RetrievalCoordinator};

// Re-export for convenience
pub use recall_core::{ContextBlob, ContextBundle, RetrievalResult, SkipReason};
