//! Retrieval coordinator.
//!
//! Orchestrates embed -> scoped query -> threshold filter -> budget
//! truncation for a new note, and the related-notes lookup for an existing
//! one. Retrieval failures on the context path degrade to an empty bundle
//! with a skip flag; they never become errors that block the caller's
//! generation request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};
use ulid::Ulid;

use recall_core::{
    truncate_snippet, ApproxNearestNeighborIndex, ContextBundle, RecallError, Result,
    RetrievalConfig, RetrievalResult, ScoredDocument, SkipReason,
};
use recall_embed::Embedder;

/// Per-call parameters for context retrieval.
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Maximum results to accept.
    pub k: usize,

    /// Minimum similarity score.
    pub similarity_threshold: f32,

    /// Hard cap on total snippet characters.
    pub max_context_chars: usize,

    /// Per-item snippet cap in characters.
    pub snippet_chars: usize,
}

impl From<&RetrievalConfig> for ContextParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            k: config.context_top_k,
            similarity_threshold: config.context_similarity_threshold,
            max_context_chars: config.max_context_chars,
            snippet_chars: config.snippet_chars,
        }
    }
}

/// Coordinates retrieval over an embedder and a scoped vector index.
pub struct RetrievalCoordinator<I> {
    index: Arc<I>,
    embedder: Arc<Embedder>,
    config: RetrievalConfig,

    /// Documents seen with stale vectors are reported here so the indexing
    /// side can schedule re-embeds.
    stale_tx: Option<UnboundedSender<Ulid>>,
}

impl<I> RetrievalCoordinator<I>
where
    I: ApproxNearestNeighborIndex,
{
    /// Create a coordinator.
    pub fn new(index: Arc<I>, embedder: Arc<Embedder>, config: RetrievalConfig) -> Self {
        Self {
            index,
            embedder,
            config,
            stale_tx: None,
        }
    }

    /// Wire up the stale-document notification channel.
    pub fn with_stale_notifier(mut self, tx: UnboundedSender<Ulid>) -> Self {
        self.stale_tx = Some(tx);
        self
    }

    /// Retrieve context for a new note using the configured parameters.
    pub async fn get_context(&self, new_text: &str, collection_id: Ulid) -> Result<ContextBundle> {
        let params = ContextParams::from(&self.config);
        self.get_context_with(new_text, collection_id, &params).await
    }

    /// Retrieve context for a new note with explicit parameters.
    ///
    /// Parameter violations and unknown collections are rejected up front;
    /// embedding failures, index outages, and deadline overruns all return
    /// an empty bundle flagged with the skip reason instead.
    pub async fn get_context_with(
        &self,
        new_text: &str,
        collection_id: Ulid,
        params: &ContextParams,
    ) -> Result<ContextBundle> {
        validate_params(params)?;
        if new_text.trim().is_empty() {
            return Err(RecallError::invalid_argument("new_text must not be empty"));
        }
        if !self.index.contains_collection(collection_id).await {
            return Err(RecallError::invalid_argument(format!(
                "unknown collection: {}",
                collection_id
            )));
        }

        let deadline = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(deadline, self.retrieve(new_text, collection_id, params)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Context retrieval timed out after {}ms for collection {}",
                    self.config.timeout_ms, collection_id
                );
                Ok(ContextBundle::skipped(SkipReason::TimedOut))
            }
        }
    }

    async fn retrieve(
        &self,
        new_text: &str,
        collection_id: Ulid,
        params: &ContextParams,
    ) -> Result<ContextBundle> {
        let vector = match self.embedder.embed_query(new_text).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Context retrieval skipped, embedding failed: {}", e);
                return Ok(ContextBundle::skipped(SkipReason::EmbeddingFailed));
            }
        };

        let outcome = match self
            .index
            .query(collection_id, &vector, params.k, params.similarity_threshold)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                error!("Context retrieval skipped, index query failed: {}", e);
                return Ok(ContextBundle::skipped(SkipReason::IndexUnavailable));
            }
        };

        self.notify_stale(&outcome.stale);

        let bundle = assemble(outcome.matches, params);
        debug!(
            accepted = bundle.results.len(),
            dropped = bundle.dropped_for_budget,
            "assembled context bundle"
        );
        Ok(bundle)
    }

    /// Related notes for an existing document, using its current vector as
    /// the query and the (lower) related-notes threshold.
    ///
    /// Unlike the context path this surfaces index errors to the caller;
    /// a document with no current vector just yields an empty list.
    pub async fn get_related(&self, document_id: Ulid, k: usize) -> Result<Vec<RetrievalResult>> {
        if k == 0 {
            return Err(RecallError::invalid_argument("k must be >= 1"));
        }

        let Some((collection_id, vector)) = self.index.vector_of(document_id).await? else {
            warn!("No current vector for document {}", document_id);
            return Ok(Vec::new());
        };

        // Fetch one extra so the document itself can be excluded.
        let outcome = self
            .index
            .query(
                collection_id,
                &vector,
                k + 1,
                self.config.related_similarity_threshold,
            )
            .await?;

        self.notify_stale(&outcome.stale);

        let results = outcome
            .matches
            .into_iter()
            .filter(|m| m.document_id != document_id)
            .take(k)
            .enumerate()
            .map(|(i, m)| RetrievalResult {
                document_id: m.document_id,
                similarity: m.similarity,
                rank: i as u32 + 1,
                snippet: truncate_snippet(&m.excerpt, self.config.snippet_chars),
            })
            .collect();

        Ok(results)
    }

    fn notify_stale(&self, stale: &[Ulid]) {
        let Some(tx) = &self.stale_tx else {
            return;
        };
        for id in stale {
            // Receiver shutdown just means nobody re-embeds anymore.
            let _ = tx.send(*id);
        }
    }
}

fn validate_params(params: &ContextParams) -> Result<()> {
    if params.k == 0 {
        return Err(RecallError::invalid_argument("k must be >= 1"));
    }
    if !(0.0..=1.0).contains(&params.similarity_threshold) {
        return Err(RecallError::invalid_argument(
            "similarity_threshold must be within [0, 1]",
        ));
    }
    if params.max_context_chars == 0 {
        return Err(RecallError::invalid_argument(
            "max_context_chars must be >= 1",
        ));
    }
    if params.snippet_chars == 0 {
        return Err(RecallError::invalid_argument("snippet_chars must be >= 1"));
    }
    Ok(())
}

/// Greedily accept matches in score order until the next snippet would
/// exceed the budget, then stop early rather than exceed it.
fn assemble(matches: Vec<ScoredDocument>, params: &ContextParams) -> ContextBundle {
    let mut results = Vec::new();
    let mut used_chars = 0usize;
    let mut dropped = 0usize;

    for (i, doc) in matches.iter().enumerate() {
        let snippet = truncate_snippet(&doc.excerpt, params.snippet_chars);
        let snippet_chars = snippet.chars().count();

        if used_chars + snippet_chars > params.max_context_chars {
            dropped = matches.len() - i;
            break;
        }

        used_chars += snippet_chars;
        results.push(RetrievalResult {
            document_id: doc.document_id,
            similarity: doc.similarity,
            rank: results.len() as u32 + 1,
            snippet,
        });
    }

    ContextBundle {
        results,
        dropped_for_budget: dropped,
        skipped: None,
    }
}
