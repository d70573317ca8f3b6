//! Core domain types for the retrieval system.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Truncate text to at most `max_chars`, respecting char boundaries.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Read-only projection of a document owned by the external document store.
///
/// The retrieval core never reads or writes document rows beyond these
/// fields; the projection is what makes stale-vector filtering possible at
/// query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Document identifier (ULID).
    pub id: Ulid,

    /// Collection (course) the document belongs to. Hard isolation key.
    pub collection_id: Ulid,

    /// Monotonic content version maintained by the document store.
    pub content_version: u64,

    /// Blake3 hash of the text the current version was derived from.
    /// Used to skip re-embedding when an update did not change the text.
    #[serde(with = "serde_bytes_opt", default)]
    pub content_hash: Option<[u8; 32]>,
}

impl DocumentRef {
    /// Create a projection for a freshly created document (version 1).
    pub fn new(id: Ulid, collection_id: Ulid, text: &str) -> Self {
        Self {
            id,
            collection_id,
            content_version: 1,
            content_hash: Some(*blake3::hash(text.as_bytes()).as_bytes()),
        }
    }

    /// Projection for a known version of an existing document.
    pub fn at_version(id: Ulid, collection_id: Ulid, content_version: u64, text: &str) -> Self {
        Self {
            id,
            collection_id,
            content_version,
            content_hash: Some(*blake3::hash(text.as_bytes()).as_bytes()),
        }
    }

    /// Check whether new text differs from the hashed text of this version.
    pub fn content_changed(&self, new_text: &str) -> bool {
        let new_hash = blake3::hash(new_text.as_bytes());
        self.content_hash
            .map(|h| h != *new_hash.as_bytes())
            .unwrap_or(true)
    }
}

/// A document's vector, the only persisted state owned by the core.
///
/// There is exactly one record per document at any time. Records are
/// replaced wholesale on content updates and hard-deleted when the document
/// is deleted; they are never partially updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Document this vector was computed for.
    pub document_id: Ulid,

    /// Collection scope, denormalized for scoped queries.
    pub collection_id: Ulid,

    /// The embedding vector (fixed model dimension, L2-normalized).
    pub vector: Vec<f32>,

    /// Content version the vector was computed from. A record whose version
    /// trails the document's current version is stale and must not be
    /// returned by queries.
    pub content_version: u64,

    /// Leading excerpt of the embedded text, cached so query results can
    /// carry snippets without a round-trip to the document store.
    pub excerpt: String,

    /// Last write time (Unix millis). Recency tie-break for equal scores.
    pub updated_at: u64,
}

impl EmbeddingRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        document_id: Ulid,
        collection_id: Ulid,
        vector: Vec<f32>,
        content_version: u64,
    ) -> Self {
        Self {
            document_id,
            collection_id,
            vector,
            content_version,
            excerpt: String::new(),
            updated_at: now_millis(),
        }
    }

    /// Attach an excerpt, truncated to `cap` characters.
    pub fn with_excerpt(mut self, text: &str, cap: usize) -> Self {
        self.excerpt = truncate_snippet(text, cap);
        self
    }
}

/// A single retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Matched document.
    pub document_id: Ulid,

    /// Cosine similarity in [0, 1].
    pub similarity: f32,

    /// Rank (1-based) in the accepted result list.
    pub rank: u32,

    /// Snippet of the matched document, truncated to the per-item cap.
    pub snippet: String,
}

/// Why a retrieval call produced no context.
///
/// Retrieval is an enhancement, not a hard dependency of generation; these
/// reasons are observable in logs and metrics but never surfaced to the
/// note-creation caller as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Embedding the query text failed.
    EmbeddingFailed,

    /// The vector index was unreachable.
    IndexUnavailable,

    /// The retrieval call exceeded its deadline.
    TimedOut,
}

/// Ordered, budget-bounded retrieval output for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Accepted results, descending similarity, ranks assigned 1..n.
    pub results: Vec<RetrievalResult>,

    /// Results above threshold that were dropped to stay within the
    /// context budget. Observable for logging and metrics.
    pub dropped_for_budget: usize,

    /// Set when retrieval was skipped entirely; the bundle is then empty.
    pub skipped: Option<SkipReason>,
}

impl ContextBundle {
    /// An empty bundle recording why retrieval was skipped.
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            results: Vec::new(),
            dropped_for_budget: 0,
            skipped: Some(reason),
        }
    }

    /// Whether the bundle carries no context.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Total snippet characters across accepted results.
    pub fn total_chars(&self) -> usize {
        self.results.iter().map(|r| r.snippet.chars().count()).sum()
    }
}

/// One prior-note section inside a [`ContextBlob`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Source document.
    pub document_id: Ulid,

    /// Similarity of the section to the new text.
    pub similarity: f32,

    /// Snippet text.
    pub snippet: String,
}

/// Size-bounded artifact handed to the external generation step.
///
/// Carries the ordered prior-note sections plus the new text. Has no
/// dependency on the generator's output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBlob {
    /// Prior-note sections, descending similarity.
    pub sections: Vec<ContextSection>,

    /// The new note text being processed.
    pub new_text: String,
}

impl ContextBlob {
    /// Total character count of the assembled artifact.
    pub fn total_chars(&self) -> usize {
        self.new_text.chars().count()
            + self
                .sections
                .iter()
                .map(|s| s.snippet.chars().count())
                .sum::<usize>()
    }

    /// Render the prompt fragment consumed by the generation step:
    /// numbered prior-note sections with similarity percentages, followed
    /// by the new note text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            let pct = (section.similarity * 100.0).round() as u32;
            out.push_str(&format!(
                "### Prior note {} (relevance {}%)\n{}\n\n---\n\n",
                i + 1,
                pct,
                section.snippet
            ));
        }
        out.push_str("### New note\n");
        out.push_str(&self.new_text);
        out
    }
}

/// Embedding lifecycle state of a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingState {
    /// No vector has ever been computed.
    Unembedded,

    /// A worker is computing the vector right now.
    Embedding,

    /// Vector matches this content version.
    Embedded { content_version: u64 },

    /// Content moved past the vector; a re-embed is pending.
    Stale { content_version: u64 },

    /// Document deleted; vector removed.
    Deleted,
}

impl EmbeddingState {
    /// Transition on successful embedding at `version`.
    ///
    /// Deleted documents stay deleted even if a slow worker finishes after
    /// the delete.
    pub fn embedded(self, version: u64) -> Self {
        match self {
            Self::Deleted => Self::Deleted,
            _ => Self::Embedded {
                content_version: version,
            },
        }
    }

    /// Transition on a content change to `version`.
    pub fn content_changed(self, version: u64) -> Self {
        match self {
            Self::Deleted => Self::Deleted,
            Self::Unembedded => Self::Unembedded,
            _ => Self::Stale {
                content_version: version,
            },
        }
    }

    /// Whether this state has a pending embed.
    pub fn needs_embedding(&self) -> bool {
        matches!(self, Self::Unembedded | Self::Stale { .. })
    }
}

/// Helper module for optional byte array serialization (hex-encoded).
mod serde_bytes_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => hex::encode(bytes).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(hex_str) => {
                let bytes = hex::decode(&hex_str).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("invalid hash length"))?;
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_changed() {
        let doc = DocumentRef::new(Ulid::new(), Ulid::new(), "linear regression");
        assert!(!doc.content_changed("linear regression"));
        assert!(doc.content_changed("logistic regression"));
    }

    #[test]
    fn test_truncate_snippet() {
        assert_eq!(truncate_snippet("short", 10), "short");
        assert_eq!(truncate_snippet("abcdef", 3), "abc");
        // Multi-byte chars must not be split.
        assert_eq!(truncate_snippet("héllo", 2), "hé");
    }

    #[test]
    fn test_state_machine_happy_path() {
        let s = EmbeddingState::Unembedded;
        let s = s.embedded(1);
        assert_eq!(s, EmbeddingState::Embedded { content_version: 1 });

        let s = s.content_changed(2);
        assert_eq!(s, EmbeddingState::Stale { content_version: 2 });
        assert!(s.needs_embedding());

        let s = s.embedded(2);
        assert_eq!(s, EmbeddingState::Embedded { content_version: 2 });
    }

    #[test]
    fn test_state_machine_delete_is_terminal() {
        let s = EmbeddingState::Deleted;
        assert_eq!(s.embedded(3), EmbeddingState::Deleted);
        assert_eq!(s.content_changed(4), EmbeddingState::Deleted);
        assert!(!s.needs_embedding());
    }

    #[test]
    fn test_bundle_skipped() {
        let bundle = ContextBundle::skipped(SkipReason::TimedOut);
        assert!(bundle.is_empty());
        assert_eq!(bundle.skipped, Some(SkipReason::TimedOut));
    }

    #[test]
    fn test_blob_render_contains_sections() {
        let blob = ContextBlob {
            sections: vec![ContextSection {
                document_id: Ulid::new(),
                similarity: 0.82,
                snippet: "gradient descent converges".to_string(),
            }],
            new_text: "today: stochastic gradient descent".to_string(),
        };
        let rendered = blob.render();
        assert!(rendered.contains("Prior note 1 (relevance 82%)"));
        assert!(rendered.contains("gradient descent converges"));
        assert!(rendered.contains("### New note"));
    }
}
