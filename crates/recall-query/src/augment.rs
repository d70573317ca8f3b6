//! Generation augmenter.
//!
//! Folds a retrieval bundle and the new note text into a size-bounded
//! [`ContextBlob`] for the external generation step. When the assembled
//! size exceeds the generator's limit, the lowest-similarity sections give
//! way first; the highest-similarity context survives longest, and the new
//! note text itself is only cut once no retrieved section is left.

use tracing::debug;

use recall_core::{truncate_snippet, ContextBlob, ContextBundle, ContextSection};

/// Builds bounded prompt-context artifacts.
pub struct GenerationAugmenter {
    /// Hard cap on the total character count of the blob.
    max_total_chars: usize,
}

impl GenerationAugmenter {
    /// Create an augmenter with the given total size limit.
    pub fn new(max_total_chars: usize) -> Self {
        Self {
            max_total_chars: max_total_chars.max(1),
        }
    }

    /// Merge ranked results and the new text into a bounded blob.
    pub fn build_prompt_context(&self, new_text: &str, bundle: &ContextBundle) -> ContextBlob {
        let mut sections: Vec<ContextSection> = bundle
            .results
            .iter()
            .map(|r| ContextSection {
                document_id: r.document_id,
                similarity: r.similarity,
                snippet: r.snippet.clone(),
            })
            .collect();

        let mut blob = ContextBlob {
            sections: Vec::new(),
            new_text: new_text.to_string(),
        };

        // Shrink from the tail: results arrive in descending similarity,
        // so the last section is always the least relevant one.
        while !sections.is_empty() {
            let section_chars: usize = sections
                .iter()
                .map(|s| s.snippet.chars().count())
                .sum::<usize>();
            let total = section_chars + blob.new_text.chars().count();

            if total <= self.max_total_chars {
                break;
            }

            let over = total - self.max_total_chars;
            let last = sections.last_mut().unwrap();
            let last_chars = last.snippet.chars().count();

            if last_chars > over {
                last.snippet = truncate_snippet(&last.snippet, last_chars - over);
            } else {
                let dropped = sections.pop().unwrap();
                debug!(
                    "Dropped section for document {} to fit generator limit",
                    dropped.document_id
                );
            }
        }

        blob.sections = sections;

        // Last resort: a new note longer than the generator limit.
        if blob.sections.is_empty() && blob.new_text.chars().count() > self.max_total_chars {
            blob.new_text = truncate_snippet(&blob.new_text, self.max_total_chars);
        }

        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use recall_core::RetrievalResult;
    use ulid::Ulid;

    fn bundle(snippets: &[(&str, f32)]) -> ContextBundle {
        ContextBundle {
            results: snippets
                .iter()
                .enumerate()
                .map(|(i, (snippet, similarity))| RetrievalResult {
                    document_id: Ulid::new(),
                    similarity: *similarity,
                    rank: i as u32 + 1,
                    snippet: snippet.to_string(),
                })
                .collect(),
            dropped_for_budget: 0,
            skipped: None,
        }
    }

    #[test]
    fn test_fits_unchanged_when_under_limit() {
        let augmenter = GenerationAugmenter::new(1000);
        let bundle = bundle(&[("alpha decay", 0.9), ("beta decay", 0.7)]);

        let blob = augmenter.build_prompt_context("gamma decay", &bundle);

        assert_eq!(blob.sections.len(), 2);
        assert_eq!(blob.new_text, "gamma decay");
        assert!(blob.total_chars() <= 1000);
    }

    #[test]
    fn test_lowest_similarity_dropped_first() {
        // new_text (8) + 10 + 10 + 10 = 38; limit 20 drops the 0.5
        // section outright and trims the 0.7 one.
        let augmenter = GenerationAugmenter::new(20);
        let bundle = bundle(&[("aaaaaaaaaa", 0.9), ("bbbbbbbbbb", 0.7), ("cccccccccc", 0.5)]);

        let blob = augmenter.build_prompt_context("12345678", &bundle);

        assert!(blob.total_chars() <= 20);
        // The 0.9 section must survive intact.
        assert_eq!(blob.sections.len(), 2);
        assert_eq!(blob.sections[0].snippet, "aaaaaaaaaa");
        assert_eq!(blob.sections[1].snippet, "bb");
        assert!(blob.sections.iter().all(|s| s.similarity >= 0.7));
    }

    #[test]
    fn test_partial_truncation_of_tail_section() {
        // new_text (4) + 10 + 10 = 24; limit 20 trims 4 chars off the tail.
        let augmenter = GenerationAugmenter::new(20);
        let bundle = bundle(&[("aaaaaaaaaa", 0.9), ("bbbbbbbbbb", 0.7)]);

        let blob = augmenter.build_prompt_context("1234", &bundle);

        assert_eq!(blob.total_chars(), 20);
        assert_eq!(blob.sections.len(), 2);
        assert_eq!(blob.sections[0].snippet, "aaaaaaaaaa");
        assert_eq!(blob.sections[1].snippet, "bbbbbb");
    }

    #[test]
    fn test_never_exceeds_limit_even_without_sections() {
        let augmenter = GenerationAugmenter::new(10);
        let empty = ContextBundle::default();

        let blob = augmenter.build_prompt_context("a very long note body indeed", &empty);

        assert!(blob.total_chars() <= 10);
        assert!(blob.sections.is_empty());
    }

    #[test]
    fn test_empty_bundle_renders_new_text_only() {
        let augmenter = GenerationAugmenter::new(1000);
        let blob = augmenter.build_prompt_context("osmosis notes", &ContextBundle::default());

        let rendered = blob.render();
        assert!(rendered.contains("### New note"));
        assert!(rendered.contains("osmosis notes"));
        assert!(!rendered.contains("Prior note"));
    }
}
