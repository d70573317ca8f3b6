//! Section-boundary chunking for note text.
//!
//! Notes arrive as markdown. Long inputs are split at section headers so
//! each chunk keeps one coherent topic; sections that still exceed the cap
//! fall back to paragraph splits, then to a hard character cap.

use pulldown_cmark::{Event, Parser, Tag};

/// Splits note text into bounded-length chunks at structural boundaries.
pub struct SectionChunker {
    /// Hard character cap per chunk.
    max_chars: usize,
}

impl SectionChunker {
    /// Create a chunker with the given per-chunk character cap.
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    /// Split text into chunks. Empty/whitespace-only sections are dropped;
    /// text without headers comes back as a single chunk (or its paragraph
    /// splits when over the cap).
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();

        for section in self.split_at_headings(text) {
            let section = section.trim();
            if section.is_empty() {
                continue;
            }

            if section.chars().count() <= self.max_chars {
                chunks.push(section.to_string());
            } else {
                chunks.extend(self.split_long_section(section));
            }
        }

        chunks
    }

    /// Section boundaries are the byte offsets of markdown headings.
    fn split_at_headings<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut boundaries = Vec::new();

        for (event, range) in Parser::new(text).into_offset_iter() {
            if let Event::Start(Tag::Heading { .. }) = event {
                boundaries.push(range.start);
            }
        }

        if boundaries.is_empty() {
            return vec![text];
        }

        let mut sections = Vec::new();
        if boundaries[0] > 0 {
            sections.push(&text[..boundaries[0]]);
        }
        for (i, &start) in boundaries.iter().enumerate() {
            let end = boundaries.get(i + 1).copied().unwrap_or(text.len());
            sections.push(&text[start..end]);
        }

        sections
    }

    /// Pack paragraphs greedily up to the cap; paragraphs that alone exceed
    /// the cap are split at the character level.
    fn split_long_section(&self, section: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;

        for para in section.split("\n\n") {
            let para = para.trim();
            if para.is_empty() {
                continue;
            }

            let para_chars = para.chars().count();

            if para_chars > self.max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_chars = 0;
                }
                chunks.extend(self.split_by_size(para));
                continue;
            }

            // +2 for the paragraph separator
            if current_chars + para_chars + 2 > self.max_chars && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }

            if current.is_empty() {
                current.push_str(para);
                current_chars = para_chars;
            } else {
                current.push_str("\n\n");
                current.push_str(para);
                current_chars += para_chars + 2;
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }

    /// Hard cap split, preferring whitespace break points.
    fn split_by_size(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let end = (start + self.max_chars).min(chars.len());

            let mut actual_end = end;
            if end < chars.len() {
                for i in (start + 1..end).rev() {
                    if chars[i].is_whitespace() {
                        actual_end = i + 1;
                        break;
                    }
                }
            }

            let chunk: String = chars[start..actual_end].iter().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
            start = actual_end;
        }

        chunks
    }
}
