//! Text chunking with structure awareness
//!
//! This module handles splitting documents into chunks while:
//! - Respecting heading boundaries when possible
//! - Maintaining code block integrity
//! - Providing stable, deterministic chunk boundaries
//! - Computing content hashes for incremental updates
//!
//! Sizes are budgeted in characters at four characters per token, so a
//! chunk's `token_estimate` never exceeds the configured ceiling even after
//! the overlap prefix is added.

mod boundaries;
mod markdown;

pub use boundaries::*;
pub use markdown::{split_sections, Section};

use crate::config::ChunkConfig;
use crate::error::{Error, Result};
use crate::models::{Chunk, ContentKind, SourceDocument};
use blake3::Hasher;
use tracing::trace;

/// Characters per estimated token
pub const CHARS_PER_TOKEN: usize = 4;

/// Token estimate for a piece of text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Compute a stable hash for document content
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize().to_hex().to_string()
}

/// Compute a stable hash for a string
pub fn compute_text_hash(text: &str) -> String {
    compute_content_hash(text.as_bytes())
}

#[derive(Debug, Clone)]
struct Fragment {
    heading_path: Vec<String>,
    text: String,
}

impl Fragment {
    fn chars(&self) -> usize {
        self.text.chars().count()
    }
}

fn common_prefix(a: &[String], b: &[String]) -> Vec<String> {
    a.iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.clone())
        .collect()
}

/// Splits documents into bounded, overlapping chunks
#[derive(Debug, Clone)]
pub struct Chunker {
    /// Hard ceiling on characters per chunk, overlap included
    max_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
    prefer_heading_boundaries: bool,
}

impl Chunker {
    pub fn new(config: &ChunkConfig) -> Self {
        let max_chars = config.max_tokens.max(1) * CHARS_PER_TOKEN;
        Self {
            max_chars,
            overlap_chars: (config.overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2),
            min_chars: config.min_tokens * CHARS_PER_TOKEN,
            prefer_heading_boundaries: config.prefer_heading_boundaries,
        }
    }

    /// Room left for a fragment once the overlap prefix and its separator are added
    fn body_limit(&self) -> usize {
        if self.overlap_chars == 0 {
            self.max_chars
        } else {
            self.max_chars - self.overlap_chars - 1
        }
    }

    /// Split a document into an ordered chunk sequence
    pub fn split(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let content = doc.raw_content.as_str();
        if content.trim().is_empty() {
            return Err(Error::ChunkInvalid {
                origin: doc.origin.clone(),
                reason: "document has no content".to_string(),
            });
        }
        if content.contains('\0') {
            return Err(Error::ChunkInvalid {
                origin: doc.origin.clone(),
                reason: "document contains NUL bytes".to_string(),
            });
        }

        let sections = match doc.kind {
            ContentKind::Markdown if self.prefer_heading_boundaries => split_sections(content),
            _ => vec![Section {
                heading_path: Vec::new(),
                text: content.to_string(),
            }],
        };

        let mut fragments = Vec::new();
        for section in &sections {
            self.split_section(section, &mut fragments);
        }
        let fragments = self.merge_undersized(fragments);

        let mut chunks = Vec::with_capacity(fragments.len());
        for (index, fragment) in fragments.iter().enumerate() {
            let text = match index.checked_sub(1).map(|i| self.overlap_tail(&fragments[i].text)) {
                Some(tail) if !tail.is_empty() => format!("{}\n{}", tail, fragment.text),
                _ => fragment.text.clone(),
            };
            chunks.push(Chunk {
                chunk_id: Chunk::compute_id(&doc.origin, &doc.content_hash, index),
                source_id: doc.source_id.clone(),
                origin: doc.origin.clone(),
                sequence_index: index,
                token_estimate: estimate_tokens(&text),
                text,
                heading_path: fragment.heading_path.clone(),
                view_url: doc.view_url.clone(),
            });
        }

        trace!(origin = %doc.origin, chunks = chunks.len(), "Split document");
        Ok(chunks)
    }

    /// Cut one section into pieces no longer than the body limit
    fn split_section(&self, section: &Section, out: &mut Vec<Fragment>) {
        let text = section.text.as_str();
        let limit = self.body_limit();
        let points = find_break_points(text);
        let code_blocks = find_code_blocks(text);
        let mut start = 0;

        while start < text.len() {
            let end = match advance_chars(text, start, limit) {
                None => text.len(),
                Some(hard_end) => {
                    // Only accept breaks in the back half so pieces stay reasonably full
                    let window_start = start + (hard_end - start) / 2;
                    best_break(&points, &code_blocks, window_start, hard_end).unwrap_or(hard_end)
                }
            };

            let piece = text[start..end].trim();
            if !piece.is_empty() {
                out.push(Fragment {
                    heading_path: section.heading_path.clone(),
                    text: piece.to_string(),
                });
            }
            start = end;
        }
    }

    /// Join adjacent fragments when either is below the minimum and the result still fits
    fn merge_undersized(&self, fragments: Vec<Fragment>) -> Vec<Fragment> {
        let limit = self.body_limit();
        let mut merged: Vec<Fragment> = Vec::with_capacity(fragments.len());

        for fragment in fragments {
            if let Some(last) = merged.last_mut() {
                let undersized = last.chars() < self.min_chars || fragment.chars() < self.min_chars;
                if undersized && last.chars() + 2 + fragment.chars() <= limit {
                    last.text = format!("{}\n\n{}", last.text, fragment.text);
                    last.heading_path = common_prefix(&last.heading_path, &fragment.heading_path);
                    continue;
                }
            }
            merged.push(fragment);
        }
        merged
    }

    /// Last `overlap_chars` characters of `text`, starting at a word boundary
    fn overlap_tail(&self, text: &str) -> String {
        if self.overlap_chars == 0 {
            return String::new();
        }
        let total = text.chars().count();
        if total <= self.overlap_chars {
            return text.trim().to_string();
        }
        let start = advance_chars(text, 0, total - self.overlap_chars).unwrap_or(text.len());
        let tail = &text[start..];
        match tail.find(char::is_whitespace) {
            Some(ws) if !tail[ws..].trim().is_empty() => tail[ws..].trim().to_string(),
            _ => tail.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_doc(text: &str) -> SourceDocument {
        SourceDocument {
            source_id: "src-1".to_string(),
            origin: "github.com/acme/docs/guide.md".to_string(),
            title: None,
            raw_content: text.to_string(),
            content_hash: compute_text_hash(text),
            fetched_at: Utc::now(),
            view_url: Some("https://github.com/acme/docs/blob/main/guide.md".to_string()),
            kind: ContentKind::Markdown,
        }
    }

    fn chunker(max_tokens: usize, overlap_tokens: usize, min_tokens: usize) -> Chunker {
        Chunker::new(&ChunkConfig {
            max_tokens,
            overlap_tokens,
            min_tokens,
            prefer_heading_boundaries: true,
        })
    }

    #[test]
    fn test_chunk_short_document() {
        let chunks = chunker(500, 50, 25)
            .split(&make_doc("This is a short document."))
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "This is a short document.");
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].token_estimate, 7);
    }

    #[test]
    fn test_chunk_long_document_respects_ceiling() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(200);
        let chunks = chunker(100, 10, 5).split(&make_doc(&text)).unwrap();

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_estimate <= 100, "chunk too large: {}", chunk.token_estimate);
            assert!(chunk.text.chars().count() <= 400);
        }
        // Sentence breaks are preferred over word breaks
        assert!(chunks[0].text.ends_with('.'));
    }

    #[test]
    fn test_chunks_overlap_previous() {
        let text = "alpha beta gamma delta. ".repeat(100);
        let chunks = chunker(60, 10, 5).split(&make_doc(&text)).unwrap();
        assert!(chunks.len() > 2);

        let tail = chunks[1].text.split('\n').next().unwrap();
        assert!(!tail.is_empty());
        assert!(tail.chars().count() <= 40);
        assert!(chunks[0].text.ends_with(tail));
    }

    #[test]
    fn test_chunk_determinism() {
        let text = "# Title\n\nSome content here.\n\n## Section\n\nMore content. ".repeat(30);
        let chunker = chunker(80, 8, 10);
        let first = chunker.split(&make_doc(&text)).unwrap();
        let second = chunker.split(&make_doc(&text)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_chunk_ids_depend_on_content_hash() {
        let chunker = chunker(500, 50, 25);
        let a = chunker.split(&make_doc("Version one of the page.")).unwrap();
        let b = chunker.split(&make_doc("Version two of the page.")).unwrap();
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn test_heading_paths_and_merging() {
        let text = "# Guide\n\n## Install\n\nRun the installer and follow every prompt until it finishes.\n\n## Usage\n\nCall the tool with a config file and watch the output carefully.\n";
        let chunks = chunker(500, 0, 5).split(&make_doc(text)).unwrap();

        // The bare "# Guide" section is merged into the next one
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].heading_path, vec!["Guide".to_string()]);
        assert!(chunks[0].text.starts_with("# Guide"));
        assert_eq!(
            chunks[1].heading_path,
            vec!["Guide".to_string(), "Usage".to_string()]
        );
    }

    #[test]
    fn test_code_blocks_are_not_split() {
        let code = format!("```\n{}\n```", "let x = 1;\n".repeat(8));
        let text = format!("{}\n\n{}\n\n{}", "Intro words here. ".repeat(6), code, "Outro words. ".repeat(6));
        let chunks = chunker(60, 0, 1).split(&make_doc(&text)).unwrap();
        let fences: usize = chunks.iter().map(|c| c.text.matches("```").count()).sum();
        assert_eq!(fences, 2);
        assert!(chunks.iter().any(|c| c.text.matches("```").count() == 2));
    }

    #[test]
    fn test_invalid_content() {
        let chunker = chunker(500, 50, 25);
        assert!(matches!(
            chunker.split(&make_doc("   \n")),
            Err(Error::ChunkInvalid { .. })
        ));
        assert!(matches!(
            chunker.split(&make_doc("bad\0bytes")),
            Err(Error::ChunkInvalid { .. })
        ));
    }

    #[test]
    fn test_content_hash() {
        let hash1 = compute_text_hash("hello world");
        let hash2 = compute_text_hash("hello world");
        let hash3 = compute_text_hash("different content");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }
}
