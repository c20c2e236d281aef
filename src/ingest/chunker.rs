//! Recursive separator splitting of page text into overlapping chunks.
//!
//! Pieces are tracked as byte spans over the page text and separators stay
//! attached to the piece that follows them, so every chunk is an exact slice
//! of the normalized page and consecutive chunks overlap only by shared tail.

use std::collections::VecDeque;

use crate::error::IngestError;
use crate::models::{source_tag, Chunk, Document, DocumentMetadata, Page};

pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Upper bound on chunk length, in characters.
    pub max_chunk_size: usize,
    /// Upper bound on the tail carried into the next chunk, in characters.
    pub overlap: usize,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1_000,
            overlap: 200,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

#[derive(Clone, Debug)]
pub struct DocumentChunker {
    config: ChunkingConfig,
}

impl DocumentChunker {
    pub fn new(mut config: ChunkingConfig) -> Result<Self, IngestError> {
        if config.max_chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_chunk_size must be positive".to_string(),
            ));
        }
        if config.overlap >= config.max_chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap ({}) must be smaller than max_chunk_size ({})",
                config.overlap, config.max_chunk_size
            )));
        }

        // Hard character cut is always the last resort.
        if config.separators.last().map(String::as_str) != Some("") {
            config.separators.push(String::new());
        }

        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        document
            .pages
            .iter()
            .flat_map(|page| self.chunk_page(page, &document.metadata))
            .collect()
    }

    pub fn chunk_page(&self, page: &Page, metadata: &DocumentMetadata) -> Vec<Chunk> {
        let text = page.text.as_str();
        if text.trim().is_empty() {
            return Vec::new();
        }
        let whole = Span {
            start: 0,
            end: text.len(),
        };

        self.split_span(text, whole, &self.config.separators)
            .into_iter()
            .enumerate()
            .map(|(chunk_index, span)| Chunk {
                content: text[span.start..span.end].to_string(),
                page_index: page.index,
                chunk_index,
                source_tag: source_tag(page.index, chunk_index),
                start_offset: span.start,
                metadata: metadata.clone(),
            })
            .collect()
    }

    fn split_span(&self, text: &str, span: Span, separators: &[String]) -> Vec<Span> {
        let slice = &text[span.start..span.end];

        let mut separator = "";
        let mut remaining: &[String] = &[];
        for (i, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                break;
            }
            if slice.contains(candidate.as_str()) {
                separator = candidate.as_str();
                remaining = &separators[i + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut fitting: Vec<(Span, usize)> = Vec::new();

        for piece in split_keeping_separator(text, span, separator) {
            let len = char_len(text, piece);
            if len <= self.config.max_chunk_size {
                fitting.push((piece, len));
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge_pieces(&fitting));
                fitting.clear();
            }
            // A piece can only be oversized when the separator was non-empty,
            // and the empty separator is always left in `remaining`.
            chunks.extend(self.split_span(text, piece, remaining));
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge_pieces(&fitting));
        }

        chunks
    }

    fn merge_pieces(&self, pieces: &[(Span, usize)]) -> Vec<Span> {
        let max = self.config.max_chunk_size;
        let overlap = self.config.overlap;

        let mut merged = Vec::new();
        let mut window: VecDeque<(Span, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &(piece, len) in pieces {
            if total + len > max {
                if let Some(span) = window_span(&window) {
                    merged.push(span);
                }
                while total > overlap || (total > 0 && total + len > max) {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }
            window.push_back((piece, len));
            total += len;
        }

        if let Some(span) = window_span(&window) {
            merged.push(span);
        }

        merged
    }
}

/// Chunks `document` with the given limits and separator priority list.
pub fn chunk_document(
    document: &Document,
    max_chunk_size: usize,
    overlap: usize,
    separators: &[&str],
) -> Result<Vec<Chunk>, IngestError> {
    let chunker = DocumentChunker::new(ChunkingConfig {
        max_chunk_size,
        overlap,
        separators: separators.iter().map(|s| s.to_string()).collect(),
    })?;
    Ok(chunker.chunk(document))
}

fn window_span(window: &VecDeque<(Span, usize)>) -> Option<Span> {
    let first = window.front()?;
    let last = window.back()?;
    Some(Span {
        start: first.0.start,
        end: last.0.end,
    })
}

fn char_len(text: &str, span: Span) -> usize {
    text[span.start..span.end].chars().count()
}

/// Splits `span` before every occurrence of `separator`; empty separator
/// yields one span per character. Empty pieces are dropped.
fn split_keeping_separator(text: &str, span: Span, separator: &str) -> Vec<Span> {
    let slice = &text[span.start..span.end];

    if separator.is_empty() {
        return slice
            .char_indices()
            .map(|(offset, ch)| Span {
                start: span.start + offset,
                end: span.start + offset + ch.len_utf8(),
            })
            .collect();
    }

    let mut pieces = Vec::new();
    let mut piece_start = 0;
    for (offset, _) in slice.match_indices(separator) {
        if offset > piece_start {
            pieces.push(Span {
                start: span.start + piece_start,
                end: span.start + offset,
            });
        }
        piece_start = offset;
    }
    if slice.len() > piece_start {
        pieces.push(Span {
            start: span.start + piece_start,
            end: span.end,
        });
    }

    pieces
}
